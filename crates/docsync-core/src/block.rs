//! Content blocks: the unit of synchronization.
//!
//! A block is a serialized structured-document tag (`<w:sdt>`) whose
//! properties carry the server-assigned identity:
//!
//! ```text
//! <w:sdt>
//!   <w:sdtPr><w:id w:val="42"/></w:sdtPr>
//!   <w:sdtContent> ... paragraphs ... </w:sdtContent>
//! </w:sdt>
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::markup::{self, Token};
use crate::BlockId;

static BLOCK_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<w:sdtPr\b[^>]*>.*?<w:id\s+w:val\s*=\s*"([^"]*)""#)
        .expect("block id pattern is valid")
});

/// One block of the document, identity plus serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: BlockId,
    pub xml: String,
}

impl ContentBlock {
    /// Parse a serialized block, extracting its identity.
    ///
    /// The fragment must be a single balanced `<w:sdt>` element.
    pub fn parse(xml: impl Into<String>) -> Result<Self, PayloadError> {
        let xml = xml.into();
        let trimmed = xml.trim();
        if trimmed.is_empty() {
            return Err(PayloadError::Empty);
        }

        let mut root: Option<&str> = None;
        let mut roots = 0usize;
        markup::scan(trimmed, |token| match token {
            Token::Open { name, depth: 0, .. } | Token::Empty { name, depth: 0, .. } => {
                if root.is_none() {
                    root = Some(name);
                }
                roots += 1;
            }
            _ => {}
        })?;
        if root != Some("w:sdt") || roots != 1 {
            return Err(PayloadError::NotABlock);
        }

        let raw_id = BLOCK_ID
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .ok_or(PayloadError::MissingId)?;
        let id = raw_id
            .parse::<BlockId>()
            .map_err(|_| PayloadError::InvalidId(raw_id.to_string()))?;

        Ok(Self { id, xml })
    }

    /// Parse and require the payload to carry `expected` as its identity.
    pub fn parse_for(expected: BlockId, xml: impl Into<String>) -> Result<Self, PayloadError> {
        let block = Self::parse(xml)?;
        if block.id != expected {
            return Err(PayloadError::IdMismatch { expected, got: block.id });
        }
        Ok(block)
    }

    /// Build a minimal block holding one paragraph of plain text.
    pub fn from_text(id: BlockId, text: &str) -> Self {
        let xml = format!(
            concat!(
                r#"<w:sdt><w:sdtPr><w:id w:val="{}"/></w:sdtPr>"#,
                r#"<w:sdtContent><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:sdtContent></w:sdt>"#,
            ),
            id,
            escape_text(text)
        );
        Self { id, xml }
    }

    /// Run text of this block.
    pub fn text(&self) -> String {
        markup::visible_text(&self.xml).unwrap_or_default()
    }

    /// Length of this block in caret units (run text characters plus one
    /// paragraph break).
    pub fn caret_len(&self) -> usize {
        self.text().chars().count() + 1
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}
