//! On-disk formats the CLI reads and writes.
//!
//! A document file is JSON: the serialized blocks in order plus the
//! watermark they reflect.
//!
//! ```json
//! { "watermark": 12, "blocks": ["<w:sdt>...</w:sdt>", "..."] }
//! ```
//!
//! A transform log is a JSON array of wire-format transforms.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use docsync_core::{BlockDocument, DocumentModel, Seq, Transform};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFile {
    #[serde(default)]
    pub watermark: Seq,
    pub blocks: Vec<String>,
}

impl DocumentFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing document {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))
    }

    pub fn snapshot(document: &BlockDocument, watermark: Seq) -> Self {
        Self {
            watermark,
            blocks: document.blocks().iter().map(|b| b.xml.clone()).collect(),
        }
    }

    pub fn to_document(&self) -> Result<BlockDocument> {
        Ok(BlockDocument::from_xml(self.blocks.iter().cloned())?)
    }
}

pub fn load_transforms(path: &Path) -> Result<Vec<Transform>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing transform log {}", path.display()))
}

/// One line per block: identity and run text.
pub fn outline(document: &BlockDocument) -> String {
    let mut out = String::new();
    for index in 0..document.block_count() {
        if let Some(block) = document.block_at(index) {
            out.push_str(&format!("{:>4}  {}\n", block.id.get(), block.text()));
        }
    }
    out
}
