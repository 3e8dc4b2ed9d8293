//! Tag-level scanning of serialized block markup and declarative rewrite rules.
//!
//! Serialized blocks are WordprocessingML fragments. Nothing here builds a
//! tree: the scanner walks tags left to right, checks that elements balance,
//! and hands each token to a visitor. Rule sets are static tables mapping an
//! element name to a [`RuleAction`]; applying one is a single scan.
//!
//! # Tracked changes
//!
//! | Element                | Accept   | Reject            |
//! |------------------------|----------|-------------------|
//! | `w:ins`                | unwrap   | drop              |
//! | `w:del`                | drop     | unwrap            |
//! | `w:delText`            | (gone)   | rename → `w:t`    |
//! | `w:delInstrText`       | (gone)   | rename → `w:instrText` |
//! | `w:moveTo`             | unwrap   | drop              |
//! | `w:moveFrom`           | drop     | unwrap            |
//! | `w:rPrChange` etc.     | drop     | drop              |

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::MarkupError;

/// Open, close and empty-element tags. Processing instructions and comments
/// never match because the name must start with a letter or underscore.
static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(/?)([A-Za-z_][\w.\-]*(?::[\w.\-]+)?)((?:\s+[^<>]*?)?)\s*(/?)>")
        .expect("tag pattern is valid")
});

/// One lexical piece of a serialized fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    Text(&'a str),
    Open {
        name: &'a str,
        attrs: &'a str,
        raw: &'a str,
        depth: usize,
    },
    Close {
        name: &'a str,
        raw: &'a str,
        depth: usize,
    },
    Empty {
        name: &'a str,
        attrs: &'a str,
        raw: &'a str,
        depth: usize,
    },
}

/// Walk `xml`, calling `visit` for every token.
///
/// `depth` is the nesting level of the element itself, so a matching
/// `Open`/`Close` pair reports the same depth.
pub(crate) fn scan<'a>(
    xml: &'a str,
    mut visit: impl FnMut(Token<'a>),
) -> Result<(), MarkupError> {
    let mut stack: Vec<&'a str> = Vec::new();
    let mut cursor = 0;

    for caps in TAG.captures_iter(xml) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > cursor {
            visit(Token::Text(&xml[cursor..whole.start()]));
        }
        cursor = whole.end();

        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let self_closing = caps.get(4).is_some_and(|m| !m.as_str().is_empty());
        let name = caps.get(2).map_or("", |m| m.as_str());
        let attrs = caps.get(3).map_or("", |m| m.as_str());
        let raw = whole.as_str();

        if closing {
            match stack.pop() {
                Some(open) if open == name => visit(Token::Close {
                    name,
                    raw,
                    depth: stack.len(),
                }),
                Some(open) => {
                    return Err(MarkupError::MismatchedClose {
                        expected: open.to_string(),
                        found: name.to_string(),
                    });
                }
                None => return Err(MarkupError::UnexpectedClose(name.to_string())),
            }
        } else if self_closing {
            visit(Token::Empty {
                name,
                attrs,
                raw,
                depth: stack.len(),
            });
        } else {
            visit(Token::Open {
                name,
                attrs,
                raw,
                depth: stack.len(),
            });
            stack.push(name);
        }
    }

    if cursor < xml.len() {
        visit(Token::Text(&xml[cursor..]));
    }
    match stack.pop() {
        Some(open) => Err(MarkupError::Unclosed(open.to_string())),
        None => Ok(()),
    }
}

/// Names of every element (open or empty) in `xml`, balanced or not.
pub(crate) fn element_names(xml: &str) -> impl Iterator<Item = &str> {
    TAG.captures_iter(xml).filter_map(|caps| {
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        if closing { None } else { caps.get(2).map(|m| m.as_str()) }
    })
}

/// What a rule does to a matching element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Copy the element through unchanged.
    Keep,
    /// Remove the element and everything inside it.
    Drop,
    /// Remove the element's own tags, keep its content.
    Unwrap,
    /// Keep attributes and content under a different element name.
    Rename(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub element: &'static str,
    pub action: RuleAction,
}

const fn rule(element: &'static str, action: RuleAction) -> Rule {
    Rule { element, action }
}

/// A named, static table of element rules. Unlisted elements are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSet {
    pub name: &'static str,
    pub rules: &'static [Rule],
}

/// Property-change records carry the pre-edit formatting; both accept and
/// reject discard them (reject keeps current formatting).
const PROPERTY_CHANGES: [&str; 6] = [
    "w:rPrChange",
    "w:pPrChange",
    "w:sectPrChange",
    "w:tblPrChange",
    "w:trPrChange",
    "w:tcPrChange",
];

/// Accept all tracked changes.
pub const ACCEPT_CHANGES: RuleSet = RuleSet {
    name: "accept-changes",
    rules: &[
        rule("w:ins", RuleAction::Unwrap),
        rule("w:del", RuleAction::Drop),
        rule("w:moveTo", RuleAction::Unwrap),
        rule("w:moveFrom", RuleAction::Drop),
        rule("w:moveFromRangeStart", RuleAction::Drop),
        rule("w:moveFromRangeEnd", RuleAction::Drop),
        rule("w:moveToRangeStart", RuleAction::Drop),
        rule("w:moveToRangeEnd", RuleAction::Drop),
        rule(PROPERTY_CHANGES[0], RuleAction::Drop),
        rule(PROPERTY_CHANGES[1], RuleAction::Drop),
        rule(PROPERTY_CHANGES[2], RuleAction::Drop),
        rule(PROPERTY_CHANGES[3], RuleAction::Drop),
        rule(PROPERTY_CHANGES[4], RuleAction::Drop),
        rule(PROPERTY_CHANGES[5], RuleAction::Drop),
    ],
};

/// Reject all tracked changes.
pub const REJECT_CHANGES: RuleSet = RuleSet {
    name: "reject-changes",
    rules: &[
        rule("w:ins", RuleAction::Drop),
        rule("w:del", RuleAction::Unwrap),
        rule("w:delText", RuleAction::Rename("w:t")),
        rule("w:delInstrText", RuleAction::Rename("w:instrText")),
        rule("w:moveTo", RuleAction::Drop),
        rule("w:moveFrom", RuleAction::Unwrap),
        rule("w:moveFromRangeStart", RuleAction::Drop),
        rule("w:moveFromRangeEnd", RuleAction::Drop),
        rule("w:moveToRangeStart", RuleAction::Drop),
        rule("w:moveToRangeEnd", RuleAction::Drop),
        rule(PROPERTY_CHANGES[0], RuleAction::Drop),
        rule(PROPERTY_CHANGES[1], RuleAction::Drop),
        rule(PROPERTY_CHANGES[2], RuleAction::Drop),
        rule(PROPERTY_CHANGES[3], RuleAction::Drop),
        rule(PROPERTY_CHANGES[4], RuleAction::Drop),
        rule(PROPERTY_CHANGES[5], RuleAction::Drop),
    ],
};

impl RuleSet {
    pub fn action_for(&self, element: &str) -> RuleAction {
        self.rules
            .iter()
            .find(|r| r.element == element)
            .map_or(RuleAction::Keep, |r| r.action)
    }

    /// Rewrite `xml` according to this rule set.
    pub fn apply(&self, xml: &str) -> Result<String, MarkupError> {
        let mut out = String::with_capacity(xml.len());
        // Depth of the element currently being dropped, if any.
        let mut dropping: Option<usize> = None;

        scan(xml, |token| match token {
            Token::Text(text) => {
                if dropping.is_none() {
                    out.push_str(text);
                }
            }
            Token::Open { name, attrs, raw, depth } => {
                if dropping.is_some() {
                    return;
                }
                match self.action_for(name) {
                    RuleAction::Keep => out.push_str(raw),
                    RuleAction::Drop => dropping = Some(depth),
                    RuleAction::Unwrap => {}
                    RuleAction::Rename(to) => {
                        let _ = write!(out, "<{to}{attrs}>");
                    }
                }
            }
            Token::Close { name, raw, depth } => {
                if let Some(d) = dropping {
                    if d == depth {
                        dropping = None;
                    }
                    return;
                }
                match self.action_for(name) {
                    RuleAction::Keep => out.push_str(raw),
                    RuleAction::Drop | RuleAction::Unwrap => {}
                    RuleAction::Rename(to) => {
                        let _ = write!(out, "</{to}>");
                    }
                }
            }
            Token::Empty { name, attrs, raw, .. } => {
                if dropping.is_some() {
                    return;
                }
                match self.action_for(name) {
                    RuleAction::Keep => out.push_str(raw),
                    RuleAction::Drop | RuleAction::Unwrap => {}
                    RuleAction::Rename(to) => {
                        let _ = write!(out, "<{to}{attrs}/>");
                    }
                }
            }
        })?;

        Ok(out)
    }
}

/// Concatenated run text (`<w:t>` content) of a fragment.
pub fn visible_text(xml: &str) -> Result<String, MarkupError> {
    let mut text = String::new();
    let mut inside: Option<usize> = None;
    scan(xml, |token| match token {
        Token::Open { name: "w:t", depth, .. } if inside.is_none() => inside = Some(depth),
        Token::Close { name: "w:t", depth, .. } if inside == Some(depth) => inside = None,
        Token::Empty { name: "w:tab", .. } if inside.is_none() => text.push('\t'),
        Token::Empty { name: "w:br", .. } if inside.is_none() => text.push('\n'),
        Token::Text(t) if inside.is_some() => text.push_str(t),
        _ => {}
    })?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDITED: &str = concat!(
        r#"<w:p><w:r><w:t>Hello </w:t></w:r>"#,
        r#"<w:del w:id="1" w:author="amy"><w:r><w:delText>world</w:delText></w:r></w:del>"#,
        r#"<w:ins w:id="2" w:author="amy"><w:r><w:t>there</w:t></w:r></w:ins></w:p>"#,
    );

    #[test]
    fn test_scan_rejects_unbalanced() {
        assert!(matches!(
            scan("<w:p><w:r></w:p>", |_| {}),
            Err(MarkupError::MismatchedClose { .. })
        ));
        assert!(matches!(scan("</w:p>", |_| {}), Err(MarkupError::UnexpectedClose(_))));
        assert!(matches!(scan("<w:p>", |_| {}), Err(MarkupError::Unclosed(_))));
    }

    #[test]
    fn test_scan_distinguishes_prefix_names() {
        let names: Vec<_> = element_names(r#"<w:tab/><w:t xml:space="preserve">a</w:t>"#).collect();
        assert_eq!(names, vec!["w:tab", "w:t"]);
    }

    #[test]
    fn test_accept_drops_deletions_and_unwraps_insertions() {
        let out = ACCEPT_CHANGES.apply(EDITED).unwrap();
        assert_eq!(
            out,
            "<w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>there</w:t></w:r></w:p>"
        );
        assert_eq!(visible_text(&out).unwrap(), "Hello there");
    }

    #[test]
    fn test_reject_restores_deleted_text() {
        let out = REJECT_CHANGES.apply(EDITED).unwrap();
        assert_eq!(
            out,
            "<w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>"
        );
        assert_eq!(visible_text(&out).unwrap(), "Hello world");
    }

    #[test]
    fn test_nested_drop_skips_inner_elements() {
        let xml = "<w:p><w:del><w:del><w:r/></w:del><w:r/></w:del><w:r/></w:p>";
        assert_eq!(ACCEPT_CHANGES.apply(xml).unwrap(), "<w:p><w:r/></w:p>");
    }

    #[test]
    fn test_property_changes_are_dropped_either_way() {
        let xml = r#"<w:rPr><w:b/><w:rPrChange w:id="3"><w:rPr/></w:rPrChange></w:rPr>"#;
        assert_eq!(ACCEPT_CHANGES.apply(xml).unwrap(), "<w:rPr><w:b/></w:rPr>");
        assert_eq!(REJECT_CHANGES.apply(xml).unwrap(), "<w:rPr><w:b/></w:rPr>");
    }

    #[test]
    fn test_visible_text_handles_tabs_and_breaks() {
        let xml = "<w:r><w:t>a</w:t><w:tab/><w:t>b</w:t><w:br/></w:r>";
        assert_eq!(visible_text(xml).unwrap(), "a\tb\n");
    }
}
