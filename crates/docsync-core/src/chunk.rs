//! State chunks: last-synchronized snapshots of single blocks.
//!
//! A chunk records what the server last saw for one block. Comparing it with
//! the live document tells us what to push; rewriting it with a rule set
//! (accept/reject tracked changes) keeps the baseline in step with remote
//! decisions. Chunks never look at the live document: they work on their own
//! serialized copy only.
//!
//! Chunks are immutable. Every rewrite returns a fresh chunk that supersedes
//! the old one in the [`Package`](crate::Package).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MarkupError;
use crate::markup::{self, ACCEPT_CHANGES, REJECT_CHANGES, RuleSet};
use crate::{BlockId, ContentBlock};

/// Element names that mark tracked insertions and deletions.
const TRACKED_CHANGE_ELEMENTS: [&str; 3] = ["w:ins", "w:del", "w:delText"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChunk {
    id: BlockId,
    xml: String,
}

impl StateChunk {
    pub fn new(id: BlockId, xml: impl Into<String>) -> Self {
        Self { id, xml: xml.into() }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// True when the snapshot carries insertion or deletion markup.
    pub fn contains_tracked_changes(&self) -> bool {
        markup::element_names(&self.xml).any(|name| TRACKED_CHANGE_ELEMENTS.contains(&name))
    }

    /// Whether `xml` differs from this snapshot.
    pub fn differs_from(&self, xml: &str) -> bool {
        self.xml != xml
    }

    pub fn accept_tracked_changes(&self) -> Result<StateChunk, MarkupError> {
        self.rewrite(&ACCEPT_CHANGES)
    }

    pub fn reject_tracked_changes(&self) -> Result<StateChunk, MarkupError> {
        self.rewrite(&REJECT_CHANGES)
    }

    /// Produce the successor chunk under `rules`.
    pub fn rewrite(&self, rules: &RuleSet) -> Result<StateChunk, MarkupError> {
        debug!(block_id = %self.id, rules = rules.name, "In: {}", self.xml);
        let xml = rules.apply(&self.xml)?;
        debug!(block_id = %self.id, rules = rules.name, "Transformed: {}", xml);
        Ok(StateChunk { id: self.id, xml })
    }
}

impl From<&ContentBlock> for StateChunk {
    fn from(block: &ContentBlock) -> Self {
        StateChunk::new(block.id, block.xml.clone())
    }
}
