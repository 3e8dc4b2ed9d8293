//! In-memory block document.
//!
//! [`BlockDocument`] is the reference [`DocumentModel`]: an ordered list of
//! [`ContentBlock`]s with a caret and a broadcast channel of
//! [`DocumentEvent`]s. The CLI and the test suites run against it; an
//! embedding editor supplies its own model instead.
//!
//! # Notifications
//!
//! Outside a scoped edit each mutation is published immediately as
//! [`DocumentEvent::Changed`]. Inside one, changes are buffered and published
//! once as [`DocumentEvent::Batch`] when the outermost scope closes, so
//! listeners never observe half-applied transforms. Caret moves inside a
//! scope are not published at all.

use tokio::sync::broadcast;
use tracing::trace;

use crate::model::DocumentModel;
use crate::{BlockId, ContentBlock, CoreError, Result};

/// Capacity of the document event broadcast channel.
pub const DOCUMENT_EVENT_CAPACITY: usize = 256;

/// One structural or content change to the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockChange {
    Inserted { id: BlockId, index: usize },
    Removed { id: BlockId, index: usize },
    Replaced { id: BlockId },
}

/// Events published to document subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// A single change made outside any scoped edit.
    Changed(BlockChange),
    /// Every change made during one scoped edit, in order.
    Batch(Vec<BlockChange>),
    /// The caret moved outside a scoped edit.
    CaretMoved(usize),
}

pub struct BlockDocument {
    blocks: Vec<ContentBlock>,
    caret: usize,
    scope_depth: u32,
    pending: Vec<BlockChange>,
    events: broadcast::Sender<DocumentEvent>,
    /// Bumped on every mutation.
    version: u64,
}

impl Default for BlockDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDocument {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DOCUMENT_EVENT_CAPACITY);
        Self {
            blocks: Vec::new(),
            caret: 0,
            scope_depth: 0,
            pending: Vec::new(),
            events,
            version: 0,
        }
    }

    /// Build a document from already-parsed blocks, rejecting duplicates.
    pub fn from_blocks(blocks: impl IntoIterator<Item = ContentBlock>) -> Result<Self> {
        let mut doc = Self::new();
        for block in blocks {
            if doc.find_block_index(block.id).is_some() {
                return Err(CoreError::DuplicateBlock(block.id));
            }
            doc.blocks.push(block);
        }
        Ok(doc)
    }

    /// Parse serialized blocks into a document.
    pub fn from_xml<S: Into<String>>(xml: impl IntoIterator<Item = S>) -> Result<Self> {
        let blocks = xml
            .into_iter()
            .map(|s| ContentBlock::parse(s).map_err(CoreError::from))
            .collect::<Result<Vec<_>>>()?;
        Self::from_blocks(blocks)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        &self.blocks
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn in_scoped_edit(&self) -> bool {
        self.scope_depth > 0
    }

    /// Run text of all blocks, one line per block.
    pub fn full_text(&self) -> String {
        self.blocks
            .iter()
            .map(ContentBlock::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn publish(&mut self, change: BlockChange) {
        self.version += 1;
        if self.scope_depth > 0 {
            self.pending.push(change);
        } else {
            // No subscribers is fine.
            let _ = self.events.send(DocumentEvent::Changed(change));
        }
    }
}

impl DocumentModel for BlockDocument {
    fn insert_block_at(&mut self, index: usize, block: ContentBlock) -> Result<BlockId> {
        if index > self.blocks.len() {
            return Err(CoreError::IndexOutOfBounds { index, len: self.blocks.len() });
        }
        if self.find_block_index(block.id).is_some() {
            return Err(CoreError::DuplicateBlock(block.id));
        }
        let id = block.id;
        self.blocks.insert(index, block);
        self.publish(BlockChange::Inserted { id, index });
        Ok(id)
    }

    fn remove_block(&mut self, id: BlockId) -> Result<ContentBlock> {
        let index = self.find_block_index(id).ok_or(CoreError::BlockNotFound(id))?;
        let block = self.blocks.remove(index);
        self.publish(BlockChange::Removed { id, index });
        Ok(block)
    }

    fn replace_block(&mut self, block: ContentBlock) -> Result<ContentBlock> {
        let id = block.id;
        let index = self.find_block_index(id).ok_or(CoreError::BlockNotFound(id))?;
        let old = std::mem::replace(&mut self.blocks[index], block);
        self.publish(BlockChange::Replaced { id });
        Ok(old)
    }

    fn find_block_index(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    fn block_at(&self, index: usize) -> Option<&ContentBlock> {
        self.blocks.get(index)
    }

    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn begin_scoped_edit(&mut self) {
        self.scope_depth += 1;
        trace!(depth = self.scope_depth, "document write lock acquired");
    }

    fn end_scoped_edit(&mut self) {
        self.scope_depth = self.scope_depth.saturating_sub(1);
        trace!(depth = self.scope_depth, "document write lock released");
        if self.scope_depth == 0 && !self.pending.is_empty() {
            let batch = std::mem::take(&mut self.pending);
            let _ = self.events.send(DocumentEvent::Batch(batch));
        }
    }

    fn caret(&self) -> usize {
        self.caret
    }

    fn set_caret(&mut self, offset: usize) {
        let offset = offset.min(DocumentModel::len(self));
        if offset == self.caret {
            return;
        }
        self.caret = offset;
        if self.scope_depth == 0 {
            let _ = self.events.send(DocumentEvent::CaretMoved(offset));
        }
    }

    fn len(&self) -> usize {
        self.blocks.iter().map(ContentBlock::caret_len).sum()
    }

    fn block_start_offset(&self, index: usize) -> usize {
        self.blocks.iter().take(index).map(ContentBlock::caret_len).sum()
    }
}
