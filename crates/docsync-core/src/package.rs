//! Baseline store: the server's last-known view of every live block.

use std::collections::BTreeMap;

use crate::{BlockId, StateChunk};

/// Mapping from block identity to its current [`StateChunk`].
///
/// A block present here has round-tripped with the server at least once.
/// Entries are superseded wholesale; a chunk is never edited in place.
#[derive(Debug, Clone, Default)]
pub struct Package {
    chunks: BTreeMap<BlockId, StateChunk>,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a package from chunks, e.g. after a fresh document load.
    pub fn from_chunks(chunks: impl IntoIterator<Item = StateChunk>) -> Self {
        Self {
            chunks: chunks.into_iter().map(|c| (c.id(), c)).collect(),
        }
    }

    pub fn get(&self, id: BlockId) -> Option<&StateChunk> {
        self.chunks.get(&id)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.chunks.contains_key(&id)
    }

    /// Store `chunk` under its own identity, returning the one it supersedes.
    pub fn put(&mut self, chunk: StateChunk) -> Option<StateChunk> {
        self.chunks.insert(chunk.id(), chunk)
    }

    pub fn remove(&mut self, id: BlockId) -> Option<StateChunk> {
        self.chunks.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.chunks.keys().copied()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &StateChunk> {
        self.chunks.values()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}
