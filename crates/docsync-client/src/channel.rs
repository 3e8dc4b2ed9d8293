//! The server channel seam.
//!
//! [`ServerChannel`] is the only async surface the reconciliation side
//! depends on: pull transforms past a watermark, push local changes. HTTP
//! polling, authentication and the rest of the transport live behind it.
//! [`MemoryChannel`] is an in-process server used by the CLI's tests and the
//! integration suite.

use std::sync::Arc;

use async_trait::async_trait;
use docsync_core::{BlockId, Seq, Transform};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Errors from the server channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A local edit the server has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LocalChange {
    /// A block the baseline doesn't know, at its baseline position.
    Insert {
        block_id: BlockId,
        position: usize,
        content: String,
    },
    /// A known block whose content differs from its state chunk.
    Update { block_id: BlockId, content: String },
    /// A known block no longer in the document.
    Delete { block_id: BlockId },
}

impl LocalChange {
    pub fn block_id(&self) -> BlockId {
        match self {
            LocalChange::Insert { block_id, .. }
            | LocalChange::Update { block_id, .. }
            | LocalChange::Delete { block_id } => *block_id,
        }
    }

    /// Inserts and deletes shift baseline positions; updates don't.
    pub fn is_structural(&self) -> bool {
        !matches!(self, LocalChange::Update { .. })
    }
}

/// Server reply to a push: which blocks it took.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub accepted: Vec<BlockId>,
}

impl PushAck {
    /// Acknowledge every change in `changes`.
    pub fn all(changes: &[LocalChange]) -> Self {
        Self { accepted: changes.iter().map(LocalChange::block_id).collect() }
    }

    pub fn accepts(&self, id: BlockId) -> bool {
        self.accepted.contains(&id)
    }
}

/// Transport to the collaboration server.
#[async_trait]
pub trait ServerChannel: Send + Sync + 'static {
    /// Transforms with a sequence number above `watermark`. Order is not
    /// guaranteed; callers sort.
    async fn fetch_transforms_since(&self, watermark: Seq) -> Result<Vec<Transform>, ChannelError>;

    async fn push_local_changes(&self, changes: &[LocalChange]) -> Result<PushAck, ChannelError>;
}

#[derive(Default)]
struct MemoryState {
    log: Vec<Transform>,
    pushes: Vec<Vec<LocalChange>>,
    rejected: Vec<BlockId>,
    fetches: usize,
    failing_fetches: usize,
    failing_pushes: usize,
}

/// In-memory server. Clones share state, so a test can keep a handle and
/// publish transforms while a session polls another.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transform to the server log.
    pub fn publish(&self, transform: Transform) {
        self.state.lock().log.push(transform);
    }

    pub fn publish_all(&self, transforms: impl IntoIterator<Item = Transform>) {
        self.state.lock().log.extend(transforms);
    }

    /// Every push received so far, oldest first.
    pub fn pushes(&self) -> Vec<Vec<LocalChange>> {
        self.state.lock().pushes.clone()
    }

    /// Number of fetch calls, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_fetches(&self, n: usize) {
        self.state.lock().failing_fetches = n;
    }

    /// Fail the next `n` pushes with a transport error.
    pub fn fail_pushes(&self, n: usize) {
        self.state.lock().failing_pushes = n;
    }

    /// Leave changes to `id` out of future acks.
    pub fn reject_block(&self, id: BlockId) {
        self.state.lock().rejected.push(id);
    }
}

#[async_trait]
impl ServerChannel for MemoryChannel {
    async fn fetch_transforms_since(&self, watermark: Seq) -> Result<Vec<Transform>, ChannelError> {
        let mut state = self.state.lock();
        state.fetches += 1;
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ChannelError::Transport("fetch refused".into()));
        }
        let batch: Vec<_> = state.log.iter().filter(|t| t.seq > watermark).cloned().collect();
        trace!(%watermark, count = batch.len(), "memory channel fetch");
        Ok(batch)
    }

    async fn push_local_changes(&self, changes: &[LocalChange]) -> Result<PushAck, ChannelError> {
        let mut state = self.state.lock();
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(ChannelError::Transport("push refused".into()));
        }
        state.pushes.push(changes.to_vec());
        let accepted = changes
            .iter()
            .map(LocalChange::block_id)
            .filter(|id| !state.rejected.contains(id))
            .collect();
        Ok(PushAck { accepted })
    }
}
