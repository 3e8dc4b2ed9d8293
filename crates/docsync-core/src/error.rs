//! Error types for the document model, payload parsing and transform dispatch.

use thiserror::Error;

use crate::{BlockId, Seq};

/// A serialized block could not be turned into a [`ContentBlock`](crate::ContentBlock).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is empty")]
    Empty,

    #[error("payload root is not a block element (expected <w:sdt>)")]
    NotABlock,

    #[error("payload has no w:id in its block properties")]
    MissingId,

    #[error("payload id {0:?} is not a non-negative integer")]
    InvalidId(String),

    #[error("payload id {got} does not match transform target {expected}")]
    IdMismatch { expected: BlockId, got: BlockId },

    #[error(transparent)]
    Markup(#[from] MarkupError),
}

/// Unbalanced or unparseable markup met while scanning serialized content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    #[error("closing tag </{found}> does not match open <{expected}>")]
    MismatchedClose { expected: String, found: String },

    #[error("closing tag </{0}> without an open element")]
    UnexpectedClose(String),

    #[error("element <{0}> is never closed")]
    Unclosed(String),
}

/// Errors raised by the document model and the baseline structures.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Block not found in document.
    #[error("block not found: {0:?}")]
    BlockNotFound(BlockId),

    /// A block with this identity already exists.
    #[error("block already exists: {0:?}")]
    DuplicateBlock(BlockId),

    /// Insert index past the end of the document.
    #[error("index {index} out of bounds for document with {len} blocks")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] PayloadError),

    #[error("malformed markup: {0}")]
    MalformedMarkup(#[from] MarkupError),
}

/// Outcome classes for a failed transform dispatch.
///
/// `Recoverable` skips the single transform (the watermark still advances);
/// `Fatal` aborts the remainder of the batch.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("transform {seq} skipped: {source}")]
    Recoverable {
        seq: Seq,
        #[source]
        source: CoreError,
    },

    #[error("transform {seq} failed against the document: {source}")]
    Fatal {
        seq: Seq,
        #[source]
        source: CoreError,
    },
}

impl ApplyError {
    pub fn seq(&self) -> Seq {
        match self {
            ApplyError::Recoverable { seq, .. } | ApplyError::Fatal { seq, .. } => *seq,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ApplyError::Fatal { .. })
    }
}
