//! The document model seam and its scoped-edit guard.
//!
//! The reconciliation engine never owns an editor. It talks to whatever
//! implements [`DocumentModel`]: block-level insert/remove/replace plus a
//! scoped-edit bracket during which the model holds its write lock and
//! suspends change notifications.
//!
//! [`EditScope`] pairs `begin_scoped_edit` with `end_scoped_edit` through
//! `Drop`, so the bracket is released on every exit path, `?` included.

use std::ops::{Deref, DerefMut};

use tracing::trace;

use crate::{BlockId, ContentBlock, Result};

/// Block-level operations the engine needs from an editable document.
pub trait DocumentModel {
    /// Insert `block` so that it ends up at `index`. Fails if `index` is past
    /// the end or the identity already exists.
    fn insert_block_at(&mut self, index: usize, block: ContentBlock) -> Result<BlockId>;

    /// Remove the block with identity `id`, returning it.
    fn remove_block(&mut self, id: BlockId) -> Result<ContentBlock>;

    /// Swap the serialized content of an existing block in place, returning
    /// the previous content.
    fn replace_block(&mut self, block: ContentBlock) -> Result<ContentBlock>;

    fn find_block_index(&self, id: BlockId) -> Option<usize>;

    fn block_at(&self, index: usize) -> Option<&ContentBlock>;

    fn block_count(&self) -> usize;

    /// Acquire the write lock and suspend change notifications.
    fn begin_scoped_edit(&mut self);

    /// Release what [`begin_scoped_edit`](Self::begin_scoped_edit) acquired.
    fn end_scoped_edit(&mut self);

    fn block(&self, id: BlockId) -> Option<&ContentBlock> {
        self.find_block_index(id).and_then(|i| self.block_at(i))
    }

    fn block_ids(&self) -> Vec<BlockId> {
        (0..self.block_count())
            .filter_map(|i| self.block_at(i))
            .map(|b| b.id)
            .collect()
    }

    // Caret support. Models without a caret can keep the defaults.

    fn caret(&self) -> usize {
        0
    }

    fn set_caret(&mut self, _offset: usize) {}

    /// Document length in caret units.
    fn len(&self) -> usize {
        0
    }

    /// Caret offset where the block at `index` starts (`len()` past the end).
    fn block_start_offset(&self, _index: usize) -> usize {
        0
    }
}

/// RAII scoped edit over a [`DocumentModel`].
///
/// Records the caret on entry. Call [`anchor_at`](Self::anchor_at) before a
/// structural change at block `index`: when the change point is at or before
/// the caret, the caret is re-measured from the document end so prepended or
/// removed content doesn't drag it along. The caret is restored and the
/// scope released on drop.
pub struct EditScope<'a, D: DocumentModel + ?Sized> {
    doc: &'a mut D,
    caret: usize,
    from_end: bool,
}

impl<'a, D: DocumentModel + ?Sized> EditScope<'a, D> {
    pub fn begin(doc: &'a mut D) -> Self {
        doc.begin_scoped_edit();
        let caret = doc.caret();
        trace!(caret, "scoped edit begin");
        Self { doc, caret, from_end: false }
    }

    pub fn anchor_at(&mut self, index: usize) {
        if self.from_end {
            return;
        }
        if self.doc.block_start_offset(index) <= self.caret {
            self.caret = self.doc.len().saturating_sub(self.caret);
            self.from_end = true;
        }
    }
}

impl<D: DocumentModel + ?Sized> Deref for EditScope<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.doc
    }
}

impl<D: DocumentModel + ?Sized> DerefMut for EditScope<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.doc
    }
}

impl<D: DocumentModel + ?Sized> Drop for EditScope<'_, D> {
    fn drop(&mut self) {
        let caret = if self.from_end {
            self.doc.len().saturating_sub(self.caret)
        } else {
            self.caret
        };
        trace!(caret, "scoped edit end");
        self.doc.set_caret(caret);
        self.doc.end_scoped_edit();
    }
}
