//! Remote transforms and their dispatch.
//!
//! A [`Transform`] is one server-issued operation with its sequence number.
//! The operation set is closed: [`TransformOp`] is matched exhaustively in
//! [`Transform::dispatch`], so a new kind will not compile until every site
//! handles it.
//!
//! On the wire a transform is a flat JSON object tagged by `op`:
//!
//! ```json
//! { "seq": 12, "op": "insert", "position": 2, "payload": "<w:sdt>...</w:sdt>" }
//! { "seq": 13, "op": "delete", "block_id": 7 }
//! ```
//!
//! # Coordinates
//!
//! Positions are *baseline* positions. Insert and Move map them through the
//! [`Divergences`] table immediately before mutating, on the mutation thread,
//! and clamp the result into `[0, block_count]`.

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};
use tracing::{debug, error, trace, warn};

use crate::model::{DocumentModel, EditScope};
use crate::{
    ApplyError, BlockId, ContentBlock, CoreError, Divergences, Package, Seq, StateChunk,
};

/// One remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub seq: Seq,
    #[serde(flatten)]
    pub op: TransformOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransformOp {
    /// Insert a new block. No position (or a negative one) appends.
    Insert {
        #[serde(default)]
        position: Option<i64>,
        payload: String,
    },
    Delete {
        block_id: BlockId,
    },
    Move {
        block_id: BlockId,
        position: i64,
    },
    /// Replace a block's content wholesale.
    Update {
        block_id: BlockId,
        payload: String,
    },
    AcceptChanges {
        block_id: BlockId,
    },
    RejectChanges {
        block_id: BlockId,
    },
}

impl TransformOp {
    /// The block this operation targets, when known without parsing a payload.
    pub fn target(&self) -> Option<BlockId> {
        match self {
            TransformOp::Insert { .. } => None,
            TransformOp::Delete { block_id }
            | TransformOp::Move { block_id, .. }
            | TransformOp::Update { block_id, .. }
            | TransformOp::AcceptChanges { block_id }
            | TransformOp::RejectChanges { block_id } => Some(*block_id),
        }
    }
}

/// What a successful dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The document, baseline or divergence table changed.
    Applied,
    /// The target identity already exists; nothing was touched.
    Duplicate,
    /// The target identity is unknown; nothing was touched.
    MissingTarget,
}

/// Mutable state a transform is applied against.
///
/// Owned by the reconciliation engine and only ever borrowed on the mutation
/// thread.
pub struct ApplyContext<'a, D: DocumentModel + ?Sized> {
    pub document: &'a mut D,
    pub package: &'a mut Package,
    pub divergences: &'a mut Divergences,
}

impl<'a, D: DocumentModel + ?Sized> ApplyContext<'a, D> {
    pub fn new(
        document: &'a mut D,
        package: &'a mut Package,
        divergences: &'a mut Divergences,
    ) -> Self {
        Self { document, package, divergences }
    }

    /// Baseline position of the document index `index`: how many
    /// baseline-known blocks precede it.
    pub fn baseline_position(&self, index: usize) -> usize {
        baseline_position(&*self.document, self.package, index)
    }

    /// Map a baseline position to a document index, clamped into
    /// `[0, block_count]`.
    fn local_index(&self, position: usize) -> usize {
        let adjusted = self.divergences.adjust(position);
        let index = clamp_index(adjusted, self.document.block_count());
        debug!(position, adjusted, index, "insertion location adjusted");
        index
    }
}

/// Count the baseline-known blocks before document index `index`.
pub fn baseline_position<D: DocumentModel + ?Sized>(
    document: &D,
    package: &Package,
    index: usize,
) -> usize {
    (0..index.min(document.block_count()))
        .filter_map(|i| document.block_at(i))
        .filter(|b| package.contains(b.id))
        .count()
}

fn clamp_index(adjusted: i64, count: usize) -> usize {
    usize::try_from(adjusted.max(0)).map_or(count, |i| i.min(count))
}

impl Transform {
    pub fn new(seq: impl Into<Seq>, op: TransformOp) -> Self {
        Self { seq: seq.into(), op }
    }

    pub fn kind(&self) -> &'static str {
        (&self.op).into()
    }

    /// Apply this transform, returning its sequence number.
    ///
    /// Duplicate and missing targets are silent no-ops that still return the
    /// sequence number so the caller can advance its watermark.
    pub fn apply<D: DocumentModel + ?Sized>(
        &self,
        cx: &mut ApplyContext<'_, D>,
    ) -> Result<Seq, ApplyError> {
        self.dispatch(cx).map(|_| self.seq)
    }

    /// Apply this transform, reporting what it did.
    pub fn dispatch<D: DocumentModel + ?Sized>(
        &self,
        cx: &mut ApplyContext<'_, D>,
    ) -> Result<Outcome, ApplyError> {
        let seq = self.seq;
        match &self.op {
            TransformOp::Insert { position, payload } => {
                let block = ContentBlock::parse(payload.as_str()).map_err(|e| recoverable(seq, e))?;
                self.insert(cx, *position, block)
            }
            TransformOp::Delete { block_id } => self.delete(cx, *block_id),
            TransformOp::Move { block_id, position } => self.relocate(cx, *block_id, *position),
            TransformOp::Update { block_id, payload } => {
                let block = ContentBlock::parse_for(*block_id, payload.as_str())
                    .map_err(|e| recoverable(seq, e))?;
                self.update(cx, block)
            }
            TransformOp::AcceptChanges { block_id } => {
                self.rewrite_chunk(cx, *block_id, StateChunk::accept_tracked_changes)
            }
            TransformOp::RejectChanges { block_id } => {
                self.rewrite_chunk(cx, *block_id, StateChunk::reject_tracked_changes)
            }
        }
    }

    fn insert<D: DocumentModel + ?Sized>(
        &self,
        cx: &mut ApplyContext<'_, D>,
        position: Option<i64>,
        block: ContentBlock,
    ) -> Result<Outcome, ApplyError> {
        let id = block.id;
        if cx.document.find_block_index(id).is_some() || cx.package.contains(id) {
            debug!(seq = %self.seq, block_id = %id, "block already exists, insert skipped");
            return Ok(Outcome::Duplicate);
        }

        let count = cx.document.block_count();
        let index = match position.and_then(|p| usize::try_from(p).ok()) {
            Some(p) => cx.local_index(p),
            None if count == 0 => {
                debug!(seq = %self.seq, block_id = %id, "inserting as sole block");
                0
            }
            None => {
                debug!(seq = %self.seq, block_id = %id, "no position, appending");
                count
            }
        };

        let chunk = StateChunk::from(&block);
        {
            let mut doc = EditScope::begin(&mut *cx.document);
            doc.anchor_at(index);
            doc.insert_block_at(index, block).map_err(|e| fatal(self.seq, e))?;
        }
        cx.package.put(chunk);
        debug!(seq = %self.seq, block_id = %id, index, "inserted block");
        Ok(Outcome::Applied)
    }

    fn delete<D: DocumentModel + ?Sized>(
        &self,
        cx: &mut ApplyContext<'_, D>,
        id: BlockId,
    ) -> Result<Outcome, ApplyError> {
        let Some(index) = cx.document.find_block_index(id) else {
            // Removed locally or by an earlier delivery. The server has
            // dropped it too, so the baseline should forget it.
            cx.package.remove(id);
            warn!(seq = %self.seq, block_id = %id, "delete target not in document, skipped");
            return Ok(Outcome::MissingTarget);
        };

        let position = cx.baseline_position(index);
        {
            let mut doc = EditScope::begin(&mut *cx.document);
            doc.anchor_at(index);
            doc.remove_block(id).map_err(|e| fatal(self.seq, e))?;
        }
        cx.package.remove(id);
        cx.divergences.remove(id, position);
        debug!(seq = %self.seq, block_id = %id, index, position, "deleted block");
        Ok(Outcome::Applied)
    }

    fn relocate<D: DocumentModel + ?Sized>(
        &self,
        cx: &mut ApplyContext<'_, D>,
        id: BlockId,
        position: i64,
    ) -> Result<Outcome, ApplyError> {
        let Some(from) = cx.document.find_block_index(id) else {
            warn!(seq = %self.seq, block_id = %id, "move target not in document, skipped");
            return Ok(Outcome::MissingTarget);
        };

        let mut doc = EditScope::begin(&mut *cx.document);
        doc.anchor_at(from);
        let block = doc.remove_block(id).map_err(|e| fatal(self.seq, e))?;
        // Adjusted against the document with the block already lifted out.
        let adjusted = cx.divergences.adjust(usize::try_from(position.max(0)).unwrap_or(0));
        let to = clamp_index(adjusted, doc.block_count());
        doc.anchor_at(to);
        if let Err(e) = doc.insert_block_at(to, block.clone()) {
            // A failed move leaves the block where it was.
            doc.anchor_at(from);
            if let Err(restore) = doc.insert_block_at(from, block) {
                error!(
                    seq = %self.seq,
                    block_id = %id,
                    from,
                    "moved block could not be restored: {restore}"
                );
            }
            return Err(fatal(self.seq, e));
        }
        drop(doc);

        debug!(seq = %self.seq, block_id = %id, from, to, "moved block");
        Ok(Outcome::Applied)
    }

    fn update<D: DocumentModel + ?Sized>(
        &self,
        cx: &mut ApplyContext<'_, D>,
        block: ContentBlock,
    ) -> Result<Outcome, ApplyError> {
        let id = block.id;
        if cx.document.find_block_index(id).is_none() {
            warn!(seq = %self.seq, block_id = %id, "update target not in document, skipped");
            return Ok(Outcome::MissingTarget);
        }

        let chunk = StateChunk::from(&block);
        {
            let mut doc = EditScope::begin(&mut *cx.document);
            doc.replace_block(block).map_err(|e| fatal(self.seq, e))?;
        }
        cx.package.put(chunk);
        debug!(seq = %self.seq, block_id = %id, "updated block content");
        Ok(Outcome::Applied)
    }

    fn rewrite_chunk<D, F>(
        &self,
        cx: &mut ApplyContext<'_, D>,
        id: BlockId,
        rewrite: F,
    ) -> Result<Outcome, ApplyError>
    where
        D: DocumentModel + ?Sized,
        F: Fn(&StateChunk) -> Result<StateChunk, crate::MarkupError>,
    {
        let Some(chunk) = cx.package.get(id) else {
            let kind = self.kind();
            warn!(seq = %self.seq, block_id = %id, kind, "no baseline chunk, skipped");
            return Ok(Outcome::MissingTarget);
        };
        let next = rewrite(chunk).map_err(|e| recoverable(self.seq, e))?;

        // The live block gets the same treatment as its snapshot.
        if let Some(live) = cx.document.block(id) {
            let current = StateChunk::from(live);
            let rewritten = rewrite(&current).map_err(|e| recoverable(self.seq, e))?;
            if rewritten.xml() != live.xml {
                let block = ContentBlock { id, xml: rewritten.xml().to_string() };
                let mut doc = EditScope::begin(&mut *cx.document);
                doc.replace_block(block).map_err(|e| fatal(self.seq, e))?;
            }
        }

        trace!(seq = %self.seq, block_id = %id, "chunk rewritten");
        cx.package.put(next);
        Ok(Outcome::Applied)
    }
}

fn recoverable(seq: Seq, source: impl Into<CoreError>) -> ApplyError {
    ApplyError::Recoverable { seq, source: source.into() }
}

fn fatal(seq: Seq, source: CoreError) -> ApplyError {
    ApplyError::Fatal { seq, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockDocument;

    struct Fixture {
        doc: BlockDocument,
        package: Package,
        divergences: Divergences,
    }

    impl Fixture {
        /// Baseline and document both hold `ids`, all with text equal to the id.
        fn synced(ids: &[u64]) -> Self {
            let blocks: Vec<_> = ids
                .iter()
                .map(|n| ContentBlock::from_text(BlockId::new(*n), &n.to_string()))
                .collect();
            let package = Package::from_chunks(blocks.iter().map(StateChunk::from));
            Self {
                doc: BlockDocument::from_blocks(blocks).unwrap(),
                package,
                divergences: Divergences::new(),
            }
        }

        fn apply(&mut self, t: &Transform) -> Result<Outcome, ApplyError> {
            let mut cx = ApplyContext::new(&mut self.doc, &mut self.package, &mut self.divergences);
            t.dispatch(&mut cx)
        }

        fn ids(&self) -> Vec<u64> {
            self.doc.block_ids().into_iter().map(BlockId::get).collect()
        }
    }

    fn insert(seq: u64, position: Option<i64>, id: u64) -> Transform {
        Transform::new(
            seq,
            TransformOp::Insert {
                position,
                payload: ContentBlock::from_text(BlockId::new(id), "new").xml,
            },
        )
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"seq":4,"op":"move","block_id":7,"position":1}"#;
        let t: Transform = serde_json::from_str(json).unwrap();
        let expected = TransformOp::Move { block_id: BlockId::new(7), position: 1 };
        assert_eq!(t, Transform::new(4, expected));
        assert_eq!(t.kind(), "move");

        let t: Transform =
            serde_json::from_str(r#"{"seq":5,"op":"insert","payload":"x"}"#).unwrap();
        assert!(matches!(t.op, TransformOp::Insert { position: None, .. }));

        let accept = Transform::new(6, TransformOp::AcceptChanges { block_id: BlockId::new(1) });
        let back = serde_json::to_string(&accept).unwrap();
        assert_eq!(back, r#"{"seq":6,"op":"accept_changes","block_id":1}"#);
    }

    #[test]
    fn test_insert_at_baseline_position() {
        let mut fx = Fixture::synced(&[1, 2, 3]);
        assert_eq!(fx.apply(&insert(1, Some(1), 9)).unwrap(), Outcome::Applied);
        assert_eq!(fx.ids(), vec![1, 9, 2, 3]);
        assert!(fx.package.contains(BlockId::new(9)));
        assert!(fx.divergences.is_empty());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut fx = Fixture::synced(&[1, 2]);
        let t = insert(1, Some(0), 9);
        let mut cx = ApplyContext::new(&mut fx.doc, &mut fx.package, &mut fx.divergences);
        assert_eq!(t.apply(&mut cx).unwrap(), Seq::new(1));
        assert_eq!(t.apply(&mut cx).unwrap(), Seq::new(1));
        assert_eq!(fx.apply(&t).unwrap(), Outcome::Duplicate);
        assert_eq!(fx.ids(), vec![9, 1, 2]);
        assert_eq!(fx.package.len(), 3);
    }

    #[test]
    fn test_insert_without_position() {
        let mut fx = Fixture::synced(&[]);
        fx.apply(&insert(1, None, 5)).unwrap();
        fx.apply(&insert(2, Some(-3), 6)).unwrap();
        fx.apply(&insert(3, None, 7)).unwrap();
        assert_eq!(fx.ids(), vec![5, 6, 7]);
    }

    #[test]
    fn test_insert_clamps_to_document() {
        let mut fx = Fixture::synced(&[1, 2]);
        fx.apply(&insert(1, Some(40), 9)).unwrap();
        assert_eq!(fx.ids(), vec![1, 2, 9]);

        fx.divergences.remove(BlockId::new(1), 0);
        fx.divergences.remove(BlockId::new(2), 0);
        fx.apply(&insert(2, Some(0), 10)).unwrap();
        assert_eq!(fx.ids(), vec![10, 1, 2, 9]);
    }

    #[test]
    fn test_malformed_payload_is_recoverable() {
        let mut fx = Fixture::synced(&[1]);
        let t =
            Transform::new(3, TransformOp::Insert { position: Some(0), payload: "<w:p>".into() });
        let err = fx.apply(&t).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.seq(), Seq::new(3));
        assert_eq!(fx.ids(), vec![1]);
    }

    #[test]
    fn test_delete_records_divergence() {
        let mut fx = Fixture::synced(&[1, 2, 3]);
        let t = Transform::new(1, TransformOp::Delete { block_id: BlockId::new(2) });
        assert_eq!(fx.apply(&t).unwrap(), Outcome::Applied);
        assert_eq!(fx.ids(), vec![1, 3]);
        assert!(!fx.package.contains(BlockId::new(2)));
        assert_eq!(fx.divergences.get_offset(1), -1);
        assert_eq!(fx.divergences.get_offset(0), 0);

        assert_eq!(fx.apply(&t).unwrap(), Outcome::MissingTarget);
        assert_eq!(fx.divergences.len(), 1);
    }

    #[test]
    fn test_move_keeps_chunk() {
        let mut fx = Fixture::synced(&[1, 2, 3]);
        let before = fx.package.get(BlockId::new(1)).cloned();
        let t = Transform::new(1, TransformOp::Move { block_id: BlockId::new(1), position: 2 });
        fx.apply(&t).unwrap();
        assert_eq!(fx.ids(), vec![2, 3, 1]);
        assert_eq!(fx.package.get(BlockId::new(1)).cloned(), before);
        assert!(fx.divergences.is_empty());
    }

    /// Refuses inserts at one index.
    struct Wedged {
        inner: BlockDocument,
        refuse_at: usize,
    }

    impl DocumentModel for Wedged {
        fn insert_block_at(&mut self, index: usize, block: ContentBlock) -> crate::Result<BlockId> {
            if index == self.refuse_at {
                return Err(CoreError::IndexOutOfBounds { index, len: self.inner.block_count() });
            }
            self.inner.insert_block_at(index, block)
        }
        fn remove_block(&mut self, id: BlockId) -> crate::Result<ContentBlock> {
            self.inner.remove_block(id)
        }
        fn replace_block(&mut self, block: ContentBlock) -> crate::Result<ContentBlock> {
            self.inner.replace_block(block)
        }
        fn find_block_index(&self, id: BlockId) -> Option<usize> {
            self.inner.find_block_index(id)
        }
        fn block_at(&self, index: usize) -> Option<&ContentBlock> {
            self.inner.block_at(index)
        }
        fn block_count(&self) -> usize {
            self.inner.block_count()
        }
        fn begin_scoped_edit(&mut self) {
            self.inner.begin_scoped_edit()
        }
        fn end_scoped_edit(&mut self) {
            self.inner.end_scoped_edit()
        }
    }

    #[test]
    fn test_failed_move_keeps_block() {
        let fx = Fixture::synced(&[1, 2, 3]);
        let mut doc = Wedged { inner: fx.doc, refuse_at: 2 };
        let (mut package, mut divergences) = (fx.package, fx.divergences);
        let t = Transform::new(1, TransformOp::Move { block_id: BlockId::new(1), position: 2 });

        let mut cx = ApplyContext::new(&mut doc, &mut package, &mut divergences);
        let err = t.dispatch(&mut cx).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.seq(), Seq::new(1));
        assert_eq!(doc.inner.full_text(), "1\n2\n3");
        assert!(!doc.inner.in_scoped_edit());

        doc.refuse_at = usize::MAX;
        let mut cx = ApplyContext::new(&mut doc, &mut package, &mut divergences);
        assert_eq!(t.dispatch(&mut cx).unwrap(), Outcome::Applied);
        assert_eq!(doc.inner.full_text(), "2\n3\n1");
    }

    #[test]
    fn test_update_replaces_content_and_chunk() {
        let mut fx = Fixture::synced(&[1, 2]);
        let payload = ContentBlock::from_text(BlockId::new(2), "two").xml;
        let op = TransformOp::Update { block_id: BlockId::new(2), payload: payload.clone() };
        let t = Transform::new(1, op);
        fx.apply(&t).unwrap();
        assert_eq!(fx.doc.block(BlockId::new(2)).unwrap().text(), "two");
        assert_eq!(fx.package.get(BlockId::new(2)).unwrap().xml(), payload);
        assert_eq!(fx.ids(), vec![1, 2]);
    }

    #[test]
    fn test_update_rejects_foreign_payload() {
        let mut fx = Fixture::synced(&[1, 2]);
        let payload = ContentBlock::from_text(BlockId::new(1), "one").xml;
        let t = Transform::new(1, TransformOp::Update { block_id: BlockId::new(2), payload });
        assert!(matches!(
            fx.apply(&t),
            Err(ApplyError::Recoverable { source: CoreError::MalformedPayload(_), .. })
        ));
    }

    #[test]
    fn test_accept_rewrites_chunk_and_block() {
        let xml = concat!(
            r#"<w:sdt><w:sdtPr><w:id w:val="4"/></w:sdtPr><w:sdtContent><w:p>"#,
            r#"<w:r><w:t>a</w:t></w:r><w:del><w:r><w:delText>b</w:delText></w:r></w:del>"#,
            r#"<w:ins><w:r><w:t>c</w:t></w:r></w:ins></w:p></w:sdtContent></w:sdt>"#,
        );
        let block = ContentBlock::parse(xml).unwrap();
        let mut fx = Fixture {
            package: Package::from_chunks([StateChunk::from(&block)]),
            doc: BlockDocument::from_blocks([block]).unwrap(),
            divergences: Divergences::new(),
        };

        let t = Transform::new(1, TransformOp::AcceptChanges { block_id: BlockId::new(4) });
        fx.apply(&t).unwrap();
        let chunk = fx.package.get(BlockId::new(4)).unwrap();
        assert!(!chunk.contains_tracked_changes());
        assert_eq!(fx.doc.block(BlockId::new(4)).unwrap().text(), "ac");
    }

    #[test]
    fn test_reject_unknown_block_is_skipped() {
        let mut fx = Fixture::synced(&[1]);
        let t = Transform::new(1, TransformOp::RejectChanges { block_id: BlockId::new(8) });
        assert_eq!(fx.apply(&t).unwrap(), Outcome::MissingTarget);
    }

    #[test]
    fn test_baseline_position_skips_local_blocks() {
        let mut fx = Fixture::synced(&[1, 2, 3]);
        fx.doc.insert_block_at(1, ContentBlock::from_text(BlockId::new(50), "local")).unwrap();
        assert_eq!(baseline_position(&fx.doc, &fx.package, 2), 1);
        assert_eq!(baseline_position(&fx.doc, &fx.package, 4), 3);
        assert_eq!(baseline_position(&fx.doc, &fx.package, 99), 3);
    }
}
