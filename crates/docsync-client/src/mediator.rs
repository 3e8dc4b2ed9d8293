//! Reconciliation engine.
//!
//! The [`Mediator`] owns the document together with its baseline
//! ([`Package`]), the divergence table and the transform watermark. It is
//! free of any runtime: every method is synchronous and runs on whatever
//! thread owns the document. The [scheduler](crate::scheduler) and
//! [`SyncSession`](crate::SyncSession) feed it.
//!
//! # Watermark
//!
//! ```text
//! batch [5, 3, 7]  ──sort──▶  3 ─▶ 5 ─▶ 7      watermark 0 → 7
//! batch [3, 5]     ──sort──▶  3 ✗  5 ✗          (≤ watermark, skipped)
//! ```
//!
//! Recoverable failures (malformed payload) still advance the watermark and
//! surface a [`SyncWarning`]. A fatal failure stops the batch; the
//! watermark stays on the last transform that completed, so the next fetch
//! resumes from there.

use std::fmt;

use docsync_core::{
    ApplyContext, ApplyError, BlockId, ContentBlock, CoreError, Divergences, DocumentModel,
    Outcome, Package, Seq, StateChunk, Transform, baseline_position,
};
use thiserror::Error;
use tracing::{debug, debug_span, error, info, info_span, trace, warn};

use crate::channel::{LocalChange, PushAck};

/// A non-blocking problem the user should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWarning {
    pub seq: Seq,
    pub kind: &'static str,
    pub message: String,
}

impl fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}: {}", self.kind, self.seq, self.message)
    }
}

/// Tally of one [`Mediator::apply_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    /// Already-present targets (idempotent re-apply).
    pub duplicates: usize,
    /// Unknown targets, skipped.
    pub missing: usize,
    /// At or below the watermark on arrival.
    pub stale: usize,
    pub warnings: Vec<SyncWarning>,
    /// Watermark after the batch.
    pub watermark: Seq,
}

impl BatchReport {
    /// Transforms that moved the watermark.
    pub fn processed(&self) -> usize {
        self.applied + self.duplicates + self.missing + self.warnings.len()
    }
}

/// A batch stopped at a transform that failed against the document.
#[derive(Error, Debug)]
#[error("batch aborted after {} transforms: {source}", .report.processed())]
pub struct BatchAborted {
    /// What completed before the failure.
    pub report: BatchReport,
    pub seq: Seq,
    #[source]
    pub source: ApplyError,
}

pub struct Mediator<D> {
    document: D,
    package: Package,
    divergences: Divergences,
    watermark: Seq,
}

impl<D: DocumentModel> Mediator<D> {
    /// Start from a freshly loaded document: every block is baseline.
    pub fn new(document: D) -> Self {
        let package = snapshot(&document);
        Self { document, package, divergences: Divergences::new(), watermark: Seq::ZERO }
    }

    /// Start from an explicit baseline, e.g. one restored alongside the document.
    pub fn with_baseline(document: D, package: Package, watermark: Seq) -> Self {
        Self { document, package, divergences: Divergences::new(), watermark }
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    /// Direct document access. Structural edits made here must be reported
    /// through [`record_local_insert`](Self::record_local_insert) and
    /// [`record_local_delete`](Self::record_local_delete).
    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }

    pub fn into_document(self) -> D {
        self.document
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn divergences(&self) -> &Divergences {
        &self.divergences
    }

    pub fn watermark(&self) -> Seq {
        self.watermark
    }

    /// Apply `transforms` in sequence order.
    pub fn apply_batch(
        &mut self,
        mut transforms: Vec<Transform>,
    ) -> Result<BatchReport, BatchAborted> {
        let span = info_span!("reconcile.batch", count = transforms.len(), from = %self.watermark);
        let _enter = span.enter();

        transforms.sort_by_key(|t| t.seq);
        let mut report = BatchReport::default();

        for transform in &transforms {
            if transform.seq <= self.watermark {
                trace!(seq = %transform.seq, watermark = %self.watermark, "already applied");
                report.stale += 1;
                continue;
            }

            let seq = transform.seq;
            let _apply = debug_span!("reconcile.apply", %seq, kind = transform.kind()).entered();
            let mut cx =
                ApplyContext::new(&mut self.document, &mut self.package, &mut self.divergences);
            match transform.dispatch(&mut cx) {
                Ok(Outcome::Applied) => report.applied += 1,
                Ok(Outcome::Duplicate) => report.duplicates += 1,
                Ok(Outcome::MissingTarget) => report.missing += 1,
                Err(e) if !e.is_fatal() => {
                    warn!(seq = %transform.seq, kind = transform.kind(), "skipping transform: {e}");
                    report.warnings.push(SyncWarning {
                        seq: transform.seq,
                        kind: transform.kind(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(seq = %transform.seq, kind = transform.kind(), "batch aborted: {e}");
                    report.watermark = self.watermark;
                    return Err(BatchAborted { report, seq: transform.seq, source: e });
                }
            }
            self.watermark = transform.seq;
        }

        report.watermark = self.watermark;
        if report.processed() > 0 {
            info!(
                applied = report.applied,
                duplicates = report.duplicates,
                missing = report.missing,
                warnings = report.warnings.len(),
                watermark = %self.watermark,
                "batch reconciled"
            );
        }
        Ok(report)
    }

    /// The user inserted `block_id` ahead of `baseline_position`.
    pub fn record_local_insert(&mut self, block_id: BlockId, baseline_position: usize) {
        self.divergences.insert(block_id, baseline_position);
    }

    /// The user removed `block_id` at `baseline_position`.
    pub fn record_local_delete(&mut self, block_id: BlockId, baseline_position: usize) {
        self.divergences.remove(block_id, baseline_position);
    }

    /// Insert a serialized block at document index `index` as a local edit.
    pub fn insert_local_block(
        &mut self,
        index: usize,
        xml: impl Into<String>,
    ) -> Result<BlockId, CoreError> {
        let block = ContentBlock::parse(xml)?;
        let position = baseline_position(&self.document, &self.package, index);
        let id = self.document.insert_block_at(index, block)?;
        self.record_local_insert(id, position);
        debug!(block_id = %id, index, position, "local insert");
        Ok(id)
    }

    /// Remove a block as a local edit.
    pub fn remove_local_block(&mut self, id: BlockId) -> Result<ContentBlock, CoreError> {
        let index = self.document.find_block_index(id).ok_or(CoreError::BlockNotFound(id))?;
        let position = baseline_position(&self.document, &self.package, index);
        let block = self.document.remove_block(id)?;
        self.record_local_delete(id, position);
        debug!(block_id = %id, index, position, "local delete");
        Ok(block)
    }

    /// Replace a block's content as a local edit. Positions are unaffected.
    pub fn update_local_block(
        &mut self,
        id: BlockId,
        xml: impl Into<String>,
    ) -> Result<(), CoreError> {
        let block = ContentBlock::parse_for(id, xml)?;
        self.document.replace_block(block)?;
        Ok(())
    }

    /// Diff the document against the baseline.
    ///
    /// Inserts and updates come in document order, deletes after them.
    pub fn collect_local_changes(&self) -> Vec<LocalChange> {
        let mut changes = Vec::new();
        let mut position = 0;
        for index in 0..self.document.block_count() {
            let Some(block) = self.document.block_at(index) else { continue };
            match self.package.get(block.id) {
                Some(chunk) => {
                    if chunk.differs_from(&block.xml) {
                        changes.push(LocalChange::Update {
                            block_id: block.id,
                            content: block.xml.clone(),
                        });
                    }
                    position += 1;
                }
                None => changes.push(LocalChange::Insert {
                    block_id: block.id,
                    position,
                    content: block.xml.clone(),
                }),
            }
        }
        for id in self.package.ids() {
            if self.document.find_block_index(id).is_none() {
                changes.push(LocalChange::Delete { block_id: id });
            }
        }
        changes
    }

    /// Fold a push acknowledgement into the baseline.
    ///
    /// Accepted inserts and updates get fresh chunks holding the content that
    /// was sent; accepted deletes leave the package. Divergence entries for
    /// accepted changes are forgotten and the entries still pending are
    /// rebased onto the new baseline. Once no structural change is
    /// outstanding the table is cleared.
    pub fn acknowledge(&mut self, sent: &[LocalChange], ack: &PushAck) {
        let mut accepted = 0;
        for change in sent {
            if !ack.accepts(change.block_id()) {
                debug!(block_id = %change.block_id(), "change not acknowledged");
                continue;
            }
            accepted += 1;
            match change {
                LocalChange::Insert { block_id, content, .. } => {
                    self.package.put(StateChunk::new(*block_id, content.clone()));
                    let forgotten = self.divergences.forget(*block_id);
                    if let Some(entry) = forgotten.iter().find(|d| d.delta > 0) {
                        self.divergences.shift_for_baseline_insert(entry);
                    }
                }
                LocalChange::Update { block_id, content } => {
                    self.package.put(StateChunk::new(*block_id, content.clone()));
                }
                LocalChange::Delete { block_id } => {
                    self.package.remove(*block_id);
                    let forgotten = self.divergences.forget(*block_id);
                    if let Some(entry) = forgotten.iter().find(|d| d.delta < 0) {
                        self.divergences.shift_for_baseline_remove(entry);
                    }
                }
            }
        }

        let structural_pending =
            self.collect_local_changes().iter().any(LocalChange::is_structural);
        if !structural_pending && !self.divergences.is_empty() {
            debug!(entries = self.divergences.len(), "baseline caught up, divergences reset");
            self.divergences.reset();
        } else if accepted > 0 {
            self.rebase_pending_inserts();
        }
        info!(sent = sent.len(), accepted, "push acknowledged");
    }

    /// Re-measure unacknowledged local inserts against the current baseline.
    fn rebase_pending_inserts(&mut self) {
        let pending: Vec<_> =
            self.divergences.entries().iter().filter(|d| d.delta > 0).copied().collect();
        for entry in pending {
            if self.package.contains(entry.block_id) {
                continue;
            }
            let Some(index) = self.document.find_block_index(entry.block_id) else { continue };
            let position = baseline_position(&self.document, &self.package, index);
            if position != entry.position {
                trace!(
                    block_id = %entry.block_id,
                    from = entry.position,
                    to = position,
                    "divergence rebased"
                );
                self.divergences.reposition(entry.block_id, entry.delta, position);
            }
        }
    }

    /// Rebuild the baseline from the document as it stands.
    ///
    /// Pass the server's snapshot sequence to move the watermark with it.
    pub fn resync(&mut self, watermark: Option<Seq>) {
        self.package = snapshot(&self.document);
        self.divergences.reset();
        if let Some(seq) = watermark {
            self.watermark = seq;
        }
        info!(blocks = self.package.len(), watermark = %self.watermark, "baseline resynchronized");
    }
}

fn snapshot<D: DocumentModel>(document: &D) -> Package {
    Package::from_chunks(
        (0..document.block_count())
            .filter_map(|i| document.block_at(i))
            .map(StateChunk::from),
    )
}
