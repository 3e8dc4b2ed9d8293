//! Subcommand implementations. Each returns what it would print so tests can
//! check it.

use std::future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use docsync_client::{BatchReport, Mediator, SessionEvent, SyncConfig, SyncSession};
use docsync_core::{ContentBlock, Seq, StateChunk};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{Instant, sleep_until};
use tracing::{info, warn};

use crate::file_channel::FileChannel;
use crate::files::{DocumentFile, load_transforms, outline};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ChunkAction {
    Accept,
    Reject,
}

fn summarize(report: &BatchReport) -> String {
    let mut out = format!(
        "applied {}, duplicates {}, missing {}, stale {}; watermark {}\n",
        report.applied, report.duplicates, report.missing, report.stale, report.watermark
    );
    for warning in &report.warnings {
        out.push_str(&format!("warning: {warning}\n"));
    }
    out
}

/// Apply a transform log to a document file and write the result.
///
/// `watermark` overrides the one stored in the document. The document is
/// rewritten in place unless `output` is given.
pub fn replay(
    document: &Path,
    transforms: &Path,
    watermark: Option<u64>,
    output: Option<&Path>,
) -> Result<String> {
    let file = DocumentFile::load(document)?;
    let start = watermark.map(Seq::new).unwrap_or(file.watermark);
    let mut mediator = Mediator::new(file.to_document()?);
    mediator.resync(Some(start));

    let log = load_transforms(transforms)?;
    info!(count = log.len(), watermark = %start, "replaying transform log");
    let (summary, ok) = match mediator.apply_batch(log) {
        Ok(report) => (summarize(&report), true),
        Err(aborted) => {
            let mut summary = summarize(&aborted.report);
            summary.push_str(&format!("aborted: {aborted}\n"));
            (summary, false)
        }
    };

    let out = output.unwrap_or(document);
    DocumentFile::snapshot(mediator.document(), mediator.watermark()).save(out)?;
    if !ok {
        bail!("{summary}");
    }
    Ok(format!("{summary}{}", outline(mediator.document())))
}

/// Accept or reject the tracked changes in a serialized block.
pub fn chunk(action: ChunkAction, file: &Path) -> Result<String> {
    let xml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let block = ContentBlock::parse(xml)?;
    let chunk = StateChunk::from(&block);
    if !chunk.contains_tracked_changes() {
        warn!(block_id = %chunk.id(), "block has no tracked changes");
    }
    let rewritten = match action {
        ChunkAction::Accept => chunk.accept_tracked_changes()?,
        ChunkAction::Reject => chunk.reject_tracked_changes()?,
    };
    Ok(rewritten.xml().to_string())
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}

fn log_event(event: &SessionEvent, watermark: &mut Seq) {
    match event {
        SessionEvent::BatchApplied(report) => {
            *watermark = report.watermark;
            info!(applied = report.applied, watermark = %report.watermark, "batch applied");
        }
        SessionEvent::BatchAborted { seq, watermark: at, error } => {
            *watermark = *at;
            warn!(%seq, "batch aborted: {error}");
        }
        SessionEvent::Warning(w) => warn!(seq = %w.seq, kind = w.kind, "{}", w.message),
        SessionEvent::Pushed { sent, accepted } => info!(sent, accepted, "pushed"),
        SessionEvent::PushFailed(e) => warn!("push failed: {e}"),
        SessionEvent::FetchFailed(e) => warn!("fetch failed: {e}"),
        SessionEvent::Closed => {}
    }
}

/// Log every queued event. A lagged receiver skips ahead instead of stopping.
fn drain_events(events: &mut broadcast::Receiver<SessionEvent>, watermark: &mut Seq) {
    loop {
        match events.try_recv() {
            Ok(event) => log_event(&event, watermark),
            Err(TryRecvError::Lagged(missed)) => warn!(missed, "session events dropped"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

/// Run a live session against a file-backed channel until `seconds` pass or
/// Ctrl-C, then write the document back.
pub async fn watch(
    document: &Path,
    transforms: &Path,
    config: &SyncConfig,
    outbox: Option<&Path>,
    seconds: Option<u64>,
) -> Result<String> {
    let file = DocumentFile::load(document)?;
    let mut watermark = file.watermark;
    let mut mediator = Mediator::new(file.to_document()?);
    mediator.resync(Some(watermark));

    let mut channel = FileChannel::new(transforms);
    if let Some(path) = outbox {
        channel = channel.with_outbox(path);
    }

    let mut session =
        SyncSession::with_mediator(mediator, Arc::new(channel), config.scheduler.clone())?;
    let mut events = session.subscribe();
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = until(deadline) => break,
            result = session.pump_next() => result?,
        }
        session.pump();
        drain_events(&mut events, &mut watermark);
    }

    drain_events(&mut events, &mut watermark);
    watermark = session.watermark();
    let doc = session.close().await?;
    // Close finishes delivered batches, which may move the watermark again.
    drain_events(&mut events, &mut watermark);

    DocumentFile::snapshot(&doc, watermark).save(document)?;
    Ok(format!("watermark {watermark}\n{}", outline(&doc)))
}
