//! Per-document sync session.
//!
//! A [`SyncSession`] is created when a document opens and torn down when it
//! closes. It owns the [`Mediator`] (and through it the document) plus the
//! handle to its [`Scheduler`](crate::scheduler) task. Nothing about it is
//! global: two open documents are two sessions.
//!
//! The session lives on the mutation thread. The embedding application calls
//! [`pump`](SyncSession::pump) from its event loop (or awaits
//! [`pump_next`](SyncSession::pump_next)); that is the only place transforms
//! are applied.

use std::sync::Arc;

use docsync_core::{DocumentModel, Seq, Transform};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ServerChannel;
use crate::config::{ConfigError, SchedulerConfig};
use crate::constants::SESSION_EVENT_CAPACITY;
use crate::mediator::{BatchReport, Mediator, SyncWarning};
use crate::scheduler::{Inbound, Outbound, spawn_scheduler};

/// Errors from session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("scheduler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid scheduler config: {0}")]
    Config(#[from] ConfigError),
}

/// Session activity, for status bars and logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    BatchApplied(BatchReport),
    /// `watermark` is where the session stands after the abort.
    BatchAborted { seq: Seq, watermark: Seq, error: String },
    /// A transform was skipped; the user should know.
    Warning(SyncWarning),
    Pushed { sent: usize, accepted: usize },
    PushFailed(String),
    FetchFailed(String),
    Closed,
}

pub struct SyncSession<D> {
    mediator: Mediator<D>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<D: DocumentModel> SyncSession<D> {
    /// Open a session over a freshly loaded document.
    ///
    /// Spawns the scheduler, so it must be called inside a tokio runtime.
    /// Nothing is spawned when `config` fails validation.
    pub fn open(
        document: D,
        channel: impl ServerChannel,
        config: SchedulerConfig,
    ) -> Result<Self, SessionError> {
        Self::with_mediator(Mediator::new(document), Arc::new(channel), config)
    }

    /// Open a session around an existing mediator, keeping its baseline and
    /// watermark.
    pub fn with_mediator(
        mediator: Mediator<D>,
        channel: Arc<dyn ServerChannel>,
        config: SchedulerConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let watermark = mediator.watermark();
        let task = spawn_scheduler(channel, config, watermark, in_tx, out_rx, cancel.clone());
        info!(%watermark, blocks = mediator.package().len(), "sync session opened");
        Ok(Self { mediator, inbound: in_rx, outbound: out_tx, events, cancel, task })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn mediator(&self) -> &Mediator<D> {
        &self.mediator
    }

    /// Local edits go through here so divergence tracking sees them.
    pub fn mediator_mut(&mut self) -> &mut Mediator<D> {
        &mut self.mediator
    }

    pub fn document(&self) -> &D {
        self.mediator.document()
    }

    pub fn watermark(&self) -> Seq {
        self.mediator.watermark()
    }

    /// Handle every message already delivered. Returns how many there were.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.inbound.try_recv() {
            self.handle(msg);
            handled += 1;
        }
        handled
    }

    /// Wait for the next message and handle it.
    pub async fn pump_next(&mut self) -> Result<(), SessionError> {
        let msg = self.inbound.recv().await.ok_or(SessionError::Closed)?;
        self.handle(msg);
        Ok(())
    }

    /// Stop the timers, finish whatever was already delivered, and hand the
    /// document back.
    ///
    /// Dropping a session instead also stops the scheduler (its outbound
    /// channel closes) but discards undelivered batches.
    pub async fn close(mut self) -> Result<D, SessionError> {
        self.cancel.cancel();
        let joined = (&mut self.task).await;

        // Batches already in the channel run to completion.
        let drained = self.pump();
        debug!(drained, "inbound drained on close");

        let _ = self.events.send(SessionEvent::Closed);
        info!(watermark = %self.mediator.watermark(), "sync session closed");
        joined?;
        Ok(self.mediator.into_document())
    }

    fn handle(&mut self, msg: Inbound) {
        match msg {
            Inbound::Transforms(batch) => self.apply(batch),
            Inbound::PushDue => {
                let changes = self.mediator.collect_local_changes();
                if !changes.is_empty() {
                    debug!(count = changes.len(), "local changes collected");
                }
                let _ = self.outbound.send(Outbound::Push(changes));
            }
            Inbound::PushAcked { sent, ack } => {
                self.mediator.acknowledge(&sent, &ack);
                let _ = self.events.send(SessionEvent::Pushed {
                    sent: sent.len(),
                    accepted: ack.accepted.len(),
                });
            }
            Inbound::PushFailed { sent, error } => {
                warn!(count = sent.len(), "push failed: {error}");
                let _ = self.events.send(SessionEvent::PushFailed(error.to_string()));
            }
            Inbound::FetchFailed(error) => {
                let _ = self.events.send(SessionEvent::FetchFailed(error.to_string()));
            }
        }
    }

    fn apply(&mut self, batch: Vec<Transform>) {
        match self.mediator.apply_batch(batch) {
            Ok(report) => {
                for warning in &report.warnings {
                    let _ = self.events.send(SessionEvent::Warning(warning.clone()));
                }
                let _ = self.outbound.send(Outbound::Applied { watermark: report.watermark });
                let _ = self.events.send(SessionEvent::BatchApplied(report));
            }
            Err(aborted) => {
                for warning in &aborted.report.warnings {
                    let _ = self.events.send(SessionEvent::Warning(warning.clone()));
                }
                let watermark = self.mediator.watermark();
                let _ = self.outbound.send(Outbound::Aborted { watermark });
                let _ = self.events.send(SessionEvent::BatchAborted {
                    seq: aborted.seq,
                    watermark,
                    error: aborted.to_string(),
                });
            }
        }
    }
}
