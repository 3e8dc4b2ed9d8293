//! Background fetch/push timing.
//!
//! The scheduler is a tokio task that owns the [`ServerChannel`] and nothing
//! else. It never touches the document: fetched transforms are pre-sorted,
//! filtered against its own watermark hint and posted to the session as
//! [`Inbound`] messages for the mutation thread to apply.
//!
//! ```text
//!   Scheduler task                 mpsc           SyncSession (mutation thread)
//!   ┌──────────────────────┐   ──Inbound──▶   ┌──────────────────────────────┐
//!   │ fetch timer + backoff│                  │ pump(): Mediator::apply_batch │
//!   │ push timer + backoff │   ◀─Outbound──   │ collect / acknowledge         │
//!   └──────────────────────┘                  └──────────────────────────────┘
//! ```
//!
//! Pushes go the other way: the push timer posts [`Inbound::PushDue`], the
//! session answers with the collected changes, and the scheduler sends them.

use std::sync::Arc;
use std::time::Duration;

use docsync_core::{Seq, Transform};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::channel::{ChannelError, LocalChange, PushAck, ServerChannel};
use crate::config::SchedulerConfig;
use crate::constants::MAX_BACKOFF_SHIFT;

/// Scheduler → session.
#[derive(Debug)]
pub enum Inbound {
    /// Fetched transforms, sorted, all above the scheduler's hint.
    Transforms(Vec<Transform>),
    /// Time to collect local changes.
    PushDue,
    PushAcked { sent: Vec<LocalChange>, ack: PushAck },
    PushFailed { sent: Vec<LocalChange>, error: ChannelError },
    FetchFailed(ChannelError),
}

/// Session → scheduler.
#[derive(Debug)]
pub enum Outbound {
    /// Changes collected for a [`Inbound::PushDue`]; may be empty.
    Push(Vec<LocalChange>),
    /// A batch finished; `watermark` is authoritative.
    Applied { watermark: Seq },
    /// A batch aborted; refetch from `watermark` after backing off.
    Aborted { watermark: Seq },
}

/// Retry delay after `failures` consecutive failures.
pub(crate) fn backoff(period: Duration, failures: u32, max: Duration) -> Duration {
    if failures == 0 {
        return period;
    }
    let factor = 1u32 << failures.min(MAX_BACKOFF_SHIFT);
    period.saturating_mul(factor).min(max)
}

struct Scheduler {
    channel: Arc<dyn ServerChannel>,
    config: SchedulerConfig,
    inbound: mpsc::UnboundedSender<Inbound>,
    /// Highest sequence handed to the session. Only a hint: the mediator
    /// re-checks every transform against its own watermark.
    hint: Seq,
    fetch_failures: u32,
    push_failures: u32,
    next_fetch: Instant,
    next_push: Instant,
    /// A `PushDue` is outstanding; the push timer waits for the answer.
    push_requested: bool,
}

/// Spawn the scheduler task. Must be called inside a tokio runtime.
pub(crate) fn spawn_scheduler(
    channel: Arc<dyn ServerChannel>,
    config: SchedulerConfig,
    watermark: Seq,
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let start = Instant::now() + config.initial_delay();
    let scheduler = Scheduler {
        channel,
        config,
        inbound,
        hint: watermark,
        fetch_failures: 0,
        push_failures: 0,
        next_fetch: start,
        next_push: start,
        push_requested: false,
    };
    tokio::spawn(scheduler.run(outbound, cancel).instrument(info_span!("scheduler")))
}

impl Scheduler {
    async fn run(
        mut self,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
    ) {
        info!(
            initial_delay_ms = self.config.initial_delay_ms,
            fetch_period_ms = self.config.fetch_period_ms,
            push_period_ms = self.config.push_period_ms,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = outbound.recv() => match msg {
                    Some(msg) => self.handle_outbound(msg).await,
                    // Session dropped without closing.
                    None => break,
                },
                _ = sleep_until(self.next_fetch) => self.fetch().await,
                _ = sleep_until(self.next_push), if !self.push_requested => {
                    self.push_requested = true;
                    if self.inbound.send(Inbound::PushDue).is_err() {
                        break;
                    }
                }
            }
        }
        debug!(hint = %self.hint, "scheduler stopped");
    }

    async fn fetch(&mut self) {
        let span = info_span!("fetch.transforms", since = %self.hint);
        let result = self.channel.fetch_transforms_since(self.hint).instrument(span).await;
        match result {
            Ok(mut batch) => {
                self.fetch_failures = 0;
                batch.sort_by_key(|t| t.seq);
                batch.retain(|t| t.seq > self.hint);
                batch.dedup_by_key(|t| t.seq);
                if let Some(last) = batch.last() {
                    trace!(count = batch.len(), last = %last.seq, "fetched transforms");
                    self.hint = last.seq;
                    let _ = self.inbound.send(Inbound::Transforms(batch));
                }
                self.next_fetch = Instant::now() + self.config.fetch_period();
            }
            Err(e) => {
                let delay = self.fetch_backoff();
                let retry_ms = delay.as_millis() as u64;
                warn!(failures = self.fetch_failures, retry_ms, "fetch failed: {e}");
                let _ = self.inbound.send(Inbound::FetchFailed(e));
            }
        }
    }

    /// Count a failed fetch round and push the next fetch out accordingly.
    fn fetch_backoff(&mut self) -> Duration {
        self.fetch_failures = self.fetch_failures.saturating_add(1);
        let delay =
            backoff(self.config.fetch_period(), self.fetch_failures, self.config.max_backoff());
        self.next_fetch = Instant::now() + delay;
        delay
    }

    async fn handle_outbound(&mut self, msg: Outbound) {
        match msg {
            Outbound::Applied { watermark } => {
                self.hint = self.hint.max(watermark);
            }
            Outbound::Aborted { watermark } => {
                // Refetch everything past the last transform that stuck.
                self.hint = watermark;
                let delay = self.fetch_backoff();
                let retry_ms = delay.as_millis() as u64;
                debug!(%watermark, retry_ms, "batch aborted, refetch scheduled");
            }
            Outbound::Push(changes) => {
                self.push_requested = false;
                if changes.is_empty() {
                    self.next_push = Instant::now() + self.config.push_period();
                } else {
                    self.push(changes).await;
                }
            }
        }
    }

    async fn push(&mut self, changes: Vec<LocalChange>) {
        let span = info_span!("push.changes", count = changes.len());
        let result = self.channel.push_local_changes(&changes).instrument(span).await;
        match result {
            Ok(ack) => {
                self.push_failures = 0;
                self.next_push = Instant::now() + self.config.push_period();
                let _ = self.inbound.send(Inbound::PushAcked { sent: changes, ack });
            }
            Err(error) => {
                self.push_failures = self.push_failures.saturating_add(1);
                let delay = backoff(
                    self.config.push_period(),
                    self.push_failures,
                    self.config.max_backoff(),
                );
                self.next_push = Instant::now() + delay;
                let retry_ms = delay.as_millis() as u64;
                warn!(failures = self.push_failures, retry_ms, "push failed: {error}");
                let _ = self.inbound.send(Inbound::PushFailed { sent: changes, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{BlockId, TransformOp};

    use crate::channel::MemoryChannel;

    fn config() -> SchedulerConfig {
        SchedulerConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            Duration::from_millis(5000),
        )
        .with_max_backoff(Duration::from_millis(8000))
    }

    fn delete(seq: u64) -> Transform {
        Transform::new(seq, TransformOp::Delete { block_id: BlockId::new(seq) })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let period = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff(period, 0, max), Duration::from_secs(1));
        assert_eq!(backoff(period, 1, max), Duration::from_secs(2));
        assert_eq!(backoff(period, 3, max), Duration::from_secs(8));
        assert_eq!(backoff(period, 5, max), Duration::from_secs(30));
        assert_eq!(backoff(period, u32::MAX, max), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_on_schedule_and_sorts() {
        let channel = MemoryChannel::new();
        channel.publish_all([delete(3), delete(1), delete(2)]);
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = spawn_scheduler(
            Arc::new(channel.clone()),
            config(),
            Seq::ZERO,
            in_tx,
            out_rx,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.fetch_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.fetch_count(), 1);
        let mut seqs = Vec::new();
        while let Ok(msg) = in_rx.try_recv() {
            if let Inbound::Transforms(batch) = msg {
                seqs.extend(batch.iter().map(|t| t.seq.get()));
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);

        // Nothing new: the next fetch delivers nothing.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(channel.fetch_count(), 2);
        assert!(!matches!(in_rx.try_recv(), Ok(Inbound::Transforms(_))));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_backs_off() {
        let channel = MemoryChannel::new();
        channel.fail_fetches(2);
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = spawn_scheduler(
            Arc::new(channel.clone()),
            config(),
            Seq::ZERO,
            in_tx,
            out_rx,
            cancel.clone(),
        );

        // t=100 first failure, retry after 2s.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(channel.fetch_count(), 1);
        assert!(matches!(in_rx.try_recv(), Ok(Inbound::FetchFailed(_))));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(channel.fetch_count(), 1);

        // t=2100 second failure, retry after 4s.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(channel.fetch_count(), 2);

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(channel.fetch_count(), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_rewinds_hint() {
        let channel = MemoryChannel::new();
        channel.publish_all([delete(1), delete(2)]);
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = spawn_scheduler(
            Arc::new(channel.clone()),
            config(),
            Seq::ZERO,
            in_tx,
            out_rx,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(in_rx.try_recv(), Ok(Inbound::Transforms(b)) if b.len() == 2));

        // Aborted at t=150: the refetch backs off to t=2150.
        out_tx.send(Outbound::Aborted { watermark: Seq::new(1) }).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(channel.fetch_count(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(channel.fetch_count(), 2);
        let refetched: Vec<u64> = std::iter::from_fn(|| in_rx.try_recv().ok())
            .filter_map(|msg| match msg {
                Inbound::Transforms(batch) => Some(batch),
                _ => None,
            })
            .flatten()
            .map(|t| t.seq.get())
            .collect();
        assert_eq!(refetched, vec![2]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_round_trip() {
        let channel = MemoryChannel::new();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = spawn_scheduler(
            Arc::new(channel.clone()),
            config(),
            Seq::ZERO,
            in_tx,
            out_rx,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut saw_push_due = false;
        while let Ok(msg) = in_rx.try_recv() {
            saw_push_due |= matches!(msg, Inbound::PushDue);
        }
        assert!(saw_push_due);

        let changes = vec![LocalChange::Delete { block_id: BlockId::new(4) }];
        out_tx.send(Outbound::Push(changes.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(channel.pushes(), vec![changes]);
        let mut acked = false;
        while let Ok(msg) = in_rx.try_recv() {
            if let Inbound::PushAcked { ack, .. } = msg {
                acked = ack.accepts(BlockId::new(4));
            }
        }
        assert!(acked);

        cancel.cancel();
        task.await.unwrap();
    }
}
