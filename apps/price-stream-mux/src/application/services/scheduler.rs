//! Batch Scheduler
//!
//! Coalesces subscribe/unsubscribe changes made within a short window into a
//! single wire instruction. A page that mounts twenty widgets in one render
//! pass produces one subscribe message, not twenty.
//!
//! The scheduler owns the [`PendingDiff`] and the outbound link to the live
//! connection. While there is no link, changes are held; the next connection
//! replaces them with a replay of the full interest set.
//!
//! # Timing
//!
//! The first [`BatchScheduler::record`] after a flush arms the coalescing
//! timer. [`BatchScheduler::run_timer`] waits for the arm signal, sleeps for
//! `batch_window` and then fires the flush callback. With a zero window the
//! timer never runs and flushing is manual.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::{PendingDiff, WireInstruction};
use crate::domain::symbols::CanonicalSymbol;
use crate::infrastructure::metrics::{self, InstructionKind};

struct Outbox {
    pending: PendingDiff,
    link: Option<mpsc::UnboundedSender<WireInstruction>>,
    armed: bool,
}

/// Snapshot of scheduler state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Symbols waiting to be subscribed.
    pub pending_subscribes: usize,
    /// Symbols waiting to be unsubscribed.
    pub pending_unsubscribes: usize,
    /// Whether a live connection is attached.
    pub linked: bool,
    /// Whether the coalescing timer is armed.
    pub armed: bool,
}

/// Debounced flusher of the pending diff.
pub struct BatchScheduler {
    outbox: Mutex<Outbox>,
    arm_signal: Notify,
    batch_window: Duration,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("batch_window", &self.batch_window)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    /// Create a scheduler with the given coalescing window.
    #[must_use]
    pub fn new(batch_window: Duration) -> Self {
        Self {
            outbox: Mutex::new(Outbox {
                pending: PendingDiff::default(),
                link: None,
                armed: false,
            }),
            arm_signal: Notify::new(),
            batch_window,
        }
    }

    /// Coalescing window.
    #[must_use]
    pub const fn batch_window(&self) -> Duration {
        self.batch_window
    }

    /// Merge wire-level changes into the pending diff.
    ///
    /// Returns `true` when this call armed the timer (first change after a
    /// flush).
    pub fn record(&self, newly_needed: Vec<CanonicalSymbol>, released: Vec<CanonicalSymbol>) -> bool {
        if newly_needed.is_empty() && released.is_empty() {
            return false;
        }

        let mut outbox = self.outbox.lock();
        outbox.pending.add(newly_needed);
        outbox.pending.remove(released);

        if outbox.armed {
            return false;
        }

        outbox.armed = true;
        drop(outbox);

        self.arm_signal.notify_one();
        true
    }

    /// Hand the pending diff to the connection as one instruction.
    ///
    /// `spell` expands each canonical symbol into its wire spellings. Returns
    /// the instruction that was sent, or `None` when there was nothing to
    /// send or no live connection (the diff is then held).
    pub fn flush<F>(&self, spell: F) -> Option<WireInstruction>
    where
        F: FnMut(&CanonicalSymbol) -> Vec<String>,
    {
        let mut outbox = self.outbox.lock();
        outbox.armed = false;

        if outbox.pending.is_empty() {
            return None;
        }

        let Some(link) = outbox.link.clone() else {
            tracing::trace!("No live connection; holding pending diff");
            return None;
        };

        let diff = outbox.pending.take();
        let instruction = WireInstruction::from_diff(&diff, spell);

        if let Err(error) = link.send(instruction.clone()) {
            // Connection task is gone; keep the diff for the reconnect path
            tracing::debug!(error = %error, "Outbound link closed during flush");
            outbox.pending = diff;
            outbox.link = None;
            return None;
        }
        drop(outbox);

        tracing::debug!(
            subscribe = instruction.subscribe.len(),
            unsubscribe = instruction.unsubscribe.len(),
            "Flushed subscription batch"
        );
        metrics::record_instruction_sent(
            InstructionKind::Flush,
            instruction.subscribe.len() + instruction.unsubscribe.len(),
        );

        Some(instruction)
    }

    /// Install a new live link, discarding any pending diff.
    ///
    /// `replay` (the full interest set) is queued on the link before any
    /// later flush can use it.
    pub fn attach(&self, link: mpsc::UnboundedSender<WireInstruction>, replay: WireInstruction) {
        let mut outbox = self.outbox.lock();
        outbox.pending.clear();
        outbox.armed = false;

        if !replay.is_empty() {
            let symbols = replay.subscribe.len();
            if link.send(replay).is_err() {
                tracing::debug!("Outbound link closed before replay");
                outbox.link = None;
                return;
            }
            metrics::record_instruction_sent(InstructionKind::Replay, symbols);
        }

        outbox.link = Some(link);
    }

    /// Drop the live link; later changes are held.
    pub fn detach(&self) {
        self.outbox.lock().link = None;
    }

    /// Whether a live link is attached.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.outbox
            .lock()
            .link
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    /// Snapshot of the pending diff.
    #[must_use]
    pub fn pending(&self) -> PendingDiff {
        self.outbox.lock().pending.clone()
    }

    /// Scheduler statistics.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let outbox = self.outbox.lock();
        SchedulerStats {
            pending_subscribes: outbox.pending.subscribe.len(),
            pending_unsubscribes: outbox.pending.unsubscribe.len(),
            linked: outbox.link.is_some(),
            armed: outbox.armed,
        }
    }

    /// Drive timed flushes until cancelled.
    ///
    /// Returns immediately when the window is zero.
    pub async fn run_timer<F>(&self, cancel: CancellationToken, mut on_fire: F)
    where
        F: FnMut() + Send,
    {
        if self.batch_window.is_zero() {
            tracing::debug!("Batch window is zero; flushing manually");
            return;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.arm_signal.notified() => {}
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.batch_window) => on_fire(),
            }
        }

        tracing::debug!("Batch timer stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::domain::symbols::AliasResolver;

    fn sym(raw: &str) -> CanonicalSymbol {
        AliasResolver::default().canonicalize(raw)
    }

    fn canonical(symbol: &CanonicalSymbol) -> Vec<String> {
        vec![symbol.to_string()]
    }

    #[test]
    fn first_record_arms() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));

        assert!(scheduler.record(vec![sym("EURUSD")], vec![]));
        assert!(!scheduler.record(vec![sym("USDJPY")], vec![]));
        assert!(scheduler.stats().armed);
    }

    #[test]
    fn empty_record_does_not_arm() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));
        assert!(!scheduler.record(vec![], vec![]));
        assert!(!scheduler.stats().armed);
    }

    #[test]
    fn flush_without_link_holds_diff() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));
        scheduler.record(vec![sym("EURUSD")], vec![]);

        assert!(scheduler.flush(canonical).is_none());
        assert_eq!(scheduler.stats().pending_subscribes, 1);

        // Flushing disarms, so the next change re-arms
        assert!(scheduler.record(vec![sym("USDJPY")], vec![]));
    }

    #[test]
    fn flush_sends_one_instruction() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.attach(tx, WireInstruction::default());

        scheduler.record(vec![sym("EURUSD")], vec![]);
        scheduler.record(vec![sym("USDJPY")], vec![]);
        let sent = scheduler.flush(canonical).unwrap();

        assert_eq!(sent.subscribe, vec!["EURUSD", "USDJPY"]);
        assert_eq!(rx.try_recv().unwrap(), sent);
        assert!(rx.try_recv().is_err());
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn opposite_changes_cancel_before_flush() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.attach(tx, WireInstruction::default());

        scheduler.record(vec![sym("EURUSD")], vec![]);
        scheduler.record(vec![], vec![sym("EURUSD")]);

        assert!(scheduler.flush(canonical).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn attach_replays_and_clears_pending() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));
        scheduler.record(vec![sym("EURUSD")], vec![sym("GBPUSD")]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let replay = WireInstruction::subscribe_only(vec!["EURUSD".into(), "XAUUSD".into()]);
        scheduler.attach(tx, replay.clone());

        assert_eq!(rx.try_recv().unwrap(), replay);
        assert!(scheduler.pending().is_empty());
        assert!(scheduler.is_linked());
        assert!(scheduler.flush(canonical).is_none());
    }

    #[test]
    fn closed_link_restores_diff() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));
        let (tx, rx) = mpsc::unbounded_channel();
        scheduler.attach(tx, WireInstruction::default());
        drop(rx);

        scheduler.record(vec![sym("EURUSD")], vec![]);

        assert!(scheduler.flush(canonical).is_none());
        assert_eq!(scheduler.stats().pending_subscribes, 1);
        assert!(!scheduler.stats().linked);
    }

    #[test]
    fn detach_holds_later_changes() {
        let scheduler = BatchScheduler::new(Duration::from_millis(50));
        let (tx, _rx) = mpsc::unbounded_channel();
        scheduler.attach(tx, WireInstruction::default());
        scheduler.detach();

        scheduler.record(vec![sym("EURUSD")], vec![]);
        assert!(scheduler.flush(canonical).is_none());
        assert!(!scheduler.is_linked());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once_per_window() {
        let scheduler = Arc::new(BatchScheduler::new(Duration::from_millis(50)));
        let fired = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let scheduler = Arc::clone(&scheduler);
            let fired = Arc::clone(&fired);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let inner = Arc::clone(&scheduler);
                scheduler
                    .run_timer(cancel, move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                        inner.flush(canonical);
                    })
                    .await;
            })
        };

        scheduler.record(vec![sym("EURUSD")], vec![]);
        scheduler.record(vec![sym("USDJPY")], vec![]);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn zero_window_timer_returns() {
        let scheduler = BatchScheduler::new(Duration::ZERO);
        scheduler
            .run_timer(CancellationToken::new(), || panic!("must not fire"))
            .await;
    }
}
