//! Time-scheduled execution
//!
//! Runs caller-supplied actions at an exact synchronized instant. Actions
//! fire on spawned tokio tasks, never inline in the caller, and every
//! pending timer is tied to the engine's lifetime through a shutdown
//! channel so dropping the engine leaks nothing.

use std::sync::Arc;

use tokio::sync::watch;

use crate::clock::{SyncClock, SyncInstant};

/// Schedules actions on the synchronized timeline.
pub struct Scheduler {
    clock: Arc<SyncClock>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(clock: Arc<SyncClock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { clock, shutdown_tx }
    }

    /// Run `action` when the synchronized clock reaches `at`.
    ///
    /// An instant already in the past fires as soon as possible. Two
    /// actions scheduled for the same instant may fire in either order;
    /// earlier instants never fire after later ones.
    pub fn run_at<F>(&self, at: SyncInstant, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.clock.until(at);
        let mut shutdown = self.shutdown_tx.subscribe();

        tracing::debug!(at = %at, delay_ms = delay.as_millis() as u64, "scheduling action");

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => action(),
                _ = shutdown.changed() => {
                    tracing::debug!(at = %at, "scheduled action dropped at shutdown");
                }
            }
        });
    }

    /// Current synchronized time, for callers computing target instants.
    pub fn now(&self) -> SyncInstant {
        self.clock.now()
    }

    /// Abort every pending timer.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Slack allowed between the target instant and actual execution.
    const FIRE_SLACK: Duration = Duration::from_millis(150);

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fires_at_or_after_instant() {
        let clock = Arc::new(SyncClock::new());
        let scheduler = Scheduler::new(clock.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let at = clock.now().plus(Duration::from_millis(80));
        let fire_clock = clock.clone();
        scheduler.run_at(at, move || {
            let _ = tx.send(fire_clock.now());
        });

        let fired_at = rx.recv().await.expect("action fired");
        assert!(fired_at >= at, "fired {} before target {}", fired_at, at);
        assert!(fired_at.nanos_since(at) < FIRE_SLACK.as_nanos() as i64);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ascending_instants_fire_in_order() {
        let clock = Arc::new(SyncClock::new());
        let scheduler = Scheduler::new(clock.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Submit out of order; fire order must follow the instants.
        for (label, delay_ms) in [(2u32, 120u64), (0, 40), (1, 80)] {
            let at = clock.now().plus(Duration::from_millis(delay_ms));
            let order = order.clone();
            let tx = tx.clone();
            scheduler.run_at(at, move || {
                order.lock().unwrap().push(label);
                let _ = tx.send(());
            });
        }

        for _ in 0..3 {
            rx.recv().await.expect("action fired");
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_past_instant_fires_promptly() {
        let clock = Arc::new(SyncClock::new());
        let scheduler = Scheduler::new(clock.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let past = SyncInstant::from_nanos(clock.now().as_nanos() - 1_000_000_000);
        scheduler.run_at(past, move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(FIRE_SLACK, rx.recv())
            .await
            .expect("fired within slack")
            .expect("channel open");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_drops_pending_actions() {
        let clock = Arc::new(SyncClock::new());
        let scheduler = Scheduler::new(clock.clone());
        let fired = Arc::new(AtomicBool::new(false));

        let at = clock.now().plus(Duration::from_millis(100));
        let flag = fired.clone();
        scheduler.run_at(at, move || {
            flag.store(true, Ordering::SeqCst);
        });

        drop(scheduler);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
