//! Heartbeat sweeper - evicts silent workers and expires overdue requests.
//!
//! Eviction only flips the worker's close signal. The worker's own channel
//! handler observes it and runs the regular teardown, so there is a single
//! teardown path regardless of why a channel ends.

use crate::domain::{ConnectionRegistry, PendingRequestTable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Workers force-closed for staleness
    pub evicted: usize,
    /// Pending requests expired past their deadline
    pub expired: usize,
}

/// Periodic staleness sweeper
pub struct HeartbeatSweeper {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingRequestTable>,
    interval: Duration,
    staleness_threshold: Duration,
}

impl HeartbeatSweeper {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingRequestTable>,
        interval: Duration,
        staleness_threshold: Duration,
    ) -> Self {
        Self {
            registry,
            pending,
            interval,
            staleness_threshold,
        }
    }

    /// Run one sweep
    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (worker_id, handle) in self.registry.stale_workers(self.staleness_threshold) {
            if handle.is_closed() {
                // Teardown already under way
                continue;
            }
            warn!(
                worker_id = %worker_id,
                threshold_secs = self.staleness_threshold.as_secs(),
                "Evicting stale worker"
            );
            handle.close();
            report.evicted += 1;
        }

        report.expired = self.pending.remove_expired();

        if report.evicted > 0 || report.expired > 0 {
            info!(
                evicted = report.evicted,
                expired = report.expired,
                "Sweep complete"
            );
        }

        report
    }

    /// Sweep on every tick until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(interval_ms = self.interval.as_millis() as u64, "Sweeper started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelId, WorkerHandle};
    use std::collections::HashMap;
    use tokio::time::{advance, Instant};

    fn sweeper() -> HeartbeatSweeper {
        HeartbeatSweeper::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(PendingRequestTable::new(16)),
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_worker_is_force_closed() {
        let sweeper = sweeper();
        let (fresh, _rx1, _c1) = WorkerHandle::channel(4);
        let (silent, _rx2, _c2) = WorkerHandle::channel(4);

        let fresh_id = sweeper
            .registry
            .register(ChannelId::next(), fresh.clone(), HashMap::new())
            .unwrap();
        sweeper
            .registry
            .register(ChannelId::next(), silent.clone(), HashMap::new())
            .unwrap();

        advance(Duration::from_secs(45)).await;
        sweeper.registry.touch(&fresh_id).unwrap();
        advance(Duration::from_secs(30)).await;

        let report = sweeper.sweep_once();
        assert_eq!(report.evicted, 1);
        assert!(silent.is_closed());
        assert!(!fresh.is_closed());

        // Already closing: not counted twice
        assert_eq!(sweeper.sweep_once().evicted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_requests_are_expired() {
        let sweeper = sweeper();
        let (_id, mut rx) = sweeper
            .pending
            .create("w1".into(), Instant::now() + Duration::from_secs(2))
            .unwrap();
        let (_id, _keep) = sweeper
            .pending
            .create("w1".into(), Instant::now() + Duration::from_secs(20))
            .unwrap();

        advance(Duration::from_secs(3)).await;

        assert_eq!(sweeper.sweep_once().expired, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(crate::domain::Termination::Timeout)
        );
        assert_eq!(sweeper.pending.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(sweeper().run(rx));

        advance(Duration::from_secs(12)).await;
        tx.send(true).unwrap();

        task.await.unwrap();
    }
}
