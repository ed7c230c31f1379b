//! Periodic background jobs.
//!
//! Two independent jobs run on their own intervals:
//! - `notify_expiring`: renewal reminders
//! - `deactivate_expired`: closes expired orders and revokes their keys
//!
//! All jobs share one `CancellationToken`. Cancelling stops the next tick from
//! starting; a tick already running is allowed to finish.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::services::lifecycle::LifecycleEngine;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerIntervals {
    pub notify_expiring: Duration,
    pub deactivate_expired: Duration,
}

pub struct ExpirationScheduler {
    engine: LifecycleEngine,
    intervals: SchedulerIntervals,
    shutdown: CancellationToken,
}

impl ExpirationScheduler {
    pub fn new(
        engine: LifecycleEngine,
        intervals: SchedulerIntervals,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            intervals,
            shutdown,
        }
    }

    /// Spawns both jobs. The handles resolve once the token is cancelled.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let notify_engine = self.engine.clone();
        let notify = tokio::spawn(run_periodic(
            "notify_expiring",
            self.intervals.notify_expiring,
            self.shutdown.clone(),
            move || {
                let engine = notify_engine.clone();
                async move {
                    match engine.notify_expiring().await {
                        Ok(report) if report.notified > 0 || report.failed > 0 => {
                            tracing::info!(
                                job = "notify_expiring",
                                notified = report.notified,
                                skipped = report.skipped,
                                failed = report.failed,
                                "Renewal reminders processed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(job = "notify_expiring", error = %e, "Job failed");
                        }
                    }
                }
            },
        ));

        let deactivate_engine = self.engine;
        let deactivate = tokio::spawn(run_periodic(
            "deactivate_expired",
            self.intervals.deactivate_expired,
            self.shutdown,
            move || {
                let engine = deactivate_engine.clone();
                async move {
                    match engine.deactivate_expired().await {
                        Ok(report) => {
                            tracing::info!(
                                job = "deactivate_expired",
                                expired = report.expired.len(),
                                keys_revoked = report.keys_revoked,
                                keys_deferred = report.keys_deferred,
                                revocations_resolved = report.retried.resolved,
                                revocations_pending = report.retried.still_pending,
                                failed = report.failed,
                                "Expired orders processed"
                            );
                        }
                        Err(e) => {
                            tracing::error!(job = "deactivate_expired", error = %e, "Job failed");
                        }
                    }
                }
            },
        ));

        vec![notify, deactivate]
    }
}

/// Runs `job` every `period` until `shutdown` is cancelled.
///
/// The first run happens one period after start. Missed ticks are skipped,
/// so a slow run never causes a burst of catch-up runs.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(job = name, period_secs = period.as_secs_f64(), "Job started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(job = name, "Job stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        job().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::models::order::{OrderStatus, OwnerId, OwnerProfile};
    use crate::store::OrderStore;
    use crate::testing::harness;

    #[tokio::test]
    async fn runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let counter = runs.clone();
        let handle = tokio::spawn(run_periodic(
            "count",
            Duration::from_millis(10),
            shutdown.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel >= 2, "ran {after_cancel} times");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn in_flight_run_finishes_after_cancel() {
        let finished = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let flag = finished.clone();
        let handle = tokio::spawn(run_periodic(
            "slow",
            Duration::from_millis(10),
            shutdown.clone(),
            move || {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    flag.store(true, Ordering::SeqCst);
                }
            },
        ));

        // Cancel while the first run is sleeping
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn never_runs_when_cancelled_before_first_tick() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let counter = runs.clone();
        run_periodic("idle", Duration::from_millis(5), shutdown, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scheduler_deactivates_expired_orders() {
        let h = harness();
        let placed = h
            .engine
            .place(OwnerId(42), OwnerProfile::default(), 2)
            .await
            .unwrap();
        h.engine.approve(placed.order_id).await.unwrap();
        h.clock.advance(ChronoDuration::days(31));

        let shutdown = CancellationToken::new();
        let handles = ExpirationScheduler::new(
            h.engine.clone(),
            SchedulerIntervals {
                notify_expiring: Duration::from_millis(10),
                deactivate_expired: Duration::from_millis(10),
            },
            shutdown.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let order = h.store.get_order(placed.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Expired);
        assert_eq!(h.provisioner.deleted_ids().len(), 2);
    }
}
