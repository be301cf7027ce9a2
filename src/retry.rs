//! Retry scheduler: periodically requeues failed jobs that still have budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::queue::JobQueue;
use crate::reaper::Reaper;
use crate::storage::TaskStore;

/// Counts from one retry cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryCycleReport {
    /// Eligible failed jobs returned by the store.
    pub scanned: usize,
    /// Jobs stamped and pushed back onto the queue.
    pub requeued: usize,
    /// Jobs skipped because a worker holds their lock, including jobs whose
    /// state changed between the scan and the stamp.
    pub skipped_locked: usize,
    /// Jobs skipped because they are already queued or in flight.
    pub skipped_queued: usize,
}

/// Requeues eligible failed jobs with a fixed backoff.
///
/// Each cycle first runs a full reap pass under the maintenance gate it
/// shares with the [`Reaper`], then scans, so a reap never interleaves with
/// a retry scan.
pub struct RetryScheduler<S> {
    store: Arc<S>,
    queue: JobQueue,
    reaper: Reaper<S>,
    interval: Duration,
    error_backoff: Duration,
}

impl<S: TaskStore> RetryScheduler<S> {
    /// `interval` is both the loop period and the backoff written to
    /// `next_retry_at`. `error_backoff` replaces it after a failed cycle.
    pub fn new(
        store: Arc<S>,
        queue: JobQueue,
        reaper: Reaper<S>,
        interval: Duration,
        error_backoff: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            reaper,
            interval,
            error_backoff,
        }
    }

    /// Run one reap-then-retry cycle at `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<RetryCycleReport, StoreError> {
        let _gate = self.reaper.gate().lock().await;
        self.reaper.reap(now).await?;

        let candidates = self.store.retry_candidates(now).await?;
        let next_retry_at = now
            .checked_add_signed(TimeDelta::from_std(self.interval).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut report = RetryCycleReport {
            scanned: candidates.len(),
            ..RetryCycleReport::default()
        };

        for record in candidates {
            if record.is_locked() {
                report.skipped_locked += 1;
                continue;
            }
            if self.queue.contains(&record.id) {
                report.skipped_queued += 1;
                continue;
            }
            if !self.store.stamp_retry(&record.id, now, next_retry_at).await? {
                report.skipped_locked += 1;
                continue;
            }
            if self.queue.submit(record.id.clone()) {
                debug!(
                    job_id = %record.id,
                    retry_count = record.retry_count + 1,
                    max_retries = record.max_retries,
                    "Job requeued for retry"
                );
                report.requeued += 1;
            } else {
                report.skipped_queued += 1;
            }
        }

        Ok(report)
    }

    async fn log_stats(&self) {
        match self.store.retry_stats().await {
            Ok(stats) => info!(
                total_failed = stats.total_failed,
                avg_retry_count = stats.avg_retry_count,
                max_retry_count = stats.max_retry_count,
                eligible_for_retry = stats.eligible_for_retry,
                "Retry statistics"
            ),
            Err(e) => warn!(error = %e, "Failed to collect retry statistics"),
        }
    }

    /// Run a cycle every `interval` until `shutdown` fires. The first cycle
    /// runs one interval after start.
    pub(crate) async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut pause = self.interval;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(pause) => {}
            }

            pause = match self.run_cycle(Utc::now()).await {
                Ok(report) => {
                    if report.requeued > 0 {
                        info!(
                            scanned = report.scanned,
                            requeued = report.requeued,
                            skipped_locked = report.skipped_locked,
                            skipped_queued = report.skipped_queued,
                            "Retry cycle finished"
                        );
                    }
                    self.log_stats().await;
                    self.interval
                }
                Err(e) => {
                    error!(error = %e, "Retry cycle failed");
                    self.error_backoff
                }
            };
        }
    }
}
