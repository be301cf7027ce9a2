//! A single worker: lock, process, release.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::processor::{ProcessOutcome, Processor};
use crate::queue::JobQueue;
use crate::record::{JobId, JobStatus};
use crate::storage::TaskStore;

/// What happened to one job during one worker iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Another worker holds a live lease, or the job is not in an acquirable
    /// status. Nothing was changed.
    LockDenied,
    /// The processor reported success.
    Succeeded,
    /// The processor failed (or panicked); the record is now `failed`.
    Failed { error: String },
}

/// One worker identity bound to a store and a processor.
pub struct Worker<S> {
    id: String,
    store: Arc<S>,
    processor: Arc<dyn Processor>,
    lock_timeout: Duration,
}

impl<S: TaskStore> Worker<S> {
    /// Create a worker that takes leases as `id` for `lock_timeout`.
    pub fn new(
        id: impl Into<String>,
        store: Arc<S>,
        processor: Arc<dyn Processor>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            processor,
            lock_timeout,
        }
    }

    /// Lock holder id written into records this worker acquires.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one attempt on `job_id`.
    ///
    /// Processor failures and panics are turned into [`Attempt::Failed`].
    /// The lock is released once the outcome is recorded.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if acquiring, recording the outcome or
    /// releasing fails. When the outcome could not be recorded the lease is
    /// left in place and the record stays `processing` until the reaper
    /// fails it after the lock timeout.
    pub async fn process_job(&self, job_id: &JobId) -> Result<Attempt, StoreError> {
        let acquired = self
            .store
            .try_acquire(job_id, &self.id, Utc::now(), self.lock_timeout)
            .await?;
        if !acquired {
            debug!(worker_id = %self.id, job_id = %job_id, "Lock not acquired, skipping");
            return Ok(Attempt::LockDenied);
        }
        debug!(worker_id = %self.id, job_id = %job_id, "Lock acquired");

        let attempt = match self.run_processor(job_id).await {
            ProcessOutcome::Succeeded => {
                let status = self.ensure_completed(job_id).await?;
                if status == Some(JobStatus::Completed) {
                    info!(worker_id = %self.id, job_id = %job_id, "Job completed");
                } else {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        status = ?status,
                        "Processor succeeded but job is not completed"
                    );
                }
                Attempt::Succeeded
            }
            ProcessOutcome::Failed { error } => {
                self.store.mark_failed(job_id, &error, Utc::now()).await?;
                warn!(worker_id = %self.id, job_id = %job_id, error = %error, "Job failed");
                Attempt::Failed { error }
            }
        };

        self.store.release(job_id, Utc::now()).await?;
        Ok(attempt)
    }

    /// Run the processor on its own task so a panic cannot unwind into the loop.
    async fn run_processor(&self, job_id: &JobId) -> ProcessOutcome {
        let processor = Arc::clone(&self.processor);
        let id = job_id.clone();

        match tokio::spawn(async move { processor.process(&id).await }).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                error!(worker_id = %self.id, job_id = %job_id, reason = %reason, "Processor panicked");
                ProcessOutcome::failed(format!("processor panicked: {reason}"))
            }
            Err(e) => ProcessOutcome::failed(format!("processor task cancelled: {e}")),
        }
    }

    /// Complete the record if the processor reported success without doing
    /// so. Returns the status the record ends up in.
    async fn ensure_completed(&self, job_id: &JobId) -> Result<Option<JobStatus>, StoreError> {
        let status = self.store.get(job_id).await?.map(|record| record.status);
        if status == Some(JobStatus::Processing) {
            warn!(worker_id = %self.id, job_id = %job_id, "Processor succeeded without completing job");
            self.store.mark_completed(job_id, Utc::now()).await?;
            return Ok(Some(JobStatus::Completed));
        }
        Ok(status)
    }

    /// Pop and process jobs until `shutdown` fires.
    ///
    /// Shutdown is observed between jobs; an attempt in progress runs to the end.
    pub(crate) async fn run(
        self,
        queue: JobQueue,
        mut shutdown: broadcast::Receiver<()>,
        error_pause: Duration,
    ) {
        debug!(worker_id = %self.id, "Worker starting");

        loop {
            let ack = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                ack = queue.pop() => match ack {
                    Some(ack) => ack,
                    None => break,
                },
            };

            let job_id = ack.job_id();
            if let Err(e) = self.process_job(job_id).await {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Store error while processing job"
                );
                drop(ack);
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(error_pause) => {}
                }
                continue;
            }
            drop(ack);
        }

        debug!(worker_id = %self.id, "Worker shutting down");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
