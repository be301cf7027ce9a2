//! The scheduler context: store, queue, processor and config in one place.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::pool::{WorkerPool, worker_id};
use crate::processor::Processor;
use crate::queue::JobQueue;
use crate::reaper::Reaper;
use crate::record::{JobId, JobRecord, JobStatus, RetryStats};
use crate::retry::RetryScheduler;
use crate::storage::TaskStore;
use crate::worker::Worker;

/// Builder for [`Scheduler`].
///
/// # Example
///
/// ```rust,no_run
/// use ingest_queue::{MemoryStore, ProcessOutcome, Scheduler, processor_fn};
///
/// # async fn example() -> Result<(), ingest_queue::SchedulerError> {
/// let scheduler = Scheduler::builder()
///     .store(MemoryStore::new())
///     .processor(processor_fn(|_id| async { ProcessOutcome::Succeeded }))
///     .workers(4)
///     .build()?;
///
/// let handle = scheduler.start();
/// let job = handle.enqueue_new().await?;
/// handle.wait_idle().await;
/// println!("{:?}", handle.job(&job.id).await?);
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder<S> {
    store: Option<Arc<S>>,
    processor: Option<Arc<dyn Processor>>,
    config: SchedulerConfig,
}

impl<S: TaskStore> SchedulerBuilder<S> {
    /// A builder with default configuration and no parts.
    pub fn new() -> Self {
        Self {
            store: None,
            processor: None,
            config: SchedulerConfig::default(),
        }
    }

    /// Use `store` as the task store.
    pub fn store(self, store: S) -> Self {
        self.shared_store(Arc::new(store))
    }

    /// Use a store that is also held elsewhere.
    pub fn shared_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run `processor` for every acquired job.
    pub fn processor(self, processor: impl Processor) -> Self {
        self.shared_processor(Arc::new(processor))
    }

    /// Use a processor that is also held elsewhere.
    pub fn shared_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the number of workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Validate and assemble the scheduler.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::MissingStore`] or [`SchedulerError::MissingProcessor`]
    /// when a part is absent, [`SchedulerError::InvalidConfig`] when the
    /// configuration fails [`SchedulerConfig::validate`].
    pub fn build(self) -> Result<Scheduler<S>, SchedulerError> {
        let store = self.store.ok_or(SchedulerError::MissingStore)?;
        let processor = self.processor.ok_or(SchedulerError::MissingProcessor)?;
        self.config.validate()?;

        Ok(Scheduler {
            store,
            processor,
            queue: JobQueue::new(),
            config: self.config,
        })
    }
}

impl<S: TaskStore> Default for SchedulerBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured, not yet running scheduler.
///
/// The parts are exposed so single steps (one attempt, one retry cycle, one
/// reap pass) can be driven without starting the background loops.
pub struct Scheduler<S> {
    store: Arc<S>,
    processor: Arc<dyn Processor>,
    queue: JobQueue,
    config: SchedulerConfig,
}

impl<S: TaskStore> Scheduler<S> {
    /// Start building a scheduler.
    pub fn builder() -> SchedulerBuilder<S> {
        SchedulerBuilder::new()
    }

    /// The task store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The queue workers will drain.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The validated configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Worker number `n` (1-based), as the pool would name it.
    pub fn worker(&self, n: usize) -> Worker<S> {
        Worker::new(
            worker_id(&self.config.pool_name, n),
            Arc::clone(&self.store),
            Arc::clone(&self.processor),
            self.config.lock_timeout,
        )
    }

    /// A reaper with a fresh maintenance gate.
    pub fn reaper(&self) -> Reaper<S> {
        Reaper::new(Arc::clone(&self.store), self.config.lock_timeout)
    }

    /// A retry scheduler sharing `reaper`'s maintenance gate.
    pub fn retry_scheduler(&self, reaper: Reaper<S>) -> RetryScheduler<S> {
        RetryScheduler::new(
            Arc::clone(&self.store),
            self.queue.clone(),
            reaper,
            self.config.retry_interval,
            self.config.retry_error_backoff,
        )
    }

    /// Spawn the worker pool, the retry loop and the reaper loop.
    #[must_use = "the handle must be kept to submit jobs and shut down"]
    pub fn start(self) -> SchedulerHandle<S> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let pool = WorkerPool::spawn(
            Arc::clone(&self.store),
            self.queue.clone(),
            Arc::clone(&self.processor),
            &self.config.pool_settings(),
        );

        let reaper = self.reaper();
        let retry = self.retry_scheduler(reaper.clone());
        let maintenance = vec![
            tokio::spawn(retry.run(shutdown_tx.subscribe())),
            tokio::spawn(reaper.run(self.config.reaper_interval, shutdown_tx.subscribe())),
        ];

        info!(
            workers = self.config.workers,
            pool = %self.config.pool_name,
            lock_timeout_secs = self.config.lock_timeout.as_secs(),
            retry_interval_secs = self.config.retry_interval.as_secs(),
            reaper_interval_secs = self.config.reaper_interval.as_secs(),
            "Scheduler started"
        );

        SchedulerHandle {
            store: self.store,
            queue: self.queue,
            config: self.config,
            pool,
            maintenance,
            shutdown_tx,
        }
    }
}

/// A running scheduler.
pub struct SchedulerHandle<S> {
    store: Arc<S>,
    queue: JobQueue,
    config: SchedulerConfig,
    pool: WorkerPool,
    maintenance: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S: TaskStore> SchedulerHandle<S> {
    /// Queue an existing job. `false` if it is already queued or in flight.
    pub fn submit(&self, id: JobId) -> bool {
        self.queue.submit(id)
    }

    /// Create a `pending` record with the configured retry budget and queue it.
    pub async fn enqueue_new(&self) -> Result<JobRecord, SchedulerError> {
        let record = self.store.create(self.config.max_retries, Utc::now()).await?;
        self.queue.submit(record.id.clone());
        Ok(record)
    }

    /// Current record for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the lookup fails.
    pub async fn job(&self, id: &JobId) -> Result<Option<JobRecord>, SchedulerError> {
        Ok(self.store.get(id).await?)
    }

    /// Retry statistics over failed jobs.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the aggregation fails.
    pub async fn stats(&self) -> Result<RetryStats, SchedulerError> {
        Ok(self.store.retry_stats().await?)
    }

    /// Queue every `pending` record. Returns how many were accepted.
    ///
    /// The queue lives in memory, so jobs created before a restart are only
    /// picked up again through this call.
    pub async fn requeue_pending(&self) -> Result<usize, SchedulerError> {
        let pending = self
            .store
            .list_by_status(JobStatus::Pending, usize::MAX)
            .await?;

        let accepted = pending
            .into_iter()
            .filter(|record| self.queue.submit(record.id.clone()))
            .count();
        if accepted > 0 {
            info!(accepted, "Requeued pending jobs");
        }
        Ok(accepted)
    }

    /// The shared job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The task store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Wait until every queued job has been attempted.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Stop the maintenance loops and the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::WorkerPanicked`] if any loop panicked.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        let _ = self.shutdown_tx.send(());

        let mut panicked = None;
        for handle in self.maintenance {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance loop ended abnormally");
                panicked.get_or_insert(SchedulerError::WorkerPanicked {
                    reason: format!("maintenance loop panicked: {e}"),
                });
            }
        }

        self.pool.shutdown().await?;
        match panicked {
            Some(err) => Err(err),
            None => {
                info!("Scheduler shut down");
                Ok(())
            }
        }
    }
}
