//! Fixed-size pool of worker loops draining a [`JobQueue`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::processor::Processor;
use crate::queue::JobQueue;
use crate::storage::TaskStore;
use crate::worker::Worker;

/// Settings shared by every worker in a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of worker loops.
    pub workers: usize,
    /// Prefix of each worker's lock-holder id (`{name}-W{n}`).
    pub name: String,
    /// Age after which another worker may take over a lease.
    pub lock_timeout: Duration,
    /// Pause after a store error outside the processor.
    pub error_pause: Duration,
}

/// Running worker loops.
///
/// Workers stop between jobs once [`WorkerPool::shutdown`] is called, so an
/// attempt already in progress finishes and releases its lock.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    /// Spawn `settings.workers` loops on the current runtime.
    #[must_use = "worker pool must be stored to keep workers running"]
    pub fn spawn<S: TaskStore>(
        store: Arc<S>,
        queue: JobQueue,
        processor: Arc<dyn Processor>,
        settings: &PoolSettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let workers = (1..=settings.workers)
            .map(|n| {
                let worker = Worker::new(
                    worker_id(&settings.name, n),
                    Arc::clone(&store),
                    Arc::clone(&processor),
                    settings.lock_timeout,
                );
                tokio::spawn(worker.run(
                    queue.clone(),
                    shutdown_tx.subscribe(),
                    settings.error_pause,
                ))
            })
            .collect();

        debug!(workers = settings.workers, pool = %settings.name, "Worker pool started");
        Self {
            workers,
            shutdown_tx,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker and wait for them to exit.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::WorkerPanicked`] if a worker loop panicked.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        let _ = self.shutdown_tx.send(());

        for (idx, handle) in self.workers.into_iter().enumerate() {
            handle.await.map_err(|e| SchedulerError::WorkerPanicked {
                reason: format!("worker {} panicked: {e}", idx + 1),
            })?;
        }

        info!("All workers shut down successfully");
        Ok(())
    }
}

pub(crate) fn worker_id(pool: &str, n: usize) -> String {
    format!("{pool}-W{n}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{ProcessOutcome, processor_fn};
    use crate::record::{JobId, JobStatus};
    use crate::storage::MemoryStore;
    use crate::storage::flaky::FlakyStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(workers: usize) -> PoolSettings {
        PoolSettings {
            workers,
            name: "test".into(),
            lock_timeout: Duration::from_secs(300),
            error_pause: Duration::from_millis(10),
        }
    }

    fn counting<S: TaskStore>(store: &Arc<S>, counter: &Arc<AtomicUsize>) -> Arc<dyn Processor> {
        let store = Arc::clone(store);
        let counter = Arc::clone(counter);
        Arc::new(processor_fn(move |id: JobId| {
            let store = Arc::clone(&store);
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                match store.mark_completed(&id, Utc::now()).await {
                    Ok(()) => ProcessOutcome::Succeeded,
                    Err(e) => ProcessOutcome::failed(e.to_string()),
                }
            }
        }))
    }

    #[test]
    fn worker_ids_are_one_based() {
        assert_eq!(worker_id("ingest", 1), "ingest-W1");
        assert_eq!(worker_id("ingest", 12), "ingest-W12");
    }

    #[tokio::test]
    async fn processes_multiple_jobs() {
        let store = Arc::new(MemoryStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = JobQueue::new();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create(5, Utc::now()).await.unwrap().id);
        }

        let pool = WorkerPool::spawn(
            Arc::clone(&store),
            queue.clone(),
            counting(&store, &counter),
            &settings(2),
        );
        assert_eq!(pool.size(), 2);

        for id in &ids {
            assert!(queue.submit(id.clone()));
        }
        queue.wait_idle().await;
        pool.shutdown().await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        for id in &ids {
            let record = store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn unknown_ids_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = JobQueue::new();

        let pool = WorkerPool::spawn(
            Arc::clone(&store),
            queue.clone(),
            counting(&store, &counter),
            &settings(1),
        );

        queue.submit(JobId::from("ghost"));
        let real = store.create(5, Utc::now()).await.unwrap();
        queue.submit(real.id.clone());

        queue.wait_idle().await;
        pool.shutdown().await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let record = store.get(&real.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn store_error_pauses_and_continues() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = JobQueue::new();
        let first = store.create(5, Utc::now()).await.unwrap().id;
        let second = store.create(5, Utc::now()).await.unwrap().id;
        store.try_acquire.fail_times(1);

        let pool = WorkerPool::spawn(
            Arc::clone(&store),
            queue.clone(),
            counting(&store, &counter),
            &settings(1),
        );

        assert!(queue.submit(first.clone()));
        assert!(queue.submit(second.clone()));
        queue.wait_idle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let record = store.get(&first).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        let record = store.get(&second).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);

        // The id left the queue, so it can be fed again.
        assert!(queue.submit(first.clone()));
        queue.wait_idle().await;
        pool.shutdown().await.unwrap();

        assert_eq!(store.try_acquire.calls(), 3);
        let record = store.get(&first).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_is_graceful() {
        let store = Arc::new(MemoryStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::spawn(
            Arc::clone(&store),
            JobQueue::new(),
            counting(&store, &counter),
            &settings(3),
        );

        assert!(pool.shutdown().await.is_ok());
    }
}
