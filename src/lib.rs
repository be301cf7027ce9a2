//! Job scheduling and locking for long-running, failure-prone ingestion work.
//!
//! A job is a persistent record in a [`TaskStore`]. Producers push job ids
//! onto a deduplicating in-memory [`JobQueue`]; a [`WorkerPool`] drains it,
//! taking a lease on each record with a single compare-and-set before handing
//! the job to a [`Processor`]. Two periodic loops keep the store healthy:
//!
//! - [`Reaper`] force-fails jobs whose lease outlived the lock timeout
//! - [`RetryScheduler`] requeues failed jobs that still have retry budget
//!
//! Built-in stores:
//!
//! - [`MemoryStore`] - In-process store for tests and single-process use
//! - [`SqliteStore`] - Persistent store via sqlx (feature `sqlite`)
//!
//! # Architecture
//!
//! ```text
//!  submit ──► ┌──────────┐ pop ┌─────────────┐ try_acquire ┌───────────┐
//!             │ JobQueue │────►│ WorkerPool  │────────────►│ TaskStore │
//!             └──────────┘     │  Processor  │◄── release ─│           │
//!                  ▲           └─────────────┘             └───────────┘
//!                  │                                          ▲     ▲
//!                  └──── requeue ── RetryScheduler ───────────┘     │
//!                                         └── Reaper (same gate) ───┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ingest_queue::{JobId, MemoryStore, ProcessOutcome, Scheduler, TaskStore, processor_fn};
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ingest_queue::SchedulerError> {
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let completer = {
//!         let store = Arc::clone(&store);
//!         processor_fn(move |id: JobId| {
//!             let store = Arc::clone(&store);
//!             async move {
//!                 match store.mark_completed(&id, Utc::now()).await {
//!                     Ok(()) => ProcessOutcome::Succeeded,
//!                     Err(e) => ProcessOutcome::failed(e.to_string()),
//!                 }
//!             }
//!         })
//!     };
//!
//!     let handle = Scheduler::builder()
//!         .shared_store(store)
//!         .processor(completer)
//!         .workers(4)
//!         .build()?
//!         .start();
//!
//!     let job = handle.enqueue_new().await?;
//!     assert!(!handle.submit(job.id.clone()));
//!
//!     handle.wait_idle().await;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod pool;
mod processor;
mod queue;
mod reaper;
mod record;
mod retry;
mod scheduler;
mod storage;
pub mod telemetry;
mod worker;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, StoreError};
pub use pool::{PoolSettings, WorkerPool};
pub use processor::{CommandProcessor, FnProcessor, ProcessOutcome, Processor, processor_fn};
pub use queue::{Ack, JobQueue};
pub use reaper::Reaper;
pub use record::{DEFAULT_MAX_RETRIES, JobId, JobRecord, JobStatus, LOCK_TIMEOUT_ERROR, RetryStats};
pub use retry::{RetryCycleReport, RetryScheduler};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerHandle};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use storage::{MemoryStore, TaskStore};
pub use worker::{Attempt, Worker};
