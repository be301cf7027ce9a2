//! The unit of work a worker runs once it holds a job's lock.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::record::JobId;
use crate::storage::TaskStore;

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job finished and its record was marked `completed` by the processor.
    Succeeded,
    /// The attempt failed; the worker records `error` and marks the job `failed`.
    Failed { error: String },
}

impl ProcessOutcome {
    /// Shorthand for [`ProcessOutcome::Failed`].
    pub fn failed(error: impl Into<String>) -> Self {
        ProcessOutcome::Failed {
            error: error.into(),
        }
    }
}

/// Processing unit invoked by workers.
///
/// On success the implementation is expected to leave the record
/// `completed` itself (see [`TaskStore::mark_completed`]). Failures are
/// reported through the outcome rather than by touching the record.
///
/// The trait is object safe so a scheduler can hold an `Arc<dyn Processor>`.
///
/// # Example
///
/// ```rust
/// use ingest_queue::{JobId, ProcessOutcome, Processor};
///
/// struct AlwaysFails;
///
/// #[async_trait::async_trait]
/// impl Processor for AlwaysFails {
///     async fn process(&self, _job_id: &JobId) -> ProcessOutcome {
///         ProcessOutcome::failed("network error")
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job_id: &JobId) -> ProcessOutcome;
}

/// Adapts an async closure into a [`Processor`]. See [`processor_fn`].
pub struct FnProcessor<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Build a [`Processor`] from `Fn(JobId) -> impl Future<Output = ProcessOutcome>`.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F, Fut>
where
    F: Fn(JobId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessOutcome> + Send + 'static,
{
    FnProcessor {
        f,
        _fut: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut> Processor for FnProcessor<F, Fut>
where
    F: Fn(JobId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessOutcome> + Send + 'static,
{
    async fn process(&self, job_id: &JobId) -> ProcessOutcome {
        (self.f)(job_id.clone()).await
    }
}

impl<F, Fut> fmt::Debug for FnProcessor<F, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

/// Runs an external program per job.
///
/// The program is invoked as `program [args...] <job_id>`. Exit status 0
/// marks the job completed; any other exit fails the attempt with the
/// program's trimmed stderr, or its exit status when stderr is empty.
pub struct CommandProcessor<S> {
    program: String,
    args: Vec<String>,
    store: Arc<S>,
}

impl<S: TaskStore> CommandProcessor<S> {
    /// Run `program` for each job, completing records in `store`.
    pub fn new(program: impl Into<String>, store: Arc<S>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            store,
        }
    }

    /// Fixed arguments passed before the job id.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl<S> fmt::Debug for CommandProcessor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<S: TaskStore> Processor for CommandProcessor<S> {
    async fn process(&self, job_id: &JobId) -> ProcessOutcome {
        if let Err(e) = self.store.set_progress(job_id, "running", Utc::now()).await {
            warn!(job_id = %job_id, error = %e, "Failed to record progress");
        }

        debug!(job_id = %job_id, program = %self.program, "Spawning processor command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(job_id.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return ProcessOutcome::failed(format!("failed to spawn {}: {e}", self.program));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return if stderr.is_empty() {
                ProcessOutcome::failed(format!("{} {}", self.program, output.status))
            } else {
                ProcessOutcome::failed(stderr)
            };
        }

        match self.store.mark_completed(job_id, Utc::now()).await {
            Ok(()) => ProcessOutcome::Succeeded,
            Err(e) => ProcessOutcome::failed(format!("could not record completion: {e}")),
        }
    }
}
