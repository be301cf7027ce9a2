//! Deduplicating in-memory job queue.
//!
//! [`JobQueue`] pairs a FIFO channel of job ids with the set of ids that are
//! currently queued or in flight. An id accepted by [`JobQueue::submit`]
//! stays in the set until the [`Ack`] handed out by [`JobQueue::pop`] is
//! dropped, so the same job can never sit in the queue twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};

use crate::record::JobId;

struct Inner {
    pending: Mutex<HashSet<JobId>>,
    tx: mpsc::UnboundedSender<JobId>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
    idle: Notify,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queue of job ids with a dedup set.
///
/// Cloning is cheap and every clone shares the same queue.
///
/// # Example
///
/// ```rust
/// use ingest_queue::{JobId, JobQueue};
///
/// let queue = JobQueue::new();
/// assert!(queue.submit(JobId::from("v2")));
/// assert!(!queue.submit(JobId::from("v2")));
/// assert_eq!(queue.len(), 1);
/// ```
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// An empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashSet::new()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                idle: Notify::new(),
            }),
        }
    }

    /// Enqueue `id` unless it is already queued or in flight.
    ///
    /// Returns `false` without enqueueing when the id is a duplicate.
    pub fn submit(&self, id: JobId) -> bool {
        let mut pending = self.inner.pending();
        if pending.contains(&id) {
            trace!(job_id = %id, "Duplicate submission ignored");
            return false;
        }

        pending.insert(id.clone());
        // The receiver lives in `inner`, so the channel cannot be closed here.
        if let Err(mpsc::error::SendError(id)) = self.inner.tx.send(id) {
            pending.remove(&id);
            return false;
        }
        debug!(len = pending.len(), "Job queued");
        true
    }

    /// Whether `id` is queued or in flight.
    #[must_use]
    pub fn contains(&self, id: &JobId) -> bool {
        self.inner.pending().contains(id)
    }

    /// Number of accepted submissions not yet acknowledged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.pending().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.pending().is_empty()
    }

    /// Wait for the next job id.
    ///
    /// The id stays in the dedup set until the returned [`Ack`] is dropped.
    /// Cancel safe: a cancelled pop does not lose an id.
    pub async fn pop(&self) -> Option<Ack> {
        let id = self.inner.rx.lock().await.recv().await?;
        Some(Ack {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Resolve once every accepted submission has been acknowledged.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("len", &self.len()).finish()
    }
}

/// Acknowledgement for a popped job.
///
/// Dropping it removes the id from the dedup set, whatever the outcome of
/// the attempt.
#[must_use = "dropping the ack immediately releases the job id for resubmission"]
pub struct Ack {
    id: JobId,
    inner: Arc<Inner>,
}

impl Ack {
    pub fn job_id(&self) -> &JobId {
        &self.id
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        let now_empty = {
            let mut pending = self.inner.pending();
            pending.remove(&self.id);
            pending.is_empty()
        };
        trace!(job_id = %self.id, "Job acknowledged");
        if now_empty {
            self.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack").field("id", &self.id).finish()
    }
}
