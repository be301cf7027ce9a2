//! Test-only store wrapper that fails chosen operations on demand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::TaskStore;
use crate::error::StoreError;
use crate::record::{JobId, JobRecord, JobStatus, RetryStats};

/// Failure switch for one store operation.
#[derive(Debug, Default)]
pub(crate) struct Fault {
    remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl Fault {
    /// Fail the next `n` calls.
    pub(crate) fn fail_times(&self, n: usize) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every call from now on.
    pub(crate) fn fail_always(&self) {
        self.remaining.store(usize::MAX, Ordering::SeqCst);
    }

    /// Calls seen so far, failed or not.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str, id: &str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if armed {
            return Err(StoreError::InvalidRecord {
                id: id.to_owned(),
                reason: format!("injected {op} failure"),
            });
        }
        Ok(())
    }
}

/// Delegates to `inner` unless the matching [`Fault`] is armed.
#[derive(Debug)]
pub(crate) struct FlakyStore<S> {
    inner: S,
    pub(crate) try_acquire: Fault,
    pub(crate) mark_failed: Fault,
    pub(crate) retry_candidates: Fault,
    pub(crate) reap_expired: Fault,
}

impl<S: TaskStore> FlakyStore<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            try_acquire: Fault::default(),
            mark_failed: Fault::default(),
            retry_candidates: Fault::default(),
            reap_expired: Fault::default(),
        }
    }
}

impl<S: TaskStore> TaskStore for FlakyStore<S> {
    async fn create(&self, max_retries: u32, now: DateTime<Utc>) -> Result<JobRecord, StoreError> {
        self.inner.create(max_retries, now).await
    }

    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list_by_status(status, limit).await
    }

    async fn try_acquire(
        &self,
        id: &JobId,
        holder: &str,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<bool, StoreError> {
        self.try_acquire.check("try_acquire", id.as_str())?;
        self.inner.try_acquire(id, holder, now, lock_timeout).await
    }

    async fn release(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.release(id, now).await
    }

    async fn set_progress(
        &self,
        id: &JobId,
        marker: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.set_progress(id, marker, now).await
    }

    async fn mark_completed(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.mark_completed(id, now).await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.mark_failed.check("mark_failed", id.as_str())?;
        self.inner.mark_failed(id, error, now).await
    }

    async fn retry_candidates(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        self.retry_candidates.check("retry_candidates", "*")?;
        self.inner.retry_candidates(now).await
    }

    async fn stamp_retry(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.stamp_retry(id, now, next_retry_at).await
    }

    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.reap_expired.check("reap_expired", "*")?;
        self.inner.reap_expired(cutoff, now).await
    }

    async fn retry_stats(&self) -> Result<RetryStats, StoreError> {
        self.inner.retry_stats().await
    }
}
