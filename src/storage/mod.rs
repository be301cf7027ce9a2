//! Task store backends.
//!
//! This module provides:
//! - [`TaskStore`] trait - Persistent job records with atomic conditional updates
//! - [`MemoryStore`] - In-process store for tests and single-process use
//! - [`SqliteStore`] - Persistent SQLite store (feature `sqlite`)
//!
//! The store is the only authority on lock state. Every operation that guards
//! the lease must be one atomic store operation, never a read followed by a
//! separate write.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::StoreError;
use crate::record::{JobId, JobRecord, JobStatus, RetryStats};

#[cfg(test)]
pub(crate) mod flaky;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Persistent job store with compare-and-set semantics.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use chrono::Utc;
/// use ingest_queue::{MemoryStore, TaskStore};
///
/// # async fn example() -> Result<(), ingest_queue::StoreError> {
/// let store = MemoryStore::new();
/// let job = store.create(5, Utc::now()).await?;
///
/// let now = Utc::now();
/// let timeout = Duration::from_secs(300);
/// assert!(store.try_acquire(&job.id, "W1", now, timeout).await?);
/// assert!(!store.try_acquire(&job.id, "W2", now, timeout).await?);
/// # Ok(())
/// # }
/// ```
pub trait TaskStore: Send + Sync + 'static {
    /// Create a `pending` record with a store-assigned id.
    fn create(
        &self,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<JobRecord, StoreError>> + Send;

    /// Insert a fully formed record. Fails if the id is taken.
    fn insert(&self, record: JobRecord) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetch one record.
    fn get(&self, id: &JobId) -> impl Future<Output = Result<Option<JobRecord>, StoreError>> + Send;

    /// Records in `status`, oldest first.
    fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JobRecord>, StoreError>> + Send;

    /// Take the lease on `id` for `holder`.
    ///
    /// Succeeds only if the job is `pending` or `failed` and the lock is free
    /// or its lease started more than `lock_timeout` before `now`. On success
    /// the record becomes `processing` in the same atomic operation.
    /// Returns `Ok(false)` when nothing matched (lock contention).
    fn try_acquire(
        &self,
        id: &JobId,
        holder: &str,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Clear the lock fields unconditionally. Idempotent.
    fn release(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Record a progress marker.
    fn set_progress(
        &self,
        id: &JobId,
        marker: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Mark `completed` and reset retry state.
    fn mark_completed(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Mark `failed` with `error`.
    fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Failed records with remaining budget whose `next_retry_at` is due or unset.
    fn retry_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<JobRecord>, StoreError>> + Send;

    /// Record a retry attempt: bump `retry_count`, set `last_retry_at = now`
    /// and `next_retry_at`.
    ///
    /// Applies only while the job is still `failed`, unlocked and under
    /// budget. Returns whether the stamp was applied.
    fn stamp_retry(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Force-fail every `processing` record whose lease started before
    /// `cutoff`, clearing its lock. Returns the number of records reaped.
    fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Aggregate statistics over failed records.
    fn retry_stats(&self) -> impl Future<Output = Result<RetryStats, StoreError>> + Send;
}

/// The instant before which a lease counts as expired.
pub(crate) fn lease_cutoff(now: DateTime<Utc>, lock_timeout: Duration) -> DateTime<Utc> {
    let timeout = TimeDelta::from_std(lock_timeout).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
