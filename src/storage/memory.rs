//! In-memory task store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{TaskStore, lease_cutoff};
use crate::error::StoreError;
use crate::record::{JobId, JobRecord, JobStatus, LOCK_TIMEOUT_ERROR, RetryStats};

/// In-memory job store.
///
/// Every operation runs under a single mutex, which makes each conditional
/// update atomic with respect to every other store call.
///
/// # Cloning
///
/// Cloning creates a new handle to the **same** underlying records, so a
/// processor can keep its own handle for marking jobs completed.
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<JobId, JobRecord>>>,
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of records held.
    #[must_use = "this returns the count, it doesn't modify the store"]
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether the store holds no records.
    #[must_use = "this returns a boolean, it doesn't modify the store"]
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    async fn update<F>(&self, id: &JobId, now: DateTime<Utc>, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut JobRecord) + Send,
    {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        apply(record);
        record.updated_at = now;
        Ok(())
    }
}

impl TaskStore for MemoryStore {
    async fn create(&self, max_retries: u32, now: DateTime<Utc>) -> Result<JobRecord, StoreError> {
        let record = JobRecord::pending(JobId::generate(), max_retries, now);
        self.records
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();

        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn try_acquire(
        &self,
        id: &JobId,
        holder: &str,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let cutoff = lease_cutoff(now, lock_timeout);
        let mut records = self.records.lock().await;

        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };
        if !record.status.is_acquirable() || !record.lock_available(cutoff) {
            return Ok(false);
        }

        record.status = JobStatus::Processing;
        record.processing_worker_id = Some(holder.to_owned());
        record.processing_started_at = Some(now);
        record.lock_acquired_at = Some(now);
        record.updated_at = now;
        Ok(true)
    }

    async fn release(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, now, JobRecord::clear_lock).await
    }

    async fn set_progress(
        &self,
        id: &JobId,
        marker: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let marker = marker.to_owned();
        self.update(id, now, move |r| r.processing_progress = Some(marker))
            .await
    }

    async fn mark_completed(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, now, |r| {
            r.status = JobStatus::Completed;
            r.processing_error = None;
            r.processed_at = Some(now);
            r.retry_count = 0;
            r.last_retry_at = None;
            r.next_retry_at = None;
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let error = error.to_owned();
        self.update(id, now, move |r| {
            r.status = JobStatus::Failed;
            r.processing_error = Some(error);
            r.processed_at = Some(now);
        })
        .await
    }

    async fn retry_candidates(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut due: Vec<_> = records
            .values()
            .filter(|r| r.is_retry_eligible(now))
            .cloned()
            .collect();

        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn stamp_retry(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };
        if record.status != JobStatus::Failed || record.is_locked() || !record.has_retry_budget() {
            return Ok(false);
        }

        record.retry_count += 1;
        record.last_retry_at = Some(now);
        record.next_retry_at = Some(next_retry_at);
        record.updated_at = now;
        Ok(true)
    }

    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let mut reaped = 0;

        for record in records.values_mut().filter(|r| r.is_stuck(cutoff)) {
            record.status = JobStatus::Failed;
            record.processing_error = Some(LOCK_TIMEOUT_ERROR.to_owned());
            record.clear_lock();
            record.updated_at = now;
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn retry_stats(&self) -> Result<RetryStats, StoreError> {
        let records = self.records.lock().await;
        Ok(RetryStats::collect(records.values()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TIMEOUT: Duration = Duration::from_secs(5 * 60);

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap()
    }

    async fn seeded(id: &str) -> (MemoryStore, JobId) {
        let store = MemoryStore::new();
        let id = JobId::from(id);
        store
            .insert(JobRecord::pending(id.clone(), 5, at(0)))
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn store_new_is_empty() {
        let store = MemoryStore::new();
        assert!(store.is_empty().await);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn create_assigns_pending_record() {
        let store = MemoryStore::new();
        let record = store.create(3, at(0)).await.unwrap();

        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.max_retries, 3);
        assert_eq!(store.get(&record.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let (store, id) = seeded("v1").await;
        let err = store
            .insert(JobRecord::pending(id, 5, at(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn acquire_sets_lock_fields() {
        let (store, id) = seeded("v1").await;

        assert!(store.try_acquire(&id, "W1", at(1), TIMEOUT).await.unwrap());

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.processing_worker_id.as_deref(), Some("W1"));
        assert_eq!(record.processing_started_at, Some(at(1)));
        assert_eq!(record.lock_acquired_at, Some(at(1)));
    }

    #[tokio::test]
    async fn acquire_denied_while_processing() {
        let (store, id) = seeded("v1").await;

        assert!(store.try_acquire(&id, "W1", at(1), TIMEOUT).await.unwrap());
        assert!(!store.try_acquire(&id, "W2", at(2), TIMEOUT).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_denied_for_completed_and_unknown() {
        let (store, id) = seeded("v1").await;
        store.mark_completed(&id, at(1)).await.unwrap();

        assert!(!store.try_acquire(&id, "W1", at(2), TIMEOUT).await.unwrap());
        assert!(
            !store
                .try_acquire(&JobId::from("missing"), "W1", at(2), TIMEOUT)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn acquire_takes_over_expired_failed_lease() {
        let (store, id) = seeded("v1").await;
        store.try_acquire(&id, "W1", at(0), TIMEOUT).await.unwrap();
        store.mark_failed(&id, "boom", at(1)).await.unwrap();

        // Lease still held by W1 and fresh
        assert!(!store.try_acquire(&id, "W2", at(4), TIMEOUT).await.unwrap());
        // Lease older than the timeout
        assert!(store.try_acquire(&id, "W2", at(6), TIMEOUT).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquires_have_one_winner() {
        let (store, id) = seeded("v1").await;
        let mut handles = vec![];

        for worker in 0..16 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire(&id, &format!("W{worker}"), at(1), TIMEOUT)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn release_twice_is_noop() {
        let (store, id) = seeded("v1").await;
        store.try_acquire(&id, "W1", at(1), TIMEOUT).await.unwrap();
        store.mark_failed(&id, "network error", at(2)).await.unwrap();

        store.release(&id, at(2)).await.unwrap();
        let first = store.get(&id).await.unwrap().unwrap();
        store.release(&id, at(2)).await.unwrap();
        let second = store.get(&id).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert!(second.processing_worker_id.is_none());
        assert!(second.processing_started_at.is_none());
        assert!(second.lock_acquired_at.is_none());
    }

    #[tokio::test]
    async fn release_unknown_job_is_not_found() {
        let store = MemoryStore::new();
        let err = store.release(&JobId::from("nope"), at(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn mark_completed_resets_retry_state() {
        let (store, id) = seeded("v1").await;
        store.mark_failed(&id, "boom", at(1)).await.unwrap();
        store.stamp_retry(&id, at(2), at(12)).await.unwrap();

        store.mark_completed(&id, at(3)).await.unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.retry_count, 0);
        assert!(record.last_retry_at.is_none());
        assert!(record.next_retry_at.is_none());
        assert!(record.processing_error.is_none());
        assert_eq!(record.processed_at, Some(at(3)));
    }

    #[tokio::test]
    async fn retry_candidates_filter_budget_and_schedule() {
        let store = MemoryStore::new();
        for (name, retry_count, next_retry_at) in [
            ("due", 2, None),
            ("exhausted", 5, None),
            ("scheduled", 1, Some(at(30))),
        ] {
            let mut record = JobRecord::pending(JobId::from(name), 5, at(0));
            record.status = JobStatus::Failed;
            record.retry_count = retry_count;
            record.next_retry_at = next_retry_at;
            store.insert(record).await.unwrap();
        }

        let due: Vec<_> = store
            .retry_candidates(at(10))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(due, vec![JobId::from("due")]);
    }

    #[tokio::test]
    async fn stamp_retry_refuses_locked_or_exhausted() {
        let (store, id) = seeded("v1").await;
        // pending, not failed
        assert!(!store.stamp_retry(&id, at(1), at(11)).await.unwrap());

        store.mark_failed(&id, "boom", at(1)).await.unwrap();
        for _ in 0..5 {
            assert!(store.stamp_retry(&id, at(1), at(11)).await.unwrap());
        }
        assert!(!store.stamp_retry(&id, at(1), at(11)).await.unwrap());

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 5);
    }

    #[tokio::test]
    async fn reap_expired_fails_stuck_leases_only() {
        let store = MemoryStore::new();
        for name in ["stuck", "fresh"] {
            store
                .insert(JobRecord::pending(JobId::from(name), 5, at(0)))
                .await
                .unwrap();
        }
        let stuck = JobId::from("stuck");
        let fresh = JobId::from("fresh");
        store.try_acquire(&stuck, "W1", at(0), TIMEOUT).await.unwrap();
        store.try_acquire(&fresh, "W2", at(8), TIMEOUT).await.unwrap();

        let reaped = store
            .reap_expired(lease_cutoff(at(10), TIMEOUT), at(10))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let record = store.get(&stuck).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.processing_error.as_deref(), Some(LOCK_TIMEOUT_ERROR));
        assert!(record.processing_worker_id.is_none());
        assert!(record.processing_started_at.is_none());
        assert!(record.lock_acquired_at.is_none());

        let record = store.get(&fresh).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let store1 = MemoryStore::new();
        let store2 = store1.clone();

        let record = store1.create(5, at(0)).await.unwrap();
        assert_eq!(store2.len().await, 1);
        assert!(store2.get(&record.id).await.unwrap().is_some());
    }
}
