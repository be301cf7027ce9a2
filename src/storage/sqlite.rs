//! SQLite task store via sqlx.
//!
//! Timestamps are stored as unix milliseconds so lease comparisons stay
//! numeric. Every lock-guarding operation is a single `UPDATE ... WHERE`
//! statement whose success is judged by `rows_affected`.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;

use super::{TaskStore, lease_cutoff};
use crate::error::StoreError;
use crate::record::{JobId, JobRecord, JobStatus, LOCK_TIMEOUT_ERROR, RetryStats};

const SCHEMA: [&str; 3] = [
    r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    last_retry_at INTEGER,
    next_retry_at INTEGER,
    processing_worker_id TEXT,
    processing_started_at INTEGER,
    lock_acquired_at INTEGER,
    processing_progress TEXT,
    processing_error TEXT,
    processed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_started ON jobs (status, processing_started_at)",
];

const SELECT_COLUMNS: &str = r#"
SELECT
    id,
    status,
    retry_count,
    max_retries,
    last_retry_at,
    next_retry_at,
    processing_worker_id,
    processing_started_at,
    lock_acquired_at,
    processing_progress,
    processing_error,
    processed_at,
    created_at,
    updated_at
FROM jobs
"#;

/// Persistent job store backed by SQLite.
///
/// Cloning shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(url, "sqlite task store ready");
        Ok(store)
    }

    /// A private in-memory database.
    ///
    /// The pool is pinned to one connection that never expires, since every
    /// in-memory connection would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the jobs table and indexes if absent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn expect_row(id: &JobId, rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound(id.clone()));
    }
    Ok(())
}

impl TaskStore for SqliteStore {
    async fn create(&self, max_retries: u32, now: DateTime<Utc>) -> Result<JobRecord, StoreError> {
        let record = JobRecord::pending(JobId::generate(), max_retries, now);
        self.insert(record.clone()).await?;
        Ok(record)
    }

    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO jobs (
    id,
    status,
    retry_count,
    max_retries,
    last_retry_at,
    next_retry_at,
    processing_worker_id,
    processing_started_at,
    lock_acquired_at,
    processing_progress,
    processing_error,
    processed_at,
    created_at,
    updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.status.as_str())
        .bind(i64::from(record.retry_count))
        .bind(i64::from(record.max_retries))
        .bind(record.last_retry_at.map(to_millis))
        .bind(record.next_retry_at.map(to_millis))
        .bind(record.processing_worker_id.as_deref())
        .bind(record.processing_started_at.map(to_millis))
        .bind(record.lock_acquired_at.map(to_millis))
        .bind(record.processing_progress.as_deref())
        .bind(record.processing_error.as_deref())
        .bind(record.processed_at.map(to_millis))
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = ? ORDER BY created_at, id LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn try_acquire(
        &self,
        id: &JobId,
        holder: &str,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let now_ms = to_millis(now);
        let cutoff_ms = to_millis(lease_cutoff(now, lock_timeout));

        let rows_affected = sqlx::query(
            r#"
UPDATE jobs
SET
    status = 'processing',
    processing_worker_id = ?,
    processing_started_at = ?,
    lock_acquired_at = ?,
    updated_at = ?
WHERE id = ?
  AND status IN ('pending', 'failed')
  AND (processing_worker_id IS NULL OR processing_started_at < ?)
            "#,
        )
        .bind(holder)
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(id.as_str())
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn release(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let rows_affected = sqlx::query(
            r#"
UPDATE jobs
SET
    processing_worker_id = NULL,
    processing_started_at = NULL,
    lock_acquired_at = NULL,
    updated_at = ?
WHERE id = ?
            "#,
        )
        .bind(to_millis(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        expect_row(id, rows_affected)
    }

    async fn set_progress(
        &self,
        id: &JobId,
        marker: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET processing_progress = ?, updated_at = ? WHERE id = ?",
        )
        .bind(marker)
        .bind(to_millis(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        expect_row(id, rows_affected)
    }

    async fn mark_completed(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let now_ms = to_millis(now);
        let rows_affected = sqlx::query(
            r#"
UPDATE jobs
SET
    status = 'completed',
    processing_error = NULL,
    processed_at = ?,
    retry_count = 0,
    last_retry_at = NULL,
    next_retry_at = NULL,
    updated_at = ?
WHERE id = ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        expect_row(id, rows_affected)
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_ms = to_millis(now);
        let rows_affected = sqlx::query(
            r#"
UPDATE jobs
SET
    status = 'failed',
    processing_error = ?,
    processed_at = ?,
    updated_at = ?
WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(now_ms)
        .bind(now_ms)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        expect_row(id, rows_affected)
    }

    async fn retry_candidates(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"{SELECT_COLUMNS}
WHERE status = 'failed'
  AND retry_count < max_retries
  AND (next_retry_at IS NULL OR next_retry_at <= ?)
ORDER BY created_at, id"#
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn stamp_retry(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now_ms = to_millis(now);
        let rows_affected = sqlx::query(
            r#"
UPDATE jobs
SET
    retry_count = retry_count + 1,
    last_retry_at = ?,
    next_retry_at = ?,
    updated_at = ?
WHERE id = ?
  AND status = 'failed'
  AND processing_worker_id IS NULL
  AND retry_count < max_retries
            "#,
        )
        .bind(now_ms)
        .bind(to_millis(next_retry_at))
        .bind(now_ms)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let rows_affected = sqlx::query(
            r#"
UPDATE jobs
SET
    status = 'failed',
    processing_error = ?,
    processing_worker_id = NULL,
    processing_started_at = NULL,
    lock_acquired_at = NULL,
    updated_at = ?
WHERE status = 'processing'
  AND processing_started_at < ?
            "#,
        )
        .bind(LOCK_TIMEOUT_ERROR)
        .bind(to_millis(now))
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected)
    }

    async fn retry_stats(&self) -> Result<RetryStats, StoreError> {
        let row = sqlx::query(
            r#"
SELECT
    COUNT(*) AS total_failed,
    AVG(retry_count) AS avg_retry_count,
    MAX(retry_count) AS max_retry_count,
    SUM(CASE WHEN retry_count < max_retries THEN 1 ELSE 0 END) AS eligible_for_retry
FROM jobs
WHERE status = 'failed'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_failed: i64 = row.try_get("total_failed")?;
        let avg_retry_count: Option<f64> = row.try_get("avg_retry_count")?;
        let max_retry_count: Option<i64> = row.try_get("max_retry_count")?;
        let eligible_for_retry: Option<i64> = row.try_get("eligible_for_retry")?;

        Ok(RetryStats {
            total_failed: u64::try_from(total_failed).unwrap_or(0),
            avg_retry_count: avg_retry_count.unwrap_or(0.0),
            max_retry_count: max_retry_count
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0),
            eligible_for_retry: eligible_for_retry
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0),
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn record_from_row(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let invalid = |reason: String| StoreError::InvalidRecord {
        id: id.clone(),
        reason,
    };

    let status: String = row.try_get("status")?;
    let status = status.parse::<JobStatus>().map_err(&invalid)?;

    let count = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value).map_err(|_| invalid(format!("{column} out of range: {value}")))
    };
    let timestamp = |column: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
        let value: Option<i64> = row.try_get(column)?;
        value
            .map(|ms| {
                DateTime::from_timestamp_millis(ms)
                    .ok_or_else(|| invalid(format!("{column} out of range: {ms}")))
            })
            .transpose()
    };
    let required = |column: &str| -> Result<DateTime<Utc>, StoreError> {
        timestamp(column)?.ok_or_else(|| invalid(format!("{column} is null")))
    };

    let record = JobRecord {
        status,
        retry_count: count("retry_count")?,
        max_retries: count("max_retries")?,
        last_retry_at: timestamp("last_retry_at")?,
        next_retry_at: timestamp("next_retry_at")?,
        processing_worker_id: row.try_get("processing_worker_id")?,
        processing_started_at: timestamp("processing_started_at")?,
        lock_acquired_at: timestamp("lock_acquired_at")?,
        processing_progress: row.try_get("processing_progress")?,
        processing_error: row.try_get("processing_error")?,
        processed_at: timestamp("processed_at")?,
        created_at: required("created_at")?,
        updated_at: required("updated_at")?,
        id: JobId::from(id.clone()),
    };

    if record.status == JobStatus::Processing && record.processing_worker_id.is_none() {
        return Err(invalid("processing without a lock holder".to_owned()));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TIMEOUT: Duration = Duration::from_secs(5 * 60);

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap()
    }

    async fn seeded(id: &str) -> (SqliteStore, JobId) {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = JobId::from(id);
        store
            .insert(JobRecord::pending(id.clone(), 5, at(0)))
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let (store, id) = seeded("v1").await;
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record, JobRecord::pending(id, 5, at(0)));
    }

    #[tokio::test]
    async fn insert_duplicate_is_already_exists() {
        let (store, id) = seeded("v1").await;
        let err = store
            .insert(JobRecord::pending(id, 5, at(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let (store, id) = seeded("v1").await;

        let (a, b) = tokio::join!(
            store.try_acquire(&id, "W1", at(1), TIMEOUT),
            store.try_acquire(&id, "W2", at(1), TIMEOUT),
        );
        let winners = [a.unwrap(), b.unwrap()].iter().filter(|won| **won).count();
        assert_eq!(winners, 1);

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.processing_started_at, Some(at(1)));
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
    }

    #[tokio::test]
    async fn update_of_missing_job_is_not_found() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store
            .mark_failed(&JobId::from("ghost"), "boom", at(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn retry_flow_updates_counters() {
        let (store, id) = seeded("v1").await;
        store.try_acquire(&id, "W1", at(1), TIMEOUT).await.unwrap();
        store.mark_failed(&id, "network error", at(2)).await.unwrap();
        store.release(&id, at(2)).await.unwrap();

        let due = store.retry_candidates(at(3)).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(store.stamp_retry(&id, at(3), at(13)).await.unwrap());
        assert!(store.retry_candidates(at(4)).await.unwrap().is_empty());
        assert_eq!(store.retry_candidates(at(13)).await.unwrap().len(), 1);

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_retry_at, Some(at(3)));
        assert_eq!(record.next_retry_at, Some(at(13)));
        assert_eq!(record.processing_error.as_deref(), Some("network error"));
    }

    #[tokio::test]
    async fn reap_and_stats() {
        let (store, id) = seeded("v1").await;
        store.try_acquire(&id, "W1", at(0), TIMEOUT).await.unwrap();

        let reaped = store
            .reap_expired(lease_cutoff(at(10), TIMEOUT), at(10))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.processing_error.as_deref(), Some(LOCK_TIMEOUT_ERROR));
        assert!(record.processing_started_at.is_none());

        let stats = store.retry_stats().await.unwrap();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.eligible_for_retry, 1);
        assert_eq!(stats.max_retry_count, 0);
    }

    #[tokio::test]
    async fn stats_empty_table() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.retry_stats().await.unwrap(), RetryStats::default());
    }

    #[tokio::test]
    async fn invalid_status_is_rejected_at_boundary() {
        let (store, id) = seeded("v1").await;
        sqlx::query("UPDATE jobs SET status = 'exploded' WHERE id = ?")
            .bind(id.as_str())
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.get(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
    }

    #[tokio::test]
    async fn list_by_status_orders_oldest_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        for (name, minute) in [("b", 2), ("a", 1), ("c", 3)] {
            store
                .insert(JobRecord::pending(JobId::from(name), 5, at(minute)))
                .await
                .unwrap();
        }

        let ids: Vec<_> = store
            .list_by_status(JobStatus::Pending, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![JobId::from("a"), JobId::from("b")]);
    }
}
