//! Persisted job record and its lifecycle status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry budget for newly created jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Error message written by the reaper when it revokes an expired lease.
pub const LOCK_TIMEOUT_ERROR: &str = "lock timeout";

/// Unique job identifier, assigned by the store on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The id as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Job lifecycle status. The store record is the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for a worker
    Pending,
    /// Locked by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Last attempt failed; may be retried while budget remains
    Failed,
}

impl JobStatus {
    /// Lowercase name used in storage and output.
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether a worker may take the lock from this status.
    pub const fn is_acquirable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// One persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Lock holder identity.
    pub processing_worker_id: Option<String>,
    /// Lease start, used for staleness detection.
    pub processing_started_at: Option<DateTime<Utc>>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    /// Last progress marker reported by the processor. Informational only.
    pub processing_progress: Option<String>,
    pub processing_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh `pending` record with an empty retry history.
    pub fn pending(id: JobId, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            last_retry_at: None,
            next_retry_at: None,
            processing_worker_id: None,
            processing_started_at: None,
            lock_acquired_at: None,
            processing_progress: None,
            processing_error: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True while some worker holds the lease, expired or not.
    pub fn is_locked(&self) -> bool {
        self.processing_worker_id.is_some()
    }

    /// Whether the lock is free, or held by a lease that started before `cutoff`.
    pub fn lock_available(&self, cutoff: DateTime<Utc>) -> bool {
        self.processing_worker_id.is_none()
            || self
                .processing_started_at
                .is_some_and(|started| started < cutoff)
    }

    /// Whether the retry budget still allows another attempt.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether the retry scheduler should consider this record at `now`.
    pub fn is_retry_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Failed
            && self.has_retry_budget()
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether this lease has been held since before `cutoff`.
    pub fn is_stuck(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self
                .processing_started_at
                .is_some_and(|started| started < cutoff)
    }

    pub(crate) fn clear_lock(&mut self) {
        self.processing_worker_id = None;
        self.processing_started_at = None;
        self.lock_acquired_at = None;
    }
}

/// Aggregate view over failed jobs, for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_failed: u64,
    pub avg_retry_count: f64,
    pub max_retry_count: u32,
    pub eligible_for_retry: u64,
}

impl RetryStats {
    /// Fold the failed records out of `records`.
    pub fn collect<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut stats = RetryStats::default();
        let mut retry_sum = 0u64;

        for record in records {
            if record.status != JobStatus::Failed {
                continue;
            }
            stats.total_failed += 1;
            retry_sum += u64::from(record.retry_count);
            stats.max_retry_count = stats.max_retry_count.max(record.retry_count);
            if record.has_retry_budget() {
                stats.eligible_for_retry += 1;
            }
        }

        if stats.total_failed > 0 {
            stats.avg_retry_count = retry_sum as f64 / stats.total_failed as f64;
        }
        stats
    }
}
