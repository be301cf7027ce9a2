//! Error types for the scheduler crate.

use thiserror::Error;

use crate::record::JobId;

/// Errors raised by [`TaskStore`](crate::TaskStore) backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists with the given id.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A record with the given id already exists.
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// A persisted record failed validation at the store boundary.
    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    /// Underlying SQLite driver error.
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Errors that can occur when configuring or running the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A configuration value is out of range.
    #[error("Invalid configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// An environment variable could not be parsed.
    #[error("Invalid environment variable {key}={value:?}: {reason}")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },

    /// The builder was finished without a task store.
    #[error("Invalid configuration: a task store must be configured")]
    MissingStore,

    /// The builder was finished without a processing unit.
    #[error("Invalid configuration: a processor must be configured")]
    MissingProcessor,

    /// A worker or periodic loop panicked.
    #[error("Worker panicked: {reason}")]
    WorkerPanicked { reason: String },

    /// A store call made on behalf of a producer failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
