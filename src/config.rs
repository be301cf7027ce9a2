//! Scheduler configuration and environment overrides.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::time::Duration;

use crate::error::SchedulerError;
use crate::pool::PoolSettings;
use crate::record::DEFAULT_MAX_RETRIES;

const MINUTE: u64 = 60;

/// Configuration for a [`Scheduler`](crate::Scheduler).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use ingest_queue::SchedulerConfig;
///
/// let config = SchedulerConfig {
///     workers: 8,
///     lock_timeout: Duration::from_secs(120),
///     ..SchedulerConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,

    /// Age after which a lease is considered abandoned.
    ///
    /// Workers may take over an expired lease on a `failed` job, and the
    /// reaper force-fails `processing` jobs older than this.
    pub lock_timeout: Duration,

    /// Period of the retry loop, and the backoff written to `next_retry_at`.
    pub retry_interval: Duration,

    /// Period of the reaper loop.
    pub reaper_interval: Duration,

    /// Retry budget for jobs created through the scheduler.
    pub max_retries: u32,

    /// Delay before the next retry cycle after a failed one.
    pub retry_error_backoff: Duration,

    /// Pause after a worker-level store error.
    pub worker_error_pause: Duration,

    /// Prefix for worker lock-holder ids.
    pub pool_name: String,
}

impl Default for SchedulerConfig {
    /// - `workers`: 3
    /// - `lock_timeout`: 5 minutes
    /// - `retry_interval`: 10 minutes
    /// - `reaper_interval`: 5 minutes
    /// - `max_retries`: 5
    /// - `retry_error_backoff`: 60 seconds
    /// - `worker_error_pause`: 1 second
    /// - `pool_name`: `"ingest"`
    fn default() -> Self {
        Self {
            workers: 3,
            lock_timeout: Duration::from_secs(5 * MINUTE),
            retry_interval: Duration::from_secs(10 * MINUTE),
            reaper_interval: Duration::from_secs(5 * MINUTE),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_error_backoff: Duration::from_secs(60),
            worker_error_pause: Duration::from_secs(1),
            pool_name: "ingest".to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by the process environment, validated.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let env: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        Self::from_env_map(&env)
    }

    /// Defaults overridden by `env`, validated.
    ///
    /// Recognised keys: `NUM_WORKERS`, `LOCK_TIMEOUT_MINUTES`,
    /// `RETRY_INTERVAL_MINUTES`, `REAPER_INTERVAL_MINUTES`, `MAX_RETRIES`,
    /// `RETRY_ERROR_BACKOFF_SECS`, `WORKER_ERROR_PAUSE_MS`, `WORKER_POOL_NAME`.
    pub fn from_env_map(env: &HashMap<String, String, impl BuildHasher>) -> Result<Self, SchedulerError> {
        let mut config = Self::default();
        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(
        &mut self,
        env: &HashMap<String, String, impl BuildHasher>,
    ) -> Result<(), SchedulerError> {
        if let Some(value) = env.get("NUM_WORKERS") {
            self.workers = parse_u64("NUM_WORKERS", value)?
                .try_into()
                .map_err(|_| invalid_env("NUM_WORKERS", value, "out of range"))?;
        }
        if let Some(value) = env.get("LOCK_TIMEOUT_MINUTES") {
            self.lock_timeout = parse_minutes("LOCK_TIMEOUT_MINUTES", value)?;
        }
        if let Some(value) = env.get("RETRY_INTERVAL_MINUTES") {
            self.retry_interval = parse_minutes("RETRY_INTERVAL_MINUTES", value)?;
        }
        if let Some(value) = env.get("REAPER_INTERVAL_MINUTES") {
            self.reaper_interval = parse_minutes("REAPER_INTERVAL_MINUTES", value)?;
        }
        if let Some(value) = env.get("MAX_RETRIES") {
            self.max_retries = value
                .trim()
                .parse::<u32>()
                .map_err(|_| invalid_env("MAX_RETRIES", value, "expected unsigned integer"))?;
        }
        if let Some(value) = env.get("RETRY_ERROR_BACKOFF_SECS") {
            self.retry_error_backoff =
                Duration::from_secs(parse_u64("RETRY_ERROR_BACKOFF_SECS", value)?);
        }
        if let Some(value) = env.get("WORKER_ERROR_PAUSE_MS") {
            self.worker_error_pause =
                Duration::from_millis(parse_u64("WORKER_ERROR_PAUSE_MS", value)?);
        }
        if let Some(value) = env.get("WORKER_POOL_NAME") {
            self.pool_name = value.trim().to_owned();
        }
        Ok(())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.workers == 0 {
            return Err(invalid_config("workers", "must be greater than 0"));
        }
        for (field, value) in [
            ("lock_timeout", self.lock_timeout),
            ("retry_interval", self.retry_interval),
            ("reaper_interval", self.reaper_interval),
            ("retry_error_backoff", self.retry_error_backoff),
            ("worker_error_pause", self.worker_error_pause),
        ] {
            if value.is_zero() {
                return Err(invalid_config(field, "must be greater than 0"));
            }
        }
        if self.pool_name.is_empty() {
            return Err(invalid_config("pool_name", "must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.workers,
            name: self.pool_name.clone(),
            lock_timeout: self.lock_timeout,
            error_pause: self.worker_error_pause,
        }
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, SchedulerError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid_env(key, value, "expected unsigned integer"))
}

fn parse_minutes(key: &str, value: &str) -> Result<Duration, SchedulerError> {
    let minutes = parse_u64(key, value)?;
    minutes
        .checked_mul(MINUTE)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid_env(key, value, "out of range"))
}

fn invalid_env(key: &str, value: &str, reason: &str) -> SchedulerError {
    SchedulerError::InvalidEnv {
        key: key.to_owned(),
        value: value.to_owned(),
        reason: reason.to_owned(),
    }
}

fn invalid_config(field: &'static str, reason: &str) -> SchedulerError {
    SchedulerError::InvalidConfig {
        field,
        reason: reason.to_owned(),
    }
}
