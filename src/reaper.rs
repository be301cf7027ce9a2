//! Stuck-task reaper: revokes leases held past the lock timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, trace, warn};

use crate::error::StoreError;
use crate::storage::{TaskStore, lease_cutoff};

/// Serializes maintenance passes (reaping and retry scans) against each other.
pub(crate) type MaintenanceGate = Arc<Mutex<()>>;

/// Force-fails `processing` jobs whose lease started more than
/// `lock_timeout` ago.
pub struct Reaper<S> {
    store: Arc<S>,
    lock_timeout: Duration,
    gate: MaintenanceGate,
}

impl<S> Clone for Reaper<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lock_timeout: self.lock_timeout,
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<S: TaskStore> Reaper<S> {
    /// Create a reaper with its own maintenance gate.
    pub fn new(store: Arc<S>, lock_timeout: Duration) -> Self {
        Self::with_gate(store, lock_timeout, MaintenanceGate::default())
    }

    pub(crate) fn with_gate(store: Arc<S>, lock_timeout: Duration, gate: MaintenanceGate) -> Self {
        Self {
            store,
            lock_timeout,
            gate,
        }
    }

    pub(crate) fn gate(&self) -> &MaintenanceGate {
        &self.gate
    }

    /// One reap pass. Returns the number of jobs force-failed.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let _gate = self.gate.lock().await;
        self.reap(now).await
    }

    /// Reap without taking the gate. The caller must hold it.
    pub(crate) async fn reap(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = lease_cutoff(now, self.lock_timeout);
        let reaped = self.store.reap_expired(cutoff, now).await?;

        if reaped > 0 {
            warn!(
                op = "reaper.reap_expired",
                reaped,
                cutoff = %cutoff,
                "Reaped jobs stuck in processing"
            );
        } else {
            trace!(op = "reaper.reap_expired", reaped = 0, "No stuck jobs found");
        }
        Ok(reaped)
    }

    /// Reap every `interval` until `shutdown` fires.
    pub(crate) async fn run(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.run_cycle(Utc::now()).await {
                error!(op = "reaper.reap_expired", error = %e, "Reaper cycle failed");
            }
        }
    }
}
