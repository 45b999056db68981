//! State locking for concurrent access protection.
//!
//! Two levels of locking exist. The stack lock is a lock record with an
//! expiry, persisted by the backend, that keeps two processes from running
//! against the same stack. Resource leases are in-process async mutexes
//! keyed by logical name; they serialise concurrent applies that touch the
//! same resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Information about a stack lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

type LeaseTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Keyed async mutexes, one per logical resource name.
///
/// An entry lives only while some lease holds or waits on it.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    locks: Arc<LeaseTable>,
}

/// Exclusive access to one resource key until dropped.
#[derive(Debug)]
pub struct ResourceLease {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LeaseTable>,
}

impl ResourceLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free, then holds it until the lease is dropped.
    pub async fn lock(&self, key: &str) -> ResourceLease {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        trace!("Waiting for resource lease: {key}");
        let guard = mutex.lock_owned().await;

        ResourceLease {
            key: key.to_string(),
            guard: Some(guard),
            table: Arc::clone(&self.locks),
        }
    }

    /// Number of keys currently leased or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no key is leased or waited on.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceLease {
    /// The leased key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            trace!("Pruning resource lease: {}", self.key);
            locks.remove(&self.key);
        }
    }
}
