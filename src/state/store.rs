//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::Result;
use super::lock::{LockInfo, ResourceLease};
use super::types::{HistoryEntry, ObservedState, ResourceRecord};

/// Trait for state storage backends.
///
/// Record-level writes are read-modify-write cycles serialised by the
/// backend, so concurrent writers never interleave.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the observed state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<ObservedState>>;

    /// Saves the whole observed state.
    async fn save(&self, state: &ObservedState) -> Result<()>;

    /// Deletes the observed state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Saves `state` unless a state already exists.
    ///
    /// Returns true if `state` was written.
    async fn initialize(&self, state: &ObservedState) -> Result<bool>;

    /// Reads one record.
    async fn get_record(&self, name: &str) -> Result<Option<ResourceRecord>> {
        Ok(self
            .load()
            .await?
            .and_then(|mut state| state.resources.remove(name)))
    }

    /// Writes one record. The state must already exist.
    async fn put_record(&self, record: ResourceRecord) -> Result<()>;

    /// Removes one record. The state must already exist.
    async fn remove_record(&self, name: &str) -> Result<()>;

    /// Appends a run to the history.
    async fn append_history(&self, entry: HistoryEntry) -> Result<()>;

    /// Takes the advisory lease for a resource key.
    async fn lock_resource(&self, key: &str) -> ResourceLease;

    /// Acquires the stack lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the stack lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the stack is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<ObservedState>> {
        (**self).load().await
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn initialize(&self, state: &ObservedState) -> Result<bool> {
        (**self).initialize(state).await
    }

    async fn get_record(&self, name: &str) -> Result<Option<ResourceRecord>> {
        (**self).get_record(name).await
    }

    async fn put_record(&self, record: ResourceRecord) -> Result<()> {
        (**self).put_record(record).await
    }

    async fn remove_record(&self, name: &str) -> Result<()> {
        (**self).remove_record(name).await
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        (**self).append_history(entry).await
    }

    async fn lock_resource(&self, key: &str) -> ResourceLease {
        (**self).lock_resource(key).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
