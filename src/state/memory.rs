//! In-memory state storage backend.
//!
//! State lives only as long as the store. Used by tests, and by
//! declarations that set `state.backend: memory` for dry experiments.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StackformError, StateError};

use super::lock::{LockInfo, ResourceLease, ResourceLocks, generate_holder_id};
use super::store::StateStore;
use super::types::{HistoryEntry, ObservedState, ResourceRecord};

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<ObservedState>>,
    lock: Mutex<Option<LockInfo>>,
    resources: ResourceLocks,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `state`.
    #[must_use]
    pub fn with_state(state: ObservedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    async fn modify(&self, change: impl FnOnce(&mut ObservedState) + Send) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| StateError::NotFound {
            path: PathBuf::from("memory"),
        })?;
        change(state);
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<ObservedState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.state.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().await.is_some())
    }

    async fn initialize(&self, state: &ObservedState) -> Result<bool> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(false);
        }
        *guard = Some(state.clone());
        Ok(true)
    }

    async fn get_record(&self, name: &str) -> Result<Option<ResourceRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.get_record(name).cloned()))
    }

    async fn put_record(&self, record: ResourceRecord) -> Result<()> {
        self.modify(move |state| state.set_record(record)).await
    }

    async fn remove_record(&self, name: &str) -> Result<()> {
        self.modify(|state| {
            state.remove_record(name);
        })
        .await
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        self.modify(move |state| state.add_history(entry)).await
    }

    async fn lock_resource(&self, key: &str) -> ResourceLease {
        self.resources.lock(key).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;

        if let Some(existing) = guard.as_ref().filter(|l| !l.is_expired()) {
            return Err(StackformError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = LockInfo::new(&holder_id);
        *guard = Some(info.clone());

        debug!("Acquired in-memory state lock: {}", info.lock_id);
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.lock.lock().await.as_ref().is_some_and(|l| !l.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
