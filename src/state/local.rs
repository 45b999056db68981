//! Local file-based state storage backend.
//!
//! This module provides file-based state storage for local development
//! and single-machine use.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StackformError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, ResourceLease, ResourceLocks, generate_holder_id};
use super::store::StateStore;
use super::types::{HistoryEntry, ObservedState, ResourceRecord};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackform";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serialises writes to the state file.
    write_lock: Mutex<()>,
    /// Per-resource leases.
    resources: ResourceLocks,
}

impl LocalStateStore {
    /// Creates a new local state store in `./.stackform`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackformError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            write_lock: Mutex::new(()),
            resources: ResourceLocks::new(),
        }
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            write_lock: Mutex::new(()),
            resources: ResourceLocks::new(),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Reads and parses the state file.
    async fn read_state(&self) -> Result<Option<ObservedState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read state file: {e}")))?;

        let state: ObservedState = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        state.check_version()?;
        Ok(Some(state))
    }

    /// Writes the state file through a temporary file and a rename.
    async fn write_state(&self, state: &ObservedState) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::write(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::write(format!("Failed to sync state file: {e}")))?;

        // Atomic rename
        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    /// Applies `change` to the stored state under the write lock.
    async fn modify(&self, change: impl FnOnce(&mut ObservedState) + Send) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut state = self.read_state().await?.ok_or_else(|| StateError::NotFound {
            path: self.state_path.clone(),
        })?;
        change(&mut state);

        self.write_state(&state).await
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Writes the lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let lock_failed = |message: String| StackformError::State(StateError::LockFailed { message });

        let mut file = fs::File::create(&self.lock_path)
            .await
            .map_err(|e| lock_failed(format!("Failed to create lock file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed(format!("Failed to write lock file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| lock_failed(format!("Failed to sync lock file: {e}")))?;

        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StackformError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<ObservedState>> {
        debug!("Loading state from: {}", self.state_path.display());
        self.read_state().await
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        info!("Saving state to: {}", self.state_path.display());
        self.write_state(state).await?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::write(format!("Failed to delete state file: {e}")))?;
        }

        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn initialize(&self, state: &ObservedState) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        if self.state_path.exists() {
            return Ok(false);
        }

        info!("Initialising state at: {}", self.state_path.display());
        self.write_state(state).await?;
        Ok(true)
    }

    async fn put_record(&self, record: ResourceRecord) -> Result<()> {
        debug!("Recording resource: {}", record.name);
        self.modify(move |state| state.set_record(record)).await
    }

    async fn remove_record(&self, name: &str) -> Result<()> {
        debug!("Removing resource record: {name}");
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
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StackformError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use crate::provider::ResourceHandle;
    use crate::state::RunOperation;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord::new(name, ResourceKind::Bucket, ResourceHandle::new(format!("h-{name}")), "fp")
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let state = ObservedState::new("test-stack", "dev");
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.stack, "test-stack");
        assert_eq!(loaded.environment, "dev");
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let (store, temp) = create_test_store();
        std::fs::write(temp.path().join(STATE_FILE), "{ not json").unwrap();

        assert!(matches!(
            store.load().await,
            Err(StackformError::State(StateError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_exists() {
        let (store, _temp) = create_test_store();

        assert!(!store.exists().await.expect("exists check failed"));

        let state = ObservedState::new("test-stack", "dev");
        store.save(&state).await.expect("Failed to save state");

        assert!(store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_record_operations() {
        let (store, _temp) = create_test_store();
        store.save(&ObservedState::new("test-stack", "dev")).await.unwrap();

        store.put_record(record("assets")).await.unwrap();
        let loaded = store.get_record("assets").await.unwrap().unwrap();
        assert_eq!(loaded.handle.as_str(), "h-assets");

        store
            .append_history(HistoryEntry::new(RunOperation::Apply, "hash", vec![String::from("assets")]))
            .await
            .unwrap();

        store.remove_record("assets").await.unwrap();
        let state = store.load().await.unwrap().unwrap();
        assert!(state.is_empty());
        assert_eq!(state.history.len(), 1);
    }

    #[tokio::test]
    async fn test_put_record_requires_state() {
        let (store, _temp) = create_test_store();

        assert!(matches!(
            store.put_record(record("assets")).await,
            Err(StackformError::State(StateError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_record_writes_are_not_lost() {
        let (store, _temp) = create_test_store();
        store.save(&ObservedState::new("test-stack", "dev")).await.unwrap();
        let store = Arc::new(store);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.put_record(record(&format!("r{i}"))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.resources.len(), 16);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(StackformError::State(StateError::LockedByOther { .. }))
        ));
    }
}
