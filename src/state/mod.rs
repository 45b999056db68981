//! State management module.
//!
//! This module provides persistent storage of the observed state: the
//! records of provisioned resources, run history, the stack lock and
//! per-resource leases.

mod store;
mod local;
mod memory;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use memory::MemoryStateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, ResourceLease, ResourceLocks, generate_holder_id};
pub use types::{HistoryEntry, ObservedState, ResourceRecord, RunOperation, STATE_VERSION};
