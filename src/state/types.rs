//! State types for tracking provisioned resources.
//!
//! These types represent the observed/recorded state of a stack, used for
//! diffing and idempotent operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StateError;
use crate::model::{Properties, ResourceKind};
use crate::provider::ResourceHandle;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The recorded state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedState {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Provisioned resources by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// What the engine knows about one provisioned resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider handle.
    pub handle: ResourceHandle,
    /// Declared properties, references kept symbolic.
    #[serde(default)]
    pub properties: Properties,
    /// Outputs returned by the provider's `describe`.
    #[serde(default)]
    pub outputs: Properties,
    /// Logical names this resource depended on when last applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Declaration position when last applied.
    #[serde(default)]
    pub position: usize,
    /// Fingerprint of kind and declared properties. Empty while the
    /// provider's outputs have not been read back.
    pub fingerprint: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Stack hash at time of the run.
    pub config_hash: String,
    /// Resources changed by the run.
    pub resources: Vec<String>,
    /// Whether every change was applied.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Reconcile towards the declaration.
    Apply,
    /// Delete everything recorded.
    Destroy,
}

impl ObservedState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            environment: environment.to_string(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks that the state was written by a compatible format version.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` when the major version differs.
    pub fn check_version(&self) -> Result<(), StateError> {
        let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();

        if major(&self.version) == major(STATE_VERSION) {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }

    /// Gets a record by name.
    #[must_use]
    pub fn get_record(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: ResourceRecord) {
        self.resources.insert(record.name.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by name.
    pub fn remove_record(&mut self, name: &str) -> Option<ResourceRecord> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.last_updated = Utc::now();
    }

    /// Returns all recorded names.
    #[must_use]
    pub fn record_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Default for ObservedState {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(name: &str, kind: ResourceKind, handle: ResourceHandle, fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            kind,
            handle,
            properties: Properties::new(),
            outputs: Properties::new(),
            dependencies: Vec::new(),
            position: 0,
            fingerprint: fingerprint.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the record as written now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Clears the fingerprint until outputs are recorded, so the next plan
    /// updates the resource instead of skipping it.
    pub fn mark_pending(&mut self) {
        self.fingerprint.clear();
    }

    /// Returns true if the provider call went through but `describe` did not.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.fingerprint.is_empty()
    }
}

impl HistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(operation: RunOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: RunOperation, config_hash: &str, resources: Vec<String>, error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
