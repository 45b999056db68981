//! Change sets and plans.
//!
//! A plan is the ordered list of changes needed to move the observed state
//! towards the declaration. It is computed on every invocation and never
//! persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::model::{PropertyValue, ResourceDescriptor, ResourceKind};
use crate::provider::ResourceHandle;

/// What the engine will do to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Provision a new resource.
    Create,
    /// Change a resource in place.
    Update,
    /// Delete the resource, then provision it again.
    Replace,
    /// Delete a resource that is no longer declared.
    Delete,
    /// Nothing to do.
    #[serde(rename = "no-op")]
    NoOp,
}

impl Operation {
    /// Returns true if the operation calls the provider.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Symbol used when rendering plans.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

/// A single property that differs between the record and the declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Property name.
    pub property: String,
    /// Recorded value.
    pub old: Option<PropertyValue>,
    /// Declared value.
    pub new: Option<PropertyValue>,
    /// Whether changing this property forces a replacement.
    pub immutable: bool,
}

impl fmt::Display for PropertyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<PropertyValue>| v.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
        write!(f, "{}: {} => {}", self.property, show(&self.old), show(&self.new))?;
        if self.immutable {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

/// One entry of a change set.
#[derive(Debug, Clone, Serialize)]
pub struct Change {
    /// Logical name.
    pub resource: String,
    /// Kind after the change (the recorded kind for deletes).
    pub kind: ResourceKind,
    /// Planned operation.
    pub operation: Operation,
    /// Properties that differ.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub property_changes: Vec<PropertyChange>,
    /// Why the operation was chosen.
    pub reason: String,
    /// Declared or recorded position.
    pub position: usize,
    /// Declared dependencies, or the recorded ones for deletes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Dependencies recorded when the resource was last applied.
    #[serde(skip)]
    pub recorded_dependencies: Vec<String>,
    /// Declared descriptor, absent for deletes.
    #[serde(skip)]
    pub descriptor: Option<ResourceDescriptor>,
    /// Fingerprint of the declared descriptor.
    #[serde(skip)]
    pub fingerprint: Option<String>,
    /// Handle recorded when the plan was computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_handle: Option<ResourceHandle>,
    /// Fingerprint recorded when the plan was computed.
    #[serde(skip)]
    pub recorded_fingerprint: Option<String>,
}

impl Change {
    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match self.operation {
            Operation::Create => format!("Create {} '{}'", self.kind, self.resource),
            Operation::Update => format!("Update {} '{}'", self.kind, self.resource),
            Operation::Replace => format!("Replace {} '{}'", self.kind, self.resource),
            Operation::Delete => format!("Delete {} '{}'", self.kind, self.resource),
            Operation::NoOp => format!("No change for '{}'", self.resource),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.operation, self.resource, self.kind)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Ordered list of changes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Wraps changes that are already in execution order.
    #[must_use]
    pub const fn new(changes: Vec<Change>) -> Self {
        Self { changes }
    }

    /// Iterates over the changes in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    /// Returns the change at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Change> {
        self.changes.get(index)
    }

    /// Returns the change for a resource.
    #[must_use]
    pub fn find(&self, resource: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.resource == resource)
    }

    /// Number of changes, no-ops included.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if the set holds no entries at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Counts the changes with a given operation.
    #[must_use]
    pub fn count(&self, operation: Operation) -> usize {
        self.changes.iter().filter(|c| c.operation == operation).count()
    }

    /// Returns the changes that call the provider.
    #[must_use]
    pub fn actionable(&self) -> Vec<&Change> {
        self.changes.iter().filter(|c| c.operation.is_change()).collect()
    }

    /// Returns `(resource, operation)` pairs in order.
    #[must_use]
    pub fn operations(&self) -> Vec<(&str, Operation)> {
        self.changes
            .iter()
            .map(|c| (c.resource.as_str(), c.operation))
            .collect()
    }

    /// Unwraps the change list.
    #[must_use]
    pub fn into_inner(self) -> Vec<Change> {
        self.changes
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Plan for one run against one stack.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the declaration the plan was computed from.
    pub config_hash: String,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Changes in execution order.
    pub changes: ChangeSet,
    /// Validation warnings carried over from the declaration.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Plan {
    /// Creates a plan from a computed change set.
    #[must_use]
    pub fn new(stack: &str, environment: &str, config_hash: &str, changes: ChangeSet) -> Self {
        Self {
            stack: stack.to_string(),
            environment: environment.to_string(),
            config_hash: config_hash.to_string(),
            created_at: Utc::now(),
            changes,
            warnings: Vec::new(),
        }
    }

    /// Attaches warnings.
    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Returns true if any change calls the provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.operation.is_change())
    }

    /// Number of changes that call the provider.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.changes.actionable().len()
    }

    /// Number of creates.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.changes.count(Operation::Create)
    }

    /// Number of in-place updates.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.changes.count(Operation::Update)
    }

    /// Number of replacements.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.changes.count(Operation::Replace)
    }

    /// Number of deletes.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.changes.count(Operation::Delete)
    }

    /// Number of unchanged resources.
    #[must_use]
    pub fn unchanged_count(&self) -> usize {
        self.changes.count(Operation::NoOp)
    }

    /// One-line summary of the counts.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create_count(),
            self.update_count(),
            self.replace_count(),
            self.delete_count(),
            self.unchanged_count()
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Plan for {}-{} ({} changes):",
            self.stack,
            self.environment,
            self.change_count()
        )?;
        for change in self.changes.actionable() {
            writeln!(f, "  {} {change}", change.operation.symbol())?;
        }
        write!(f, "{}", self.summary())?;

        if !self.warnings.is_empty() {
            writeln!(f, "\n\nWarnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {warning}")?;
            }
        }

        Ok(())
    }
}
