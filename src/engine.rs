//! Engine façade.
//!
//! Ties the stages of a run together: validation, graph construction,
//! diffing against the observed state, execution, and the history entry
//! written at the end. Also checks recorded resources for drift.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ProviderConfig, StackDeclaration};
use crate::error::{ApplyError, ProviderError, Result};
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::model::{Properties, ResourceKind, ResourceValidator, ValidationReport, is_immutable};
use crate::planner::{
    ApplyExecutor, ApplyReport, CancelToken, DiffEngine, ExecutorOptions, Plan, PropertyChange,
    RetryPolicy,
};
use crate::provider::{Provisioner, ResourceHandle};
use crate::state::{HistoryEntry, ObservedState, RunOperation, StateStore};

/// Engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of changes in flight.
    pub parallelism: usize,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
    /// Stop starting new changes after the first failure.
    pub fail_fast: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_provider(&ProviderConfig::default())
    }
}

impl EngineConfig {
    /// Builds the settings from the declaration's provider section.
    #[must_use]
    pub const fn from_provider(config: &ProviderConfig) -> Self {
        Self {
            parallelism: config.parallelism,
            retry: RetryPolicy::from_config(config),
            fail_fast: false,
        }
    }

    /// Sets fail-fast mode.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Overrides the parallelism.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    const fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            parallelism: self.parallelism,
            retry: self.retry,
            fail_fast: self.fail_fast,
        }
    }
}

/// The declarative engine.
pub struct Engine {
    config: EngineConfig,
    provider: Arc<dyn Provisioner>,
    store: Arc<dyn StateStore>,
    validator: ResourceValidator,
    graph_builder: GraphBuilder,
    diff_engine: DiffEngine,
    hasher: ConfigHasher,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine over a provisioner and a state store.
    #[must_use]
    pub fn new(config: EngineConfig, provider: Arc<dyn Provisioner>, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            provider,
            store,
            validator: ResourceValidator::new(),
            graph_builder: GraphBuilder::new(),
            diff_engine: DiffEngine::new(),
            hasher: ConfigHasher::new(),
        }
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// The provisioner.
    #[must_use]
    pub fn provider(&self) -> &dyn Provisioner {
        self.provider.as_ref()
    }

    /// Validates the declaration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` listing every violation.
    pub fn validate(&self, declaration: &StackDeclaration) -> Result<ValidationReport> {
        self.validator.validate_stack(declaration)
    }

    /// Builds the dependency graph of the declaration.
    ///
    /// # Errors
    ///
    /// Returns a graph error on duplicates, unknown references or cycles.
    pub fn graph(&self, declaration: &StackDeclaration) -> Result<DependencyGraph> {
        self.graph_builder.build(&declaration.resources)
    }

    /// Computes the plan for a declaration.
    ///
    /// Nothing is sent to the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or graph construction fails, or the
    /// state cannot be loaded.
    pub async fn plan(&self, declaration: &StackDeclaration) -> Result<Plan> {
        info!("Planning {}", declaration.qualified_name());

        let report = self.validate(declaration)?;
        let graph = self.graph(declaration)?;
        let observed = self.load_observed(declaration).await?;

        let changes = self.diff_engine.compute(&graph, &observed);
        let plan = Plan::new(
            &declaration.stack.name,
            &declaration.stack.environment,
            &self.hasher.hash_stack(declaration),
            changes,
        )
        .with_warnings(report.warnings.iter().map(ToString::to_string).collect());

        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Computes the plan that deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn plan_destroy(&self, declaration: &StackDeclaration) -> Result<Plan> {
        info!("Planning destruction of {}", declaration.qualified_name());

        let emptied = declaration.emptied();
        let graph = self.graph(&emptied)?;
        let observed = self.load_observed(declaration).await?;

        let changes = self.diff_engine.compute(&graph, &observed);
        Ok(Plan::new(
            &declaration.stack.name,
            &declaration.stack.environment,
            &self.hasher.hash_stack(&emptied),
            changes,
        ))
    }

    /// Plans and applies a declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the state cannot be written.
    /// Provider failures are reported per resource in the report.
    pub async fn apply(&self, declaration: &StackDeclaration, cancel: &CancelToken) -> Result<ApplyReport> {
        let plan = self.plan(declaration).await?;
        self.execute(&plan, RunOperation::Apply, cancel).await
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or written.
    pub async fn destroy(&self, declaration: &StackDeclaration, cancel: &CancelToken) -> Result<ApplyReport> {
        let plan = self.plan_destroy(declaration).await?;
        self.execute(&plan, RunOperation::Destroy, cancel).await
    }

    /// Executes a plan computed earlier and records the run in the history.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be initialised or the history
    /// entry cannot be written.
    pub async fn execute(
        &self,
        plan: &Plan,
        operation: RunOperation,
        cancel: &CancelToken,
    ) -> Result<ApplyReport> {
        if !plan.has_changes() {
            info!("No changes required - state is converged");
        } else if self
            .store
            .initialize(&ObservedState::new(&plan.stack, &plan.environment))
            .await?
        {
            info!("Initialised state for {}-{}", plan.stack, plan.environment);
        }

        let executor = ApplyExecutor::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            self.config.executor_options(),
        );
        let report = executor.execute(plan, cancel).await;

        if plan.has_changes() {
            let resources = report.changed_resources();
            let entry = match report.error_summary() {
                None => HistoryEntry::new(operation, &plan.config_hash, resources),
                Some(error) => HistoryEntry::failed(operation, &plan.config_hash, resources, &error),
            };
            self.store.append_history(entry).await?;
        }

        Ok(report)
    }

    /// Describes every recorded resource and reports differences.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn check_drift(&self, declaration: &StackDeclaration) -> Result<DriftReport> {
        info!("Checking for drift in {}", declaration.qualified_name());

        let observed = self.load_observed(declaration).await?;
        let declared: BTreeSet<&str> = declaration.resources.iter().map(|r| r.name.as_str()).collect();

        let mut report = DriftReport {
            stack: declaration.stack.name.clone(),
            checked_at: Utc::now(),
            entries: Vec::with_capacity(observed.resources.len()),
            unprovisioned: declared
                .iter()
                .filter(|name| observed.get_record(name).is_none())
                .map(|name| (*name).to_string())
                .collect(),
            undeclared: observed
                .resources
                .keys()
                .filter(|name| !declared.contains(name.as_str()))
                .cloned()
                .collect(),
        };

        for record in observed.resources.values() {
            let provider = self.provider.as_ref();
            let handle = &record.handle;
            let (result, _) = self
                .config
                .retry
                .run("describe", move || provider.describe(handle))
                .await;

            let (status, differences, error) = match result {
                Ok(live) => {
                    let differences = compare_outputs(record.kind, &record.outputs, &live);
                    if differences.is_empty() {
                        (DriftStatus::InSync, differences, None)
                    } else {
                        (DriftStatus::Drifted, differences, None)
                    }
                }
                Err(ProviderError::NotFound { .. }) => (DriftStatus::Missing, vec![], None),
                Err(e) => {
                    warn!("Could not describe {}: {e}", record.name);
                    (DriftStatus::Unreachable, vec![], Some(e.to_string()))
                }
            };

            debug!("{} is {status}", record.name);
            report.entries.push(DriftEntry {
                resource: record.name.clone(),
                kind: record.kind,
                handle: record.handle.clone(),
                status,
                differences,
                error,
            });
        }

        info!(
            "Drift check finished: {} drifted resource(s)",
            report.drifted_resources().len()
        );
        Ok(report)
    }

    async fn load_observed(&self, declaration: &StackDeclaration) -> Result<ObservedState> {
        let Some(observed) = self.store.load().await? else {
            debug!("No state recorded yet for {}", declaration.qualified_name());
            return Ok(ObservedState::new(
                &declaration.stack.name,
                &declaration.stack.environment,
            ));
        };

        if observed.stack != declaration.stack.name || observed.environment != declaration.stack.environment {
            return Err(ApplyError::Aborted {
                reason: format!(
                    "state belongs to {}-{}, not {}",
                    observed.stack,
                    observed.environment,
                    declaration.qualified_name()
                ),
            }
            .into());
        }

        Ok(observed)
    }
}

/// Compares recorded outputs with live properties.
fn compare_outputs(kind: ResourceKind, recorded: &Properties, live: &Properties) -> Vec<PropertyChange> {
    let keys: BTreeSet<&String> = recorded.keys().chain(live.keys()).collect();

    keys.into_iter()
        .filter(|key| recorded.get(*key) != live.get(*key))
        .map(|key| PropertyChange {
            property: key.clone(),
            old: recorded.get(key).cloned(),
            new: live.get(key).cloned(),
            immutable: is_immutable(kind, key),
        })
        .collect()
}

/// Drift status of one recorded resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Live properties match the recorded outputs.
    InSync,
    /// Live properties differ from the recorded outputs.
    Drifted,
    /// The provider no longer knows the handle.
    Missing,
    /// The provider could not be asked.
    Unreachable,
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InSync => "in sync",
            Self::Drifted => "drifted",
            Self::Missing => "missing",
            Self::Unreachable => "unreachable",
        };
        write!(f, "{s}")
    }
}

/// Drift of one recorded resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Logical name.
    pub resource: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Recorded handle.
    pub handle: ResourceHandle,
    /// Result of the check.
    pub status: DriftStatus,
    /// Properties that differ, recorded value first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<PropertyChange>,
    /// Error from the provider, for unreachable resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Stack name.
    pub stack: String,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
    /// One entry per recorded resource.
    pub entries: Vec<DriftEntry>,
    /// Declared resources that have no record yet.
    pub unprovisioned: Vec<String>,
    /// Recorded resources that are no longer declared.
    pub undeclared: Vec<String>,
}

impl DriftReport {
    /// Resources whose live state differs from the record.
    #[must_use]
    pub fn drifted_resources(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, DriftStatus::Drifted | DriftStatus::Missing))
            .map(|e| e.resource.as_str())
            .collect()
    }

    /// Returns true if anything differs from the declaration or the record.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted_resources().is_empty() || !self.unprovisioned.is_empty() || !self.undeclared.is_empty()
    }

    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift() && self.entries.iter().all(|e| e.status == DriftStatus::InSync)
    }

    /// Returns the entry for a resource.
    #[must_use]
    pub fn entry(&self, resource: &str) -> Option<&DriftEntry> {
        self.entries.iter().find(|e| e.resource == resource)
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }

        writeln!(f, "Drift detected:")?;
        for entry in self.entries.iter().filter(|e| e.status != DriftStatus::InSync) {
            writeln!(f, "  - {} ({}): {}", entry.resource, entry.kind, entry.status)?;
            for difference in &entry.differences {
                writeln!(f, "      {difference}")?;
            }
        }
        for name in &self.unprovisioned {
            writeln!(f, "  - {name}: declared but not provisioned")?;
        }
        for name in &self.undeclared {
            writeln!(f, "  - {name}: provisioned but no longer declared")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyValue;

    #[test]
    fn test_compare_outputs_lists_both_sides() {
        let mut recorded = Properties::new();
        recorded.insert(String::from("versioned"), PropertyValue::Bool(false));
        recorded.insert(String::from("bucket_name"), PropertyValue::from("data"));

        let mut live = recorded.clone();
        live.insert(String::from("versioned"), PropertyValue::Bool(true));
        live.remove("bucket_name");

        let differences = compare_outputs(ResourceKind::Bucket, &recorded, &live);

        assert_eq!(differences.len(), 2);
        assert_eq!(differences[0].property, "bucket_name");
        assert!(differences[0].immutable);
        assert_eq!(differences[0].new, None);
        assert_eq!(differences[1].new, Some(PropertyValue::Bool(true)));
    }

    #[test]
    fn test_config_from_provider_section() {
        let provider = ProviderConfig {
            parallelism: 8,
            max_attempts: 2,
            ..ProviderConfig::default()
        };

        let config = EngineConfig::from_provider(&provider).with_fail_fast(true);

        assert_eq!(config.parallelism, 8);
        assert_eq!(config.retry.max_attempts, 2);
        assert!(config.fail_fast);
    }
}
