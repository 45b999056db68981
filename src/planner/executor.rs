//! Plan executor for applying change sets.
//!
//! Changes run as tasks on a `JoinSet`, at most `parallelism` at a time. A
//! change starts once all of its prerequisites reached `Applied`:
//!
//! - a create, update, replace or no-op waits for the changes of its
//!   declared dependencies;
//! - a delete waits for the deletes of resources that recorded a
//!   dependency on it, and for the declared resources that used to depend
//!   on it.
//!
//! Each task holds the resource lease while it works, re-reads the record
//! and re-derives the operation, so two runs touching the same resource
//! serialise and the second one sees the first one's result. Every
//! successful step is written to the state store immediately. Nothing is
//! rolled back on failure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, ErrorKind, ProviderError, Result, StackformError};
use crate::model::{Properties, PropertyValue, Reference, ResourceDescriptor, ResourceKind};
use crate::provider::{Provisioner, ResourceHandle};
use crate::state::{ResourceRecord, StateStore};

use super::cancel::CancelToken;
use super::diff::classify;
use super::plan::{Change, ChangeSet, Operation, Plan};
use super::retry::RetryPolicy;

/// Tuning of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum number of changes in flight.
    pub parallelism: usize,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
    /// Stop starting new changes after the first failure.
    pub fail_fast: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            retry: RetryPolicy::default(),
            fail_fast: false,
        }
    }
}

/// Lifecycle of one change during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Not started.
    Planned,
    /// Provider calls in progress.
    Applying,
    /// Completed and recorded.
    Applied,
    /// Gave up.
    Failed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Final state of one change.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    /// Logical name.
    pub resource: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Operation performed, or planned if it never started.
    pub operation: Operation,
    /// Where the change ended up.
    pub state: ResourceState,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// Handle of the resource after the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<ResourceHandle>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Prerequisite that kept this change from starting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Stack name.
    pub stack: String,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// One outcome per change, in plan order.
    pub outcomes: Vec<ResourceOutcome>,
    /// Whether the run was cancelled before every change started.
    pub cancelled: bool,
}

impl ApplyReport {
    /// Returns true if every change reached `Applied`.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(|o| o.state == ResourceState::Applied)
    }

    /// Returns the outcome for a resource.
    #[must_use]
    pub fn outcome(&self, resource: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.resource == resource)
    }

    /// Returns the outcomes in a given state.
    #[must_use]
    pub fn in_state(&self, state: ResourceState) -> Vec<&ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.state == state).collect()
    }

    /// Number of applied changes.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.in_state(ResourceState::Applied).len()
    }

    /// Number of failed changes.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.in_state(ResourceState::Failed).len()
    }

    /// Number of changes that never started.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.in_state(ResourceState::Planned).len()
    }

    /// Resources the run actually changed.
    #[must_use]
    pub fn changed_resources(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.state == ResourceState::Applied && o.operation.is_change())
            .map(|o| o.resource.clone())
            .collect()
    }

    /// Short summary of the first failure, for history entries.
    #[must_use]
    pub fn error_summary(&self) -> Option<String> {
        if let Some(failed) = self.outcomes.iter().find(|o| o.state == ResourceState::Failed) {
            return Some(format!(
                "{}: {}",
                failed.resource,
                failed.error.as_deref().unwrap_or("failed")
            ));
        }
        if self.cancelled {
            return Some(String::from("cancelled"));
        }
        None
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} failed, {} pending",
            self.applied_count(),
            self.failed_count(),
            self.pending_count()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// What the tasks share.
struct Shared {
    provider: Arc<dyn Provisioner>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
}

/// Result of one task.
struct Step {
    operation: Operation,
    attempts: u32,
    result: Result<Option<ResourceHandle>>,
}

/// Per-change bookkeeping of the scheduler.
struct Slot {
    state: ResourceState,
    operation: Operation,
    attempts: u32,
    handle: Option<ResourceHandle>,
    error: Option<(String, ErrorKind)>,
}

/// Executor for plans.
pub struct ApplyExecutor {
    shared: Arc<Shared>,
    options: ExecutorOptions,
}

impl fmt::Debug for ApplyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("provider", &self.shared.provider.name())
            .field("store", &self.shared.store.backend_type())
            .field("options", &self.options)
            .finish()
    }
}

impl ApplyExecutor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provisioner>,
        store: Arc<dyn StateStore>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                store,
                retry: options.retry,
            }),
            options,
        }
    }

    /// Executes a plan.
    ///
    /// Failures are reported per resource; the report says what was applied
    /// and what is still pending. The state store must already hold a state
    /// for the stack.
    pub async fn execute(&self, plan: &Plan, cancel: &CancelToken) -> ApplyReport {
        let started_at = Utc::now();
        let changes: Vec<&Change> = plan.changes.iter().collect();
        let prerequisites = prerequisites(&plan.changes);
        let parallelism = self.options.parallelism.max(1);

        info!(
            "Executing plan for {} ({} changes, parallelism {parallelism})",
            plan.stack,
            plan.change_count()
        );

        let mut slots: Vec<Slot> = changes
            .iter()
            .map(|c| Slot {
                state: ResourceState::Planned,
                operation: c.operation,
                attempts: 0,
                handle: c.recorded_handle.clone(),
                error: None,
            })
            .collect();

        let mut tasks = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut cancelled = false;
        let mut halted = false;

        loop {
            if !halted {
                for index in 0..slots.len() {
                    if tasks.len() >= parallelism {
                        break;
                    }
                    let ready = slots[index].state == ResourceState::Planned
                        && prerequisites[index]
                            .iter()
                            .all(|&p| slots[p].state == ResourceState::Applied);
                    if !ready {
                        continue;
                    }

                    if cancel.is_cancelled() {
                        warn!("Cancellation requested, no further changes will be started");
                        cancelled = true;
                        halted = true;
                        break;
                    }

                    debug!("Starting {}", changes[index]);
                    slots[index].state = ResourceState::Applying;
                    let task = tasks.spawn(run_change(Arc::clone(&self.shared), changes[index].clone()));
                    running.insert(task.id(), index);
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            let (id, step) = match joined {
                Ok((id, step)) => (id, step),
                Err(e) => {
                    let id = e.id();
                    let resource = running
                        .get(&id)
                        .map_or_else(String::new, |&i| changes[i].resource.clone());
                    let step = Step {
                        operation: running.get(&id).map_or(Operation::NoOp, |&i| changes[i].operation),
                        attempts: 0,
                        result: Err(ApplyError::TaskFailed {
                            resource,
                            message: e.to_string(),
                        }
                        .into()),
                    };
                    (id, step)
                }
            };

            let Some(index) = running.remove(&id) else {
                error!("Finished task {id} is not tracked");
                continue;
            };

            let slot = &mut slots[index];
            let change = changes[index];
            slot.operation = step.operation;
            slot.attempts = step.attempts;

            match step.result {
                Ok(handle) => {
                    info!("{} {}: applied", step.operation, change.resource);
                    slot.state = ResourceState::Applied;
                    slot.handle = handle;
                }
                Err(e) => {
                    error!("{} {} failed: {e}", step.operation, change.resource);
                    slot.state = ResourceState::Failed;
                    slot.error = Some((e.to_string(), error_kind(&e)));

                    if self.options.fail_fast && !halted {
                        warn!("Fail-fast: no further changes will be started");
                        halted = true;
                    }
                }
            }
        }

        let outcomes = changes
            .iter()
            .zip(&slots)
            .enumerate()
            .map(|(index, (change, slot))| {
                let blocked_by = (slot.state == ResourceState::Planned)
                    .then(|| {
                        prerequisites[index]
                            .iter()
                            .find(|&&p| slots[p].state != ResourceState::Applied)
                            .map(|&p| changes[p].resource.clone())
                    })
                    .flatten();

                ResourceOutcome {
                    resource: change.resource.clone(),
                    kind: change.kind,
                    operation: slot.operation,
                    state: slot.state,
                    attempts: slot.attempts,
                    handle: slot.handle.clone(),
                    error: slot.error.as_ref().map(|(m, _)| m.clone()),
                    error_kind: slot.error.as_ref().map(|&(_, k)| k),
                    blocked_by,
                }
            })
            .collect();

        let report = ApplyReport {
            stack: plan.stack.clone(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
            cancelled,
        };

        if report.success() {
            info!("Plan executed: {report}");
        } else {
            warn!("Plan partially executed: {report}");
        }
        report
    }
}

/// Computes the prerequisites of every change, as indices into the set.
fn prerequisites(changes: &ChangeSet) -> Vec<Vec<usize>> {
    let index: HashMap<&str, usize> = changes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.resource.as_str(), i))
        .collect();

    changes
        .iter()
        .enumerate()
        .map(|(i, change)| -> Vec<usize> {
            if change.operation != Operation::Delete {
                let mut seen = HashSet::new();
                return change
                    .dependencies
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .filter(|&p| p != i && seen.insert(p))
                    .collect();
            }

            changes
                .iter()
                .enumerate()
                .filter(|&(j, other)| {
                    j != i
                        && if other.operation == Operation::Delete {
                            other.dependencies.contains(&change.resource)
                        } else {
                            other.recorded_dependencies.contains(&change.resource)
                        }
                })
                .map(|(j, _)| j)
                .collect()
        })
        .collect()
}

fn error_kind(error: &StackformError) -> ErrorKind {
    match error {
        StackformError::Provider(e) => e.kind(),
        _ => ErrorKind::Terminal,
    }
}

/// Re-derives the operation from the record as it is now.
///
/// The planned operation stands unless the record changed since the plan
/// was computed, for example because a concurrent run got there first.
fn rederive(change: &Change, record: Option<&ResourceRecord>) -> Operation {
    let unchanged_since_plan = record.map_or(change.recorded_handle.is_none(), |r| {
        change.recorded_handle.as_ref() == Some(&r.handle)
            && change.recorded_fingerprint.as_deref() == Some(r.fingerprint.as_str())
    });
    if unchanged_since_plan {
        return change.operation;
    }

    match (&change.descriptor, &change.fingerprint) {
        (Some(descriptor), Some(fingerprint)) => classify(descriptor, fingerprint, record).0,
        _ if record.is_some() => Operation::Delete,
        _ => Operation::NoOp,
    }
}

/// Runs one change under its resource lease.
async fn run_change(shared: Arc<Shared>, change: Change) -> Step {
    let _lease = shared.store.lock_resource(&change.resource).await;

    let record = match shared.store.get_record(&change.resource).await {
        Ok(record) => record,
        Err(e) => {
            return Step {
                operation: change.operation,
                attempts: 0,
                result: Err(e),
            };
        }
    };

    let operation = rederive(&change, record.as_ref());
    if operation != change.operation {
        info!(
            "{} changed since planning: {} instead of {}",
            change.resource, operation, change.operation
        );
    }

    let mut applier = Applier {
        provider: shared.provider.as_ref(),
        store: shared.store.as_ref(),
        retry: shared.retry,
        change: &change,
        attempts: 0,
    };
    let result = applier.apply(operation, record).await;

    Step {
        operation,
        attempts: applier.attempts,
        result,
    }
}

/// Performs the provider calls and state writes of one change.
struct Applier<'a> {
    provider: &'a dyn Provisioner,
    store: &'a dyn StateStore,
    retry: RetryPolicy,
    change: &'a Change,
    attempts: u32,
}

impl<'a> Applier<'a> {
    async fn apply(
        &mut self,
        operation: Operation,
        record: Option<ResourceRecord>,
    ) -> Result<Option<ResourceHandle>> {
        match (operation, record) {
            (Operation::Delete, Some(record)) => {
                self.delete_live(&record.handle).await?;
                self.store.remove_record(&record.name).await?;
                info!("Deleted {} {} ({})", record.kind, record.name, record.handle);
                Ok(None)
            }
            (Operation::Delete | Operation::NoOp, None) => Ok(None),
            (Operation::Create, _) => self.create().await.map(Some),
            (Operation::Replace, Some(record)) => {
                self.delete_live(&record.handle).await?;
                self.store.remove_record(&record.name).await?;
                debug!("Deleted {} for replacement", record.handle);
                self.create().await.map(Some)
            }
            (Operation::Update, Some(record)) => self.update(record).await.map(Some),
            (Operation::NoOp, Some(record)) => self.refresh(record).await.map(Some),
            (Operation::Replace | Operation::Update, None) => Err(StackformError::internal(format!(
                "record for '{}' disappeared",
                self.change.resource
            ))),
        }
    }

    fn desired(&self) -> Result<(&'a ResourceDescriptor, &'a str)> {
        let change: &'a Change = self.change;
        match (&change.descriptor, &change.fingerprint) {
            (Some(descriptor), Some(fingerprint)) => Ok((descriptor, fingerprint.as_str())),
            _ => Err(StackformError::internal(format!(
                "no declaration for '{}'",
                change.resource
            ))),
        }
    }

    /// Runs a provider call under the retry policy, counting attempts.
    async fn call<T, F, Fut>(&mut self, what: &str, call: F) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let what = format!("{what} {}", self.change.resource);
        let (result, attempts) = self.retry.run(&what, call).await;
        self.attempts += attempts;
        result
    }

    async fn create(&mut self) -> Result<ResourceHandle> {
        let (descriptor, fingerprint) = self.desired()?;
        let properties = self.resolve(descriptor).await?;

        let provider = self.provider;
        let kind = descriptor.kind;
        let name = descriptor.name.as_str();
        let props = &properties;
        let handle = self
            .call("create", move || provider.create(kind, name, props))
            .await?;
        info!("Created {kind} {name} ({handle})");

        let mut record = ResourceRecord::new(name, kind, handle.clone(), "");
        self.fill(&mut record, descriptor);
        self.store.put_record(record.clone()).await?;

        record.outputs = self.describe(&handle).await?;
        record.fingerprint = fingerprint.to_string();
        record.touch();
        self.store.put_record(record).await?;
        Ok(handle)
    }

    async fn update(&mut self, mut record: ResourceRecord) -> Result<ResourceHandle> {
        let (descriptor, fingerprint) = self.desired()?;
        let properties = self.resolve(descriptor).await?;

        let provider = self.provider;
        let handle = record.handle.clone();
        let target = &handle;
        let props = &properties;
        self.call("update", move || provider.update(target, props))
            .await?;
        info!("Updated {} {} ({handle})", descriptor.kind, descriptor.name);

        record.mark_pending();
        self.fill(&mut record, descriptor);
        record.touch();
        self.store.put_record(record.clone()).await?;

        record.outputs = self.describe(&handle).await?;
        record.fingerprint = fingerprint.to_string();
        record.touch();
        self.store.put_record(record).await?;
        Ok(handle)
    }

    /// Refreshes dependencies and position of an unchanged resource.
    async fn refresh(&mut self, mut record: ResourceRecord) -> Result<ResourceHandle> {
        let (descriptor, _) = self.desired()?;
        let dependencies = dependency_names(descriptor);

        if record.dependencies != dependencies || record.position != self.change.position {
            debug!("Refreshing record of {}", record.name);
            record.dependencies = dependencies;
            record.position = self.change.position;
            record.touch();
            self.store.put_record(record.clone()).await?;
        }
        Ok(record.handle)
    }

    async fn delete_live(&mut self, handle: &ResourceHandle) -> Result<()> {
        let provider = self.provider;
        match self.call("delete", move || provider.delete(handle)).await {
            Ok(()) => Ok(()),
            Err(ProviderError::NotFound { .. }) => {
                debug!("{handle} is already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn describe(&mut self, handle: &ResourceHandle) -> Result<Properties> {
        let provider = self.provider;
        Ok(self.call("describe", move || provider.describe(handle)).await?)
    }

    fn fill(&self, record: &mut ResourceRecord, descriptor: &ResourceDescriptor) {
        record.properties = descriptor.properties.clone();
        record.dependencies = dependency_names(descriptor);
        record.position = self.change.position;
    }

    /// Replaces references with the handles or outputs of their targets.
    async fn resolve(&self, descriptor: &ResourceDescriptor) -> Result<Properties> {
        let mut targets: HashMap<String, ResourceRecord> = HashMap::new();
        for reference in descriptor.references() {
            if targets.contains_key(&reference.target) {
                continue;
            }
            let record = self
                .store
                .get_record(&reference.target)
                .await?
                .ok_or_else(|| ProviderError::UnresolvedOutput {
                    target: reference.target.clone(),
                    message: String::from("resource has not been provisioned"),
                })?;
            targets.insert(reference.target.clone(), record);
        }

        let lookup = |reference: &Reference| -> std::result::Result<PropertyValue, ProviderError> {
            let record = targets
                .get(&reference.target)
                .ok_or_else(|| ProviderError::UnresolvedOutput {
                    target: reference.target.clone(),
                    message: String::from("resource has not been provisioned"),
                })?;

            match &reference.attribute {
                None => Ok(PropertyValue::from(record.handle.as_str())),
                Some(attribute) => record.outputs.get(attribute).cloned().ok_or_else(|| {
                    ProviderError::UnresolvedOutput {
                        target: reference.target.clone(),
                        message: format!("output '{attribute}' is not recorded"),
                    }
                }),
            }
        };

        let resolved = descriptor
            .properties
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.resolve(&lookup)?)))
            .collect::<std::result::Result<Properties, ProviderError>>()?;
        Ok(resolved)
    }
}

fn dependency_names(descriptor: &ResourceDescriptor) -> Vec<String> {
    descriptor.dependencies().into_iter().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::provider::MockProvisioner;
    use crate::state::{MemoryStateStore, ObservedState};

    fn plan_for(descriptors: &[ResourceDescriptor], state: &ObservedState) -> Plan {
        let graph = GraphBuilder::new().build(descriptors).unwrap();
        let changes = DiffEngine::new().compute(&graph, state);
        Plan::new("shop", "dev", "hash", changes)
    }

    fn options() -> ExecutorOptions {
        ExecutorOptions {
            parallelism: 2,
            retry: RetryPolicy::none(),
            fail_fast: false,
        }
    }

    fn outputs(arn: &str) -> Properties {
        let mut p = Properties::new();
        p.insert(String::from("arn"), PropertyValue::from(arn));
        p
    }

    #[tokio::test]
    async fn test_create_resolves_references_and_records_outputs() {
        let descriptors = vec![
            ResourceDescriptor::new("data", ResourceKind::Bucket).with_property("bucket_name", "data"),
            ResourceDescriptor::new("api", ResourceKind::Function)
                .with_property("function_name", "api")
                .with_property("bucket", Reference::to("data"))
                .with_property("bucket_arn", Reference::attribute("data", "arn")),
        ];
        let store = Arc::new(MemoryStateStore::with_state(ObservedState::new("shop", "dev")));
        let plan = plan_for(&descriptors, &ObservedState::new("shop", "dev"));

        let mut provider = MockProvisioner::new();
        provider
            .expect_create()
            .withf(|_, name, _| name == "data")
            .times(1)
            .returning(|_, _, _| Ok(ResourceHandle::new("b-1")));
        provider
            .expect_create()
            .withf(|_, name, props| {
                name == "api"
                    && props["bucket"] == PropertyValue::from("b-1")
                    && props["bucket_arn"] == PropertyValue::from("arn:data")
            })
            .times(1)
            .returning(|_, _, _| Ok(ResourceHandle::new("f-1")));
        provider
            .expect_describe()
            .returning(|h| Ok(outputs(&format!("arn:{}", if h.as_str() == "b-1" { "data" } else { "api" }))));

        let executor = ApplyExecutor::new(Arc::new(provider), store.clone(), options());
        let report = executor.execute(&plan, &CancelToken::new()).await;

        assert!(report.success());
        let api = store.get_record("api").await.unwrap().unwrap();
        assert_eq!(api.handle, ResourceHandle::new("f-1"));
        assert_eq!(api.dependencies, vec!["data"]);
        assert_eq!(api.outputs["arn"], PropertyValue::from("arn:api"));
        // References stay symbolic in the record
        assert_eq!(api.properties["bucket"], PropertyValue::Reference(Reference::to("data")));
    }

    #[tokio::test]
    async fn test_terminal_failure_blocks_dependents() {
        let descriptors = vec![
            ResourceDescriptor::new("data", ResourceKind::Bucket).with_property("bucket_name", "data"),
            ResourceDescriptor::new("api", ResourceKind::Function).with_dependency("data"),
        ];
        let store = Arc::new(MemoryStateStore::with_state(ObservedState::new("shop", "dev")));
        let plan = plan_for(&descriptors, &ObservedState::new("shop", "dev"));

        let mut provider = MockProvisioner::new();
        provider.expect_create().times(1).returning(|_, _, _| {
            Err(ProviderError::Rejected {
                status: 400,
                message: String::from("bad bucket"),
            })
        });

        let executor = ApplyExecutor::new(Arc::new(provider), store.clone(), options());
        let report = executor.execute(&plan, &CancelToken::new()).await;

        assert!(!report.success());
        let data = report.outcome("data").unwrap();
        assert_eq!(data.state, ResourceState::Failed);
        assert_eq!(data.attempts, 1);
        assert_eq!(data.error_kind, Some(ErrorKind::Terminal));

        let api = report.outcome("api").unwrap();
        assert_eq!(api.state, ResourceState::Planned);
        assert_eq!(api.blocked_by.as_deref(), Some("data"));
        assert!(store.get_record("data").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_output_fails_without_provider_call() {
        let descriptors = vec![
            ResourceDescriptor::new("api", ResourceKind::Function)
                .with_property("bucket_arn", Reference::attribute("data", "arn")),
            ResourceDescriptor::new("data", ResourceKind::Bucket),
        ];

        let mut observed = ObservedState::new("shop", "dev");
        let fingerprint = crate::config::ConfigHasher::new().hash_resource(&descriptors[1]);
        observed.set_record(ResourceRecord::new(
            "data",
            ResourceKind::Bucket,
            ResourceHandle::new("b-1"),
            &fingerprint,
        ));
        let store = Arc::new(MemoryStateStore::with_state(observed.clone()));
        let plan = plan_for(&descriptors, &observed);

        let mut provider = MockProvisioner::new();
        provider.expect_create().times(0);

        let executor = ApplyExecutor::new(Arc::new(provider), store, options());
        let report = executor.execute(&plan, &CancelToken::new()).await;

        let api = report.outcome("api").unwrap();
        assert_eq!(api.state, ResourceState::Failed);
        assert!(api.error.as_deref().unwrap().contains("output 'arn' is not recorded"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_everything_planned() {
        let descriptors = vec![ResourceDescriptor::new("data", ResourceKind::Bucket)];
        let store = Arc::new(MemoryStateStore::with_state(ObservedState::new("shop", "dev")));
        let plan = plan_for(&descriptors, &ObservedState::new("shop", "dev"));

        let mut provider = MockProvisioner::new();
        provider.expect_create().times(0);

        let cancel = CancelToken::new();
        cancel.cancel();

        let executor = ApplyExecutor::new(Arc::new(provider), store, options());
        let report = executor.execute(&plan, &cancel).await;

        assert!(report.cancelled);
        assert!(!report.success());
        assert_eq!(report.pending_count(), 1);
        assert_eq!(report.outcome("data").unwrap().blocked_by, None);
    }

    #[test]
    fn test_delete_waits_for_recorded_dependents() {
        let mut observed = ObservedState::new("shop", "dev");
        for (position, (name, deps)) in [("net", vec![]), ("db", vec!["net"]), ("api", vec!["net"])]
            .into_iter()
            .enumerate()
        {
            let mut record = ResourceRecord::new(name, ResourceKind::Bucket, ResourceHandle::new(name), "x");
            record.dependencies = deps.into_iter().map(String::from).collect();
            record.position = position;
            observed.set_record(record);
        }

        // `api` stays declared but no longer depends on `net`
        let plan = plan_for(&[ResourceDescriptor::new("api", ResourceKind::Bucket)], &observed);
        let prereqs = prerequisites(&plan.changes);

        let position = |name: &str| plan.changes.iter().position(|c| c.resource == name).unwrap();
        let net = position("net");
        let mut waits_for: Vec<&str> = prereqs[net]
            .iter()
            .map(|&i| plan.changes.get(i).unwrap().resource.as_str())
            .collect();
        waits_for.sort_unstable();

        assert_eq!(waits_for, vec!["api", "db"]);
        assert!(prereqs[position("db")].is_empty());
    }
}
