//! Diff engine for comparing desired vs observed state.
//!
//! Each declared resource is classified against its record: absent records
//! are created, matching fingerprints are left alone, and differing
//! properties become an update or, when one of them is immutable for the
//! kind, a replacement. Records that are no longer declared are deleted.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::DependencyGraph;
use crate::model::{Properties, ResourceDescriptor, is_immutable};
use crate::state::{ObservedState, ResourceRecord};

use super::plan::{Change, ChangeSet, Operation, PropertyChange};

/// Engine for computing diffs between desired and observed states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the changes that move `observed` towards `graph`.
    ///
    /// Declared resources come first, in the graph's topological order,
    /// followed by deletes in reverse dependency order.
    #[must_use]
    pub fn compute(&self, graph: &DependencyGraph, observed: &ObservedState) -> ChangeSet {
        let mut changes = Vec::with_capacity(graph.len());

        for descriptor in graph.topological_order() {
            let fingerprint = self.hasher.hash_resource(descriptor);
            let record = observed.get_record(&descriptor.name);
            let (operation, property_changes, reason) = classify(descriptor, &fingerprint, record);

            debug!("{} -> {operation}", descriptor.name);

            changes.push(Change {
                resource: descriptor.name.clone(),
                kind: descriptor.kind,
                operation,
                property_changes,
                reason,
                position: graph.position(&descriptor.name).unwrap_or_default(),
                dependencies: descriptor.dependencies().into_iter().map(String::from).collect(),
                recorded_dependencies: record.map(|r| r.dependencies.clone()).unwrap_or_default(),
                descriptor: Some(descriptor.clone()),
                fingerprint: Some(fingerprint),
                recorded_handle: record.map(|r| r.handle.clone()),
                recorded_fingerprint: record.map(|r| r.fingerprint.clone()),
            });
        }

        propagate_replacements(&mut changes);

        let orphaned: Vec<&ResourceRecord> = observed
            .resources
            .values()
            .filter(|r| !graph.contains(&r.name))
            .collect();

        for record in deletion_order(orphaned) {
            debug!("{} -> delete (no longer declared)", record.name);

            changes.push(Change {
                resource: record.name.clone(),
                kind: record.kind,
                operation: Operation::Delete,
                property_changes: vec![],
                reason: String::from("no longer declared"),
                position: record.position,
                dependencies: record.dependencies.clone(),
                recorded_dependencies: record.dependencies.clone(),
                descriptor: None,
                fingerprint: None,
                recorded_handle: Some(record.handle.clone()),
                recorded_fingerprint: Some(record.fingerprint.clone()),
            });
        }

        ChangeSet::new(changes)
    }
}

/// Classifies a declared resource against its record.
pub(crate) fn classify(
    descriptor: &ResourceDescriptor,
    fingerprint: &str,
    record: Option<&ResourceRecord>,
) -> (Operation, Vec<PropertyChange>, String) {
    let Some(record) = record else {
        return (Operation::Create, vec![], String::from("not yet provisioned"));
    };

    if record.kind != descriptor.kind {
        return (
            Operation::Replace,
            vec![],
            format!("kind changed from {} to {}", record.kind, descriptor.kind),
        );
    }

    if record.fingerprint == fingerprint {
        return (Operation::NoOp, vec![], String::new());
    }

    let changes = property_changes(descriptor, &record.properties);
    let forcing: Vec<&str> = changes
        .iter()
        .filter(|c| c.immutable)
        .map(|c| c.property.as_str())
        .collect();

    if !forcing.is_empty() {
        let reason = format!("immutable {} changed", forcing.join(", "));
        return (Operation::Replace, changes, reason);
    }

    let reason = if record.is_pending() && changes.is_empty() {
        String::from("outputs not yet recorded")
    } else if changes.is_empty() {
        String::from("fingerprint changed")
    } else {
        let names: Vec<&str> = changes.iter().map(|c| c.property.as_str()).collect();
        format!("{} changed", names.join(", "))
    };
    (Operation::Update, changes, reason)
}

/// Lists the properties that differ, in key order.
fn property_changes(descriptor: &ResourceDescriptor, recorded: &Properties) -> Vec<PropertyChange> {
    let keys: BTreeSet<&String> = recorded.keys().chain(descriptor.properties.keys()).collect();

    keys.into_iter()
        .filter_map(|key| {
            let old = recorded.get(key);
            let new = descriptor.properties.get(key);
            (old != new).then(|| PropertyChange {
                property: key.clone(),
                old: old.cloned(),
                new: new.cloned(),
                immutable: is_immutable(descriptor.kind, key),
            })
        })
        .collect()
}

/// Turns unchanged resources that reference a replaced resource into updates.
fn propagate_replacements(changes: &mut [Change]) {
    let replaced: HashSet<String> = changes
        .iter()
        .filter(|c| c.operation == Operation::Replace)
        .map(|c| c.resource.clone())
        .collect();

    if replaced.is_empty() {
        return;
    }

    for change in changes.iter_mut().filter(|c| c.operation == Operation::NoOp) {
        let target = change.descriptor.as_ref().and_then(|d| {
            d.references()
                .into_iter()
                .find(|r| replaced.contains(&r.target))
                .map(|r| r.target.clone())
        });

        if let Some(target) = target {
            debug!("{} -> update (references replaced {target})", change.resource);
            change.operation = Operation::Update;
            change.reason = format!("references replaced resource '{target}'");
        }
    }
}

/// Orders records for deletion: dependents before their dependencies.
///
/// Uses the dependencies recorded at apply time. Ties are broken by
/// recorded position, later resources first.
fn deletion_order(records: Vec<&ResourceRecord>) -> Vec<&ResourceRecord> {
    let by_name: HashMap<&str, &ResourceRecord> =
        records.iter().map(|r| (r.name.as_str(), *r)).collect();

    let mut in_degree: HashMap<&str, usize> = records
        .iter()
        .map(|r| {
            let deps = r
                .dependencies
                .iter()
                .filter(|d| by_name.contains_key(d.as_str()) && d.as_str() != r.name)
                .count();
            (r.name.as_str(), deps)
        })
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, &str)>> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&name, _)| Reverse((by_name[name].position, name)))
        .collect();

    let mut order: Vec<&ResourceRecord> = Vec::with_capacity(records.len());
    while let Some(Reverse((_, name))) = ready.pop() {
        order.push(by_name[name]);

        for dependent in &records {
            if dependent.dependencies.iter().any(|d| d == name)
                && let Some(deg) = in_degree.get_mut(dependent.name.as_str())
                && *deg > 0
            {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse((dependent.position, dependent.name.as_str())));
                }
            }
        }
    }

    // Recorded dependencies can only cycle if the state was edited by hand
    if order.len() < records.len() {
        let mut rest: Vec<&ResourceRecord> = records
            .iter()
            .copied()
            .filter(|r| !order.iter().any(|o| o.name == r.name))
            .collect();
        rest.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        order.extend(rest);
    }

    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::{PropertyValue, Reference, ResourceKind};
    use crate::provider::ResourceHandle;

    fn bucket(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(name, ResourceKind::Bucket)
            .with_property("bucket_name", format!("{name}-data"))
    }

    fn handler(name: &str, target: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(name, ResourceKind::Function)
            .with_property("function_name", name)
            .with_property("runtime", "python3.12")
            .with_property("handler", "main.handler")
            .with_property("code", "s3://code/handler.zip")
            .with_property(
                "environment",
                PropertyValue::Map(
                    [(String::from("BUCKET"), Reference::to(target).into())]
                        .into_iter()
                        .collect(),
                ),
            )
    }

    fn record_of(descriptor: &ResourceDescriptor, position: usize) -> ResourceRecord {
        let fingerprint = ConfigHasher::new().hash_resource(descriptor);
        let mut record = ResourceRecord::new(
            &descriptor.name,
            descriptor.kind,
            ResourceHandle::new(format!("h-{}", descriptor.name)),
            &fingerprint,
        );
        record.properties = descriptor.properties.clone();
        record.dependencies = descriptor.dependencies().into_iter().map(String::from).collect();
        record.position = position;
        record
    }

    fn observed(records: Vec<ResourceRecord>) -> ObservedState {
        let mut state = ObservedState::new("shop", "dev");
        for record in records {
            state.set_record(record);
        }
        state
    }

    #[test]
    fn test_everything_is_created_on_empty_state() {
        let descriptors = vec![handler("api", "data"), bucket("data")];
        let graph = GraphBuilder::new().build(&descriptors).unwrap();

        let changes = DiffEngine::new().compute(&graph, &ObservedState::new("shop", "dev"));

        assert_eq!(
            changes.operations(),
            vec![("data", Operation::Create), ("api", Operation::Create)]
        );
        assert_eq!(changes.find("api").unwrap().dependencies, vec!["data"]);
    }

    #[test]
    fn test_unchanged_stack_is_all_no_op() {
        let descriptors = vec![bucket("data"), handler("api", "data")];
        let graph = GraphBuilder::new().build(&descriptors).unwrap();
        let state = observed(vec![record_of(&descriptors[0], 0), record_of(&descriptors[1], 1)]);

        let changes = DiffEngine::new().compute(&graph, &state);

        assert!(changes.iter().all(|c| c.operation == Operation::NoOp));
        assert!(changes.actionable().is_empty());
    }

    #[test]
    fn test_mutable_change_is_update() {
        let old = bucket("data");
        let new = bucket("data").with_property("versioned", true);
        let graph = GraphBuilder::new().build(std::slice::from_ref(&new)).unwrap();

        let changes = DiffEngine::new().compute(&graph, &observed(vec![record_of(&old, 0)]));
        let change = changes.find("data").unwrap();

        assert_eq!(change.operation, Operation::Update);
        assert_eq!(change.property_changes.len(), 1);
        assert_eq!(change.property_changes[0].property, "versioned");
        assert_eq!(change.property_changes[0].old, None);
        assert!(!change.property_changes[0].immutable);
    }

    #[test]
    fn test_pending_record_is_updated() {
        let data = bucket("data");
        let mut record = record_of(&data, 0);
        record.mark_pending();
        let graph = GraphBuilder::new().build(std::slice::from_ref(&data)).unwrap();

        let changes = DiffEngine::new().compute(&graph, &observed(vec![record]));
        let change = changes.find("data").unwrap();

        assert_eq!(change.operation, Operation::Update);
        assert!(change.property_changes.is_empty());
        assert_eq!(change.reason, "outputs not yet recorded");
    }

    #[test]
    fn test_immutable_change_replaces_and_updates_referrers() {
        let old = vec![bucket("data"), handler("api", "data")];
        let new = vec![
            ResourceDescriptor::new("data", ResourceKind::Bucket).with_property("bucket_name", "renamed"),
            handler("api", "data"),
        ];
        let graph = GraphBuilder::new().build(&new).unwrap();
        let state = observed(vec![record_of(&old[0], 0), record_of(&old[1], 1)]);

        let changes = DiffEngine::new().compute(&graph, &state);

        let data = changes.find("data").unwrap();
        assert_eq!(data.operation, Operation::Replace);
        assert!(data.reason.contains("bucket_name"));

        let api = changes.find("api").unwrap();
        assert_eq!(api.operation, Operation::Update);
        assert_eq!(api.reason, "references replaced resource 'data'");
    }

    #[test]
    fn test_kind_change_replaces() {
        let old = bucket("thing");
        let new = ResourceDescriptor::new("thing", ResourceKind::Pipeline);
        let graph = GraphBuilder::new().build(&[new]).unwrap();

        let changes = DiffEngine::new().compute(&graph, &observed(vec![record_of(&old, 0)]));
        let change = changes.find("thing").unwrap();

        assert_eq!(change.operation, Operation::Replace);
        assert_eq!(change.reason, "kind changed from bucket to pipeline");
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let x = bucket("x");
        let y = handler("y", "x");
        let z = bucket("z");
        let state = observed(vec![record_of(&x, 0), record_of(&y, 1), record_of(&z, 2)]);
        let graph = GraphBuilder::new().build(&[]).unwrap();

        let changes = DiffEngine::new().compute(&graph, &state);

        assert_eq!(
            changes.operations(),
            vec![
                ("z", Operation::Delete),
                ("y", Operation::Delete),
                ("x", Operation::Delete),
            ]
        );
        let x_delete = changes.find("x").unwrap();
        assert_eq!(x_delete.recorded_handle, Some(ResourceHandle::new("h-x")));
    }

    #[test]
    fn test_deletes_follow_declared_changes() {
        let keep = bucket("keep");
        let gone = bucket("gone");
        let graph = GraphBuilder::new().build(std::slice::from_ref(&keep)).unwrap();
        let state = observed(vec![record_of(&keep, 0), record_of(&gone, 1)]);

        let changes = DiffEngine::new().compute(&graph, &state);

        assert_eq!(
            changes.operations(),
            vec![("keep", Operation::NoOp), ("gone", Operation::Delete)]
        );
    }
}
