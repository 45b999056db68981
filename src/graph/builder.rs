//! Composes descriptors into a dependency graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::model::ResourceDescriptor;

use super::dag::DependencyGraph;

/// Builds a [`DependencyGraph`] from declared resources.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph.
    ///
    /// Every reference and `depends_on` entry becomes an edge from the
    /// dependency to the dependent.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` when two resources share a name,
    /// `UnresolvedReference` when a dependency is not declared, and
    /// `Cycle` when the dependencies are not acyclic.
    pub fn build(&self, descriptors: &[ResourceDescriptor]) -> Result<DependencyGraph> {
        let mut graph: DiGraph<ResourceDescriptor, ()> = DiGraph::with_capacity(descriptors.len(), 0);
        let mut index = HashMap::with_capacity(descriptors.len());

        for desc in descriptors {
            if index.contains_key(&desc.name) {
                return Err(GraphError::DuplicateResource {
                    name: desc.name.clone(),
                }
                .into());
            }
            let idx = graph.add_node(desc.clone());
            index.insert(desc.name.clone(), idx);
        }

        for (position, desc) in descriptors.iter().enumerate() {
            let dependent = NodeIndex::new(position);
            for dep in desc.dependencies() {
                let Some(&dep_idx) = index.get(dep) else {
                    return Err(GraphError::UnresolvedReference {
                        resource: desc.name.clone(),
                        target: dep.to_string(),
                    }
                    .into());
                };
                graph.add_edge(dep_idx, dependent, ());
            }
        }

        let order = match topological_sort(&graph) {
            Some(order) => order,
            None => {
                let members = cycle_members(&graph);
                return Err(GraphError::Cycle { members }.into());
            }
        };

        debug!(
            "Built dependency graph with {} node(s) and {} edge(s)",
            graph.node_count(),
            graph.edge_count()
        );

        Ok(DependencyGraph { graph, index, order })
    }
}

/// Kahn's algorithm with a min-heap on declaration index.
///
/// Returns `None` when a cycle prevents a complete ordering.
fn topological_sort(graph: &DiGraph<ResourceDescriptor, ()>) -> Option<Vec<NodeIndex>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(i)) = ready.pop() {
        let idx = NodeIndex::new(i);
        order.push(idx);

        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            let degree = &mut in_degree[next.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse(next.index()));
            }
        }
    }

    (order.len() == graph.node_count()).then_some(order)
}

/// Names of the first cycle, in declaration order.
///
/// A cycle is a strongly connected component with more than one member,
/// or a single resource that depends on itself. When several exist, the
/// one containing the earliest declared resource is reported.
fn cycle_members(graph: &DiGraph<ResourceDescriptor, ()>) -> Vec<String> {
    let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort_unstable();
            scc
        })
        .collect();

    cycles.sort_unstable_by_key(|scc| scc[0]);

    cycles
        .into_iter()
        .next()
        .map(|scc| scc.into_iter().map(|idx| graph[idx].name.clone()).collect())
        .unwrap_or_default()
}
