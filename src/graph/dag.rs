//! The resolved dependency graph of a stack.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::model::ResourceDescriptor;

/// A DAG of resource descriptors.
///
/// Node indices equal declaration positions. Edges run from a dependency
/// to its dependent, so walking `Outgoing` moves toward resources that
/// must be provisioned later.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// The underlying graph.
    pub(super) graph: DiGraph<ResourceDescriptor, ()>,

    /// Map from logical name to node index.
    pub(super) index: HashMap<String, NodeIndex>,

    /// Deterministic topological order.
    pub(super) order: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Returns descriptors in topological order.
    ///
    /// Dependencies always come before their dependents; ties are broken
    /// by declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&ResourceDescriptor> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    /// Returns logical names in topological order.
    #[must_use]
    pub fn names_in_order(&self) -> Vec<&str> {
        self.order.iter().map(|&idx| self.graph[idx].name.as_str()).collect()
    }

    /// Returns descriptors in declaration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.graph.node_weights()
    }

    /// Looks up a descriptor by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.index.get(name).map(|&idx| &self.graph[idx])
    }

    /// Returns true if the graph contains `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the declaration position of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|idx| idx.index())
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns the number of dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct dependencies of `name`, in declaration order.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct dependents of `name`, in declaration order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Every resource `name` transitively depends on, in declaration order.
    #[must_use]
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        self.reachable(name, Direction::Incoming)
    }

    /// Every resource that transitively depends on `name`, in declaration order.
    #[must_use]
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        self.reachable(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };

        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.into_iter().map(|n| self.graph[n].name.as_str()).collect()
    }

    fn reachable(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if next != start && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let mut nodes: Vec<NodeIndex> = seen.into_iter().collect();
        nodes.sort_unstable();
        nodes.into_iter().map(|n| self.graph[n].name.as_str()).collect()
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stack {\n    rankdir=LR;\n    node [shape=box];\n");

        for desc in self.graph.node_weights() {
            let _ = writeln!(out, "    \"{}\" [label=\"{}\\n({})\"];", desc.name, desc.name, desc.kind);
        }

        for edge in self.graph.raw_edges() {
            let _ = writeln!(
                out,
                "    \"{}\" -> \"{}\";",
                self.graph[edge.source()].name,
                self.graph[edge.target()].name
            );
        }

        out.push_str("}\n");
        out
    }
}
