//! Dependency graph builder.
//!
//! Composes resource descriptors into a DAG from their declared
//! references and `depends_on` entries, and provides a deterministic
//! topological order for the planner.

mod builder;
mod dag;

pub use builder::GraphBuilder;
pub use dag::DependencyGraph;
