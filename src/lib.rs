// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are reported
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackform
//!
//! A declarative, idempotent infrastructure engine.
//!
//! ## Overview
//!
//! A stack is described once, as data, in `stackform.yaml`. Stackform
//! validates it, works out the order in which resources must exist, and
//! converges the provider towards it:
//!
//! - Typed resource descriptors checked against per-kind schemas
//! - A dependency graph built from references and `depends_on`
//! - Plans of create, update, replace and delete operations
//! - Concurrent application with retries, leases and cancellation
//! - Drift detection against the live provider
//!
//! ## Architecture
//!
//! 1. **Desired state**: the declaration, parsed by [`config`]
//! 2. **Observed state**: the records kept by a [`state`] store
//! 3. **Plan**: the [`planner`] diffs the [`graph`] against the records
//! 4. **Apply**: the executor calls a [`provider`] and records results
//!
//! ## Modules
//!
//! - [`model`]: Resource descriptors, schemas and validation
//! - [`graph`]: Dependency graph construction and ordering
//! - [`config`]: Declaration parsing and environment overrides
//! - [`state`]: Observed state storage (local file, memory)
//! - [`provider`]: Provisioning API client and in-memory provisioner
//! - [`planner`]: Diffing, plans and concurrent execution
//! - [`engine`]: The plan/apply/drift façade
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: shop
//!   environment: dev
//!
//! resources:
//!   - name: vpc
//!     kind: network
//!     properties:
//!       cidr: 10.0.0.0/16
//!       availability_zones: [eu-west-1a]
//!       subnets:
//!         - { name: data, type: isolated }
//!
//!   - name: db-sg
//!     kind: security_group
//!     properties:
//!       network: { ref: vpc }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, StackDeclaration};
pub use engine::{DriftReport, Engine, EngineConfig};
pub use error::{Result, StackformError};
pub use graph::{DependencyGraph, GraphBuilder};
pub use model::{PropertyValue, Reference, ResourceDescriptor, ResourceKind, ResourceValidator};
pub use planner::{ApplyReport, CancelToken, ChangeSet, Operation, Plan};
pub use provider::{HttpProvisioner, MemoryProvisioner, Provisioner, ResourceHandle};
pub use state::{LocalStateStore, MemoryStateStore, ObservedState, StateStore};
