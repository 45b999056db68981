//! Plan/apply engine.
//!
//! This module diffs the desired graph against the observed state,
//! turns the result into an ordered plan, and executes it against a
//! provisioner.

mod cancel;
mod diff;
mod executor;
mod plan;
mod retry;

pub use cancel::CancelToken;
pub use diff::DiffEngine;
pub use executor::{ApplyExecutor, ApplyReport, ExecutorOptions, ResourceOutcome, ResourceState};
pub use plan::{Change, ChangeSet, Operation, Plan, PropertyChange};
pub use retry::RetryPolicy;
