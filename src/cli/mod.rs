//! Command-line interface for Stackform.
//!
//! Argument parsing lives in `commands`, rendering of plans, reports and
//! state in `output`.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
