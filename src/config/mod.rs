//! Stack declaration handling.
//!
//! This module handles all declaration-related functionality:
//! - Parsing and deserializing `stackform.yaml`
//! - Provider settings checks and environment overrides
//! - Computing fingerprints for change detection

mod spec;
mod parser;
mod hash;

pub use spec::{
    PolicyConfig, ProviderConfig, StackConfig, StackDeclaration, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR, find_config_file};
pub use hash::ConfigHasher;
