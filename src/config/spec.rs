//! Declaration types for a stack.
//!
//! This module defines the structs that map to the `stackform.yaml` file.
//! A declaration fully describes the desired state of one stack.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ConfigError, Result};
use crate::model::ResourceDescriptor;

/// The root structure of a stack declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackDeclaration {
    /// Stack identity.
    pub stack: StackConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provisioning API settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Validation policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Stack name.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Target region, passed through to the provider.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON file on local disk.
    #[default]
    Local,
    /// In-process state, lost on exit.
    Memory,
}

/// Provisioning API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Base URL of the provisioning API.
    #[serde(default = "default_endpoint")]
    #[validate(url)]
    pub endpoint: String,
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,
    /// Delay between polls of a long-running operation.
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10, max = 60_000))]
    pub poll_interval_ms: u64,
    /// Upper bound on how long a single operation may run.
    #[serde(default = "default_operation_timeout_secs")]
    #[validate(range(min = 1, max = 86_400))]
    pub operation_timeout_secs: u64,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// First retry delay.
    #[serde(default = "default_initial_backoff_ms")]
    #[validate(range(min = 1))]
    pub initial_backoff_ms: u64,
    /// Retry delay ceiling.
    #[serde(default = "default_max_backoff_ms")]
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,
    /// Maximum number of changes applied concurrently.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 64))]
    pub parallelism: usize,
}

/// Validation policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyConfig {
    /// Turns public exposure warnings into errors.
    #[serde(default)]
    pub deny_public_exposure: bool,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

fn default_endpoint() -> String {
    String::from("http://127.0.0.1:8700")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_operation_timeout_secs() -> u64 {
    1_800
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_parallelism() -> usize {
    4
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            parallelism: default_parallelism(),
        }
    }
}

impl ProviderConfig {
    /// Checks ranges and the endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidProvider` describing every bad field.
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|e| ConfigError::InvalidProvider {
            message: e.to_string().replace('\n', "; "),
        })?;

        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidProvider {
                message: format!(
                    "max_backoff_ms ({}) is lower than initial_backoff_ms ({})",
                    self.max_backoff_ms, self.initial_backoff_ms
                ),
            }
            .into());
        }

        Ok(())
    }
}

impl StackDeclaration {
    /// Returns the fully qualified stack name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.stack.name, self.stack.environment)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Looks up a declared resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns a copy of this declaration with no resources.
    ///
    /// Planning against it deletes everything recorded for the stack.
    #[must_use]
    pub fn emptied(&self) -> Self {
        Self {
            resources: Vec::new(),
            ..self.clone()
        }
    }
}
