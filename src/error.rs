//! Error types for the Stackform engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration loading, declaration validation, graph construction,
//! provider calls, state management and apply execution.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Stackform engine.
#[derive(Debug, Error)]
pub enum StackformError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The declaration violates one or more resource constraints.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Structural errors in the dependency graph.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Provisioning API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Apply execution errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The declaration file was not found.
    #[error("Declaration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The declaration file could not be parsed.
    #[error("Failed to parse declaration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Provider settings are out of range.
    #[error("Invalid provider settings: {message}")]
    InvalidProvider {
        /// Description of the problem.
        message: String,
    },
}

/// A single violated constraint in a declaration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    /// Logical name of the offending resource (empty for stack-level issues).
    pub resource: String,
    /// Property path that failed validation.
    pub field: String,
    /// Human readable message.
    pub message: String,
}

/// Validation failure listing every violated constraint.
#[derive(Debug, Clone, Error)]
pub struct ValidationError {
    /// All violations found, in declaration order.
    pub violations: Vec<Violation>,
}

/// Structural errors found while building the dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A dependency cycle was detected.
    #[error("Dependency cycle detected between: {}", members.join(" -> "))]
    Cycle {
        /// Logical names of the resources on the cycle, in declaration order.
        members: Vec<String>,
    },

    /// A reference points to a resource that is not declared.
    #[error("Resource '{resource}' references unknown resource '{target}'")]
    UnresolvedReference {
        /// The referencing resource.
        resource: String,
        /// The missing logical name.
        target: String,
    },

    /// Two resources share a logical name.
    #[error("Duplicate resource name: {name}")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },
}

/// Errors returned by the provisioning API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider asked us to slow down.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The provider is temporarily unavailable.
    #[error("Provider unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Transport failure talking to the provider.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The resource handle is unknown to the provider.
    #[error("Resource not found: {handle}")]
    NotFound {
        /// The missing handle.
        handle: String,
    },

    /// The provider rejected the request.
    #[error("Provider rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The provider returned something we could not interpret.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// A long-running operation finished in a failed state.
    #[error("Provider operation {operation} failed: {message}")]
    OperationFailed {
        /// Operation identifier.
        operation: String,
        /// Failure reason reported by the provider.
        message: String,
    },

    /// A long-running operation did not complete in time.
    #[error("Timed out waiting for provider operation {operation}")]
    Timeout {
        /// Operation identifier.
        operation: String,
    },

    /// A reference could not be resolved against recorded outputs.
    #[error("Cannot resolve reference to '{target}': {message}")]
    UnresolvedOutput {
        /// The referenced resource.
        target: String,
        /// What was missing.
        message: String,
    },
}

/// Broad category of a provider error, as shown in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable failure that exhausted its attempts.
    Transient,
    /// Non-retryable failure.
    Terminal,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Apply execution errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The run was aborted before execution.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// A scheduled task panicked or was cancelled by the runtime.
    #[error("Task for '{resource}' did not complete: {message}")]
    TaskFailed {
        /// Resource whose task failed.
        resource: String,
        /// Join error message.
        message: String,
    },
}

/// Result type alias for Stackform operations.
pub type Result<T> = std::result::Result<T, StackformError>;

impl StackformError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(e) => e.retry_after_secs(),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a parse error without a location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }
}

impl ValidationError {
    /// Creates a validation error from a list of violations.
    #[must_use]
    pub const fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    /// Number of violations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.violations.len()
    }

    /// Returns true if there are no violations.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Declaration validation failed with {} violation(s):", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  - {violation}")?;
        }
        Ok(())
    }
}

impl Violation {
    /// Creates a violation for a resource field.
    #[must_use]
    pub fn new(resource: impl Into<String>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.resource.is_empty() {
            write!(f, "{}: {}", self.field, self.message)
        } else if self.field.is_empty() {
            write!(f, "{}: {}", self.resource, self.message)
        } else {
            write!(f, "{}.{}: {}", self.resource, self.field, self.message)
        }
    }
}

impl ProviderError {
    /// Returns true if the failure is transient and the call may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Network { .. }
        )
    }

    /// Returns the provider's retry hint, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Returns the report category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::Terminal
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an invalid response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(
            ProviderError::Unavailable {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Rejected {
                status: 400,
                message: String::from("bad")
            }
            .is_transient()
        );
        assert_eq!(
            ProviderError::NotFound {
                handle: String::from("h")
            }
            .kind(),
            ErrorKind::Terminal
        );
    }

    #[test]
    fn test_retry_delay_from_rate_limit() {
        let err = StackformError::from(ProviderError::RateLimited { retry_after_secs: 7 });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(7));
    }

    #[test]
    fn test_validation_error_lists_every_violation() {
        let err = ValidationError::new(vec![
            Violation::new("db", "engine", "is required"),
            Violation::new("vpc", "cidr", "is not a valid CIDR block"),
        ]);
        let text = err.to_string();
        assert!(text.contains("2 violation(s)"));
        assert!(text.contains("db.engine: is required"));
        assert!(text.contains("vpc.cidr: is not a valid CIDR block"));
    }

    #[test]
    fn test_cycle_message_names_members() {
        let err = GraphError::Cycle {
            members: vec![String::from("a"), String::from("b")],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected between: a -> b");
    }
}
