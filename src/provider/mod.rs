//! Provisioning API.
//!
//! The engine never touches cloud resources directly. Every side effect goes
//! through a [`Provisioner`]: the HTTP client for a real provisioning
//! service, or the in-memory implementation used by tests and dry runs.

mod client;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProviderError;
use crate::model::{Properties, ResourceKind};

pub use client::{HttpProvisioner, ProviderSettings};
pub use memory::{CallKind, MemoryProvisioner, ProviderCall};

/// Provider-assigned identifier of a live resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHandle(String);

impl ResourceHandle {
    /// Wraps a provider identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Operations exposed by a provisioning API.
///
/// Properties passed in are fully resolved: references have already been
/// replaced by the handles or outputs of their targets. Calls may take a
/// long time; implementations wait for completion before returning.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates a resource and returns its handle.
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        properties: &Properties,
    ) -> Result<ResourceHandle, ProviderError>;

    /// Updates a resource in place.
    async fn update(&self, handle: &ResourceHandle, properties: &Properties) -> Result<(), ProviderError>;

    /// Deletes a resource.
    async fn delete(&self, handle: &ResourceHandle) -> Result<(), ProviderError>;

    /// Returns the live properties and outputs of a resource.
    async fn describe(&self, handle: &ResourceHandle) -> Result<Properties, ProviderError>;

    /// Gets the provider name for display.
    fn name(&self) -> &'static str;
}
