//! The closed set of provisionable resource kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of a provisionable resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network with subnets.
    Network,
    /// Firewall rules attached to a network.
    SecurityGroup,
    /// Managed relational database instance.
    Database,
    /// Serverless compute function.
    Function,
    /// Object storage bucket.
    Bucket,
    /// Build pipeline.
    Pipeline,
    /// HTTP API front door.
    Gateway,
}

impl ResourceKind {
    /// All kinds, in a stable order.
    pub const ALL: [Self; 7] = [
        Self::Network,
        Self::SecurityGroup,
        Self::Database,
        Self::Function,
        Self::Bucket,
        Self::Pipeline,
        Self::Gateway,
    ];

    /// Returns the YAML tag for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::SecurityGroup => "security_group",
            Self::Database => "database",
            Self::Function => "function",
            Self::Bucket => "bucket",
            Self::Pipeline => "pipeline",
            Self::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown resource kind: {s}"))
    }
}
