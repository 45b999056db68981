//! Resource descriptors: one declared, provisionable entity.

use serde::{Deserialize, Serialize};

use super::kind::ResourceKind;
use super::value::{Properties, PropertyValue, Reference};

/// A declared resource: identity, kind, properties and explicit dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Logical name, unique within the stack.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Declared properties.
    #[serde(default)]
    pub properties: Properties,
    /// Explicit dependencies in addition to those inferred from references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ResourceDescriptor {
    /// Creates a descriptor with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            properties: Properties::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Returns a property by name.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Returns every reference found in the properties.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for value in self.properties.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Returns the logical names this resource depends on.
    ///
    /// Explicit `depends_on` entries come first, then inferred references,
    /// deduplicated in first-seen order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        let inferred = self.references().into_iter().map(|r| r.target.as_str());
        for name in self.depends_on.iter().map(String::as_str).chain(inferred) {
            if !deps.contains(&name) {
                deps.push(name);
            }
        }
        deps
    }
}
