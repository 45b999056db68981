//! Fingerprints for change detection.
//!
//! This module provides deterministic hashing of resources and whole
//! declarations so unchanged resources can be skipped on re-apply.

use sha2::{Digest, Sha256};

use crate::model::{Properties, PropertyValue, ResourceDescriptor, ResourceKind};

use super::spec::StackDeclaration;

/// Hasher for computing fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole declaration.
    ///
    /// This hash changes when any part of the stack changes.
    #[must_use]
    pub fn hash_stack(&self, declaration: &StackDeclaration) -> String {
        let mut hasher = Sha256::new();

        hasher.update(declaration.stack.name.as_bytes());
        hasher.update(declaration.stack.environment.as_bytes());
        if let Some(region) = &declaration.stack.region {
            hasher.update(region.as_bytes());
        }

        for resource in &declaration.resources {
            hasher.update(resource.name.as_bytes());
            hasher.update(self.hash_resource(resource).as_bytes());
            for dep in &resource.depends_on {
                hasher.update(dep.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a declared resource.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceDescriptor) -> String {
        self.fingerprint(resource.kind, &resource.properties)
    }

    /// Computes the fingerprint of a kind and its properties.
    ///
    /// References are hashed symbolically, so the fingerprint does not
    /// change when a referenced resource gets a new handle.
    #[must_use]
    pub fn fingerprint(&self, kind: ResourceKind, properties: &Properties) -> String {
        let mut hasher = Sha256::new();

        hasher.update(kind.as_str().as_bytes());
        // Keys are ordered by the map
        for (key, value) in properties {
            hasher.update(key.as_bytes());
            hash_value(&mut hasher, value);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Feeds a value into the hasher with a type tag so `"1"` and `1` differ.
fn hash_value(hasher: &mut Sha256, value: &PropertyValue) {
    match value {
        PropertyValue::Reference(r) => {
            hasher.update(b"r");
            hasher.update(r.target.as_bytes());
            if let Some(attr) = &r.attribute {
                hasher.update(b".");
                hasher.update(attr.as_bytes());
            }
        }
        PropertyValue::Bool(b) => hasher.update(if *b { b"b1" } else { b"b0" }),
        PropertyValue::Integer(i) => {
            hasher.update(b"i");
            hasher.update(i.to_be_bytes());
        }
        PropertyValue::Float(x) => {
            hasher.update(b"f");
            hasher.update(x.to_bits().to_be_bytes());
        }
        PropertyValue::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        PropertyValue::List(items) => {
            hasher.update(b"l");
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        PropertyValue::Map(map) => {
            hasher.update(b"m");
            hasher.update((map.len() as u64).to_be_bytes());
            for (key, item) in map {
                hasher.update(key.as_bytes());
                hash_value(hasher, item);
            }
        }
    }
}
