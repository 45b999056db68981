//! Resource model.
//!
//! Typed descriptors for provisionable entities, the per-kind property
//! schemas, and validation of a declaration against them.

mod descriptor;
mod kind;
mod schema;
mod validator;
mod value;

pub use descriptor::ResourceDescriptor;
pub use kind::ResourceKind;
pub use schema::{
    PropertySchema, PropertyType, is_immutable, is_open_to_world, parse_cidr, property_schema,
    schema_for,
};
pub use validator::{ResourceValidator, ValidationReport, is_valid_name};
pub use value::{Properties, PropertyValue, Reference};
