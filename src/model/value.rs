//! Property values carried by resource descriptors.
//!
//! Values mirror the YAML data model, plus one extra shape: a reference to
//! another resource, written `{ ref: <name> }` or
//! `{ ref: <name>, attribute: <output> }`.

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Property map of a resource, ordered by key for deterministic hashing.
pub type Properties = BTreeMap<String, PropertyValue>;

/// A single property value.
///
/// A map deserializes as a [`Reference`] only when its keys are exactly
/// `ref` and optionally `attribute`, both strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Reference to another resource in the same stack.
    Reference(Reference),
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Integer(i64),
    /// Floating point scalar.
    Float(f64),
    /// String scalar.
    String(String),
    /// Ordered list of values.
    List(Vec<PropertyValue>),
    /// Nested map of values.
    Map(BTreeMap<String, PropertyValue>),
}

/// A reference to another resource's handle or one of its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Reference {
    /// Logical name of the referenced resource.
    #[serde(rename = "ref")]
    pub target: String,
    /// Output attribute to read; the provider handle when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Reference {
    /// Creates a reference to a resource's handle.
    #[must_use]
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: None,
        }
    }

    /// Creates a reference to one of a resource's outputs.
    #[must_use]
    pub fn attribute(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: Some(attribute.into()),
        }
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PropertyValueVisitor)
    }
}

struct PropertyValueVisitor;

impl<'de> Visitor<'de> for PropertyValueVisitor {
    type Value = PropertyValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar, a list, a map or a { ref: <name> } reference")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(PropertyValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(PropertyValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        i64::try_from(v)
            .map(PropertyValue::Integer)
            .map_err(|_| E::custom(format!("integer {v} is out of range")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(PropertyValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(PropertyValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(PropertyValue::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(PropertyValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, PropertyValue>()? {
            map.insert(key, value);
        }
        Ok(reference_from_map(&map).map_or(PropertyValue::Map(map), PropertyValue::Reference))
    }
}

fn reference_from_map(map: &BTreeMap<String, PropertyValue>) -> Option<Reference> {
    let target = map.get("ref")?.as_str()?;
    let attribute = match map.get("attribute") {
        Some(value) => Some(value.as_str()?.to_string()),
        None => None,
    };
    let expected = 1 + usize::from(attribute.is_some());
    (map.len() == expected).then(|| Reference {
        target: target.to_string(),
        attribute,
    })
}

impl PropertyValue {
    /// Returns a short name of the value's shape, for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Reference(_) => "reference",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the list content, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the map content, if this is a map.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the reference, if this is a reference.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Collects every reference nested anywhere in this value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(out)),
            Self::Bool(_) | Self::Integer(_) | Self::Float(_) | Self::String(_) => {}
        }
    }

    /// Returns true if this value contains a reference to `target`.
    #[must_use]
    pub fn references_target(&self, target: &str) -> bool {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs.iter().any(|r| r.target == target)
    }

    /// Replaces every reference with the value produced by `resolve`.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `resolve`.
    pub fn resolve<E>(&self, resolve: &impl Fn(&Reference) -> Result<Self, E>) -> Result<Self, E> {
        Ok(match self {
            Self::Reference(r) => resolve(r)?,
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|v| v.resolve(resolve))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(resolve)?)))
                    .collect::<Result<_, _>>()?,
            ),
            other => other.clone(),
        })
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Reference> for PropertyValue {
    fn from(value: Reference) -> Self {
        Self::Reference(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference(r) => match &r.attribute {
                Some(attr) => write!(f, "${{{}.{attr}}}", r.target),
                None => write!(f, "${{{}}}", r.target),
            },
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_reference_shapes() {
        let yaml = r"
plain: 10.0.0.0/16
count: 3
flag: true
vpc: { ref: cvbuilder-vpc }
arn: { ref: cvbuilder-fn, attribute: arn }
env: { ref: x, other: y }
";
        let props: Properties = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(props["plain"], PropertyValue::from("10.0.0.0/16"));
        assert_eq!(props["count"], PropertyValue::Integer(3));
        assert_eq!(props["flag"], PropertyValue::Bool(true));
        assert_eq!(props["vpc"], PropertyValue::Reference(Reference::to("cvbuilder-vpc")));
        assert_eq!(
            props["arn"],
            PropertyValue::Reference(Reference::attribute("cvbuilder-fn", "arn"))
        );
        // Extra keys make it a plain map, not a reference.
        assert!(props["env"].as_map().is_some());
    }

    #[test]
    fn test_short_string_lists_stay_lists() {
        let yaml = r"
zones: [eu-west-1a, eu-west-1b]
grants: [secret-a]
three: [a, b, c]
";
        let props: Properties = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(props["zones"], PropertyValue::from(vec!["eu-west-1a", "eu-west-1b"]));
        assert_eq!(props["grants"], PropertyValue::from(vec!["secret-a"]));
        assert_eq!(props["three"], PropertyValue::from(vec!["a", "b", "c"]));
    }

    #[test]
    fn test_non_string_ref_is_a_map() {
        let props: Properties = serde_yaml::from_str("a: { ref: 3 }\nb: { ref: x, attribute: [y] }").unwrap();
        assert!(props["a"].as_map().is_some());
        assert!(props["b"].as_map().is_some());
    }

    #[test]
    fn test_json_round_trip_keeps_references() {
        let mut props = Properties::new();
        props.insert(String::from("vpc"), PropertyValue::from(Reference::attribute("net", "id")));
        props.insert(String::from("zones"), PropertyValue::from(vec!["a", "b"]));
        props.insert(String::from("size"), PropertyValue::Integer(20));
        let json = serde_json::to_string(&props).unwrap();
        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_collect_nested_references() {
        let yaml = r"
routes:
  - path: /cvs
    integration: { ref: handler }
  - path: /health
    mock: true
groups: [{ ref: sg-a }, { ref: sg-b }]
";
        let props: Properties = serde_yaml::from_str(yaml).unwrap();
        let mut refs = Vec::new();
        for value in props.values() {
            value.collect_references(&mut refs);
        }
        let targets: Vec<&str> = refs.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["sg-a", "sg-b", "handler"]);
    }

    #[test]
    fn test_resolve_replaces_references() {
        let value = PropertyValue::List(vec![
            PropertyValue::Reference(Reference::to("a")),
            PropertyValue::from("keep"),
        ]);
        let resolved = value
            .resolve(&|r: &Reference| Ok::<_, ()>(PropertyValue::from(format!("handle-{}", r.target))))
            .unwrap();
        assert_eq!(
            resolved,
            PropertyValue::List(vec![PropertyValue::from("handle-a"), PropertyValue::from("keep")])
        );
    }
}
