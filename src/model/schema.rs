//! Property schemas for each resource kind.
//!
//! Schemas are static tables. They drive generic validation (presence,
//! type, range) and tell the diff engine which properties force a
//! replacement when they change.

use std::net::IpAddr;

use super::kind::ResourceKind;

/// Expected shape of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// Any string.
    String,
    /// Integer within an inclusive range.
    Integer {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// Boolean flag.
    Bool,
    /// IPv4 or IPv6 address block.
    Cidr,
    /// One of a fixed set of strings.
    Enum(&'static [&'static str]),
    /// List of strings.
    StringList,
    /// Map of string keys to scalar values.
    StringMap,
    /// Reference to a resource, optionally restricted to one kind.
    Reference(Option<ResourceKind>),
    /// List of references, optionally restricted to one kind.
    ReferenceList(Option<ResourceKind>),
    /// Nested object with its own fields.
    Object(&'static [PropertySchema]),
    /// List of nested objects.
    ObjectList(&'static [PropertySchema]),
}

/// Schema of a single property (or nested object field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySchema {
    /// Property name.
    pub name: &'static str,
    /// Expected type.
    pub ty: PropertyType,
    /// Whether the property must be present.
    pub required: bool,
    /// Whether changing the property requires replacing the resource.
    pub immutable: bool,
}

impl PropertySchema {
    /// A required property.
    #[must_use]
    pub const fn required(name: &'static str, ty: PropertyType) -> Self {
        Self {
            name,
            ty,
            required: true,
            immutable: false,
        }
    }

    /// An optional property.
    #[must_use]
    pub const fn optional(name: &'static str, ty: PropertyType) -> Self {
        Self {
            name,
            ty,
            required: false,
            immutable: false,
        }
    }

    /// Marks the property as immutable-on-change.
    #[must_use]
    pub const fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

use PropertySchema as P;
use PropertyType as T;

/// Subnet placement types.
pub const SUBNET_TYPES: &[&str] = &["public", "private", "isolated"];

const PROTOCOLS: &[&str] = &["tcp", "udp"];
const DB_ENGINES: &[&str] = &["postgres", "mysql", "mariadb"];
const INSTANCE_CLASSES: &[&str] = &[
    "t3.micro", "t3.small", "t3.medium", "t3.large", "m5.large", "m5.xlarge", "r5.large",
];
const RUNTIMES: &[&str] = &["java17", "java21", "python3.12", "nodejs20.x", "provided.al2023"];
const COMPUTE_SIZES: &[&str] = &["small", "medium", "large", "x2_large"];
const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "ANY"];

const SUBNET_FIELDS: &[PropertySchema] = &[
    P::required("name", T::String),
    P::required("type", T::Enum(SUBNET_TYPES)),
];

const INGRESS_FIELDS: &[PropertySchema] = &[
    P::required("peer", T::Cidr),
    P::required("port", T::Integer { min: 1, max: 65535 }),
    P::optional("protocol", T::Enum(PROTOCOLS)),
    P::optional("description", T::String),
];

const SOURCE_FIELDS: &[PropertySchema] = &[
    P::required("owner", T::String),
    P::required("repo", T::String),
    P::required("branch", T::String),
];

const ROUTE_FIELDS: &[PropertySchema] = &[
    P::required("path", T::String),
    P::optional("method", T::Enum(HTTP_METHODS)),
    P::optional("integration", T::Reference(Some(ResourceKind::Function))),
    P::optional("mock", T::Bool),
];

const NETWORK: &[PropertySchema] = &[
    P::required("cidr", T::Cidr).immutable(),
    P::required("availability_zones", T::StringList),
    P::optional("internet_gateway", T::Bool),
    P::required("subnets", T::ObjectList(SUBNET_FIELDS)),
];

const SECURITY_GROUP: &[PropertySchema] = &[
    P::required("network", T::Reference(Some(ResourceKind::Network))).immutable(),
    P::optional("description", T::String),
    P::optional("allow_all_outbound", T::Bool),
    P::optional("ingress", T::ObjectList(INGRESS_FIELDS)),
];

const DATABASE: &[PropertySchema] = &[
    P::required("engine", T::Enum(DB_ENGINES)).immutable(),
    P::optional("engine_version", T::String),
    P::required("instance_class", T::Enum(INSTANCE_CLASSES)),
    P::required("database_name", T::String).immutable(),
    P::required("network", T::Reference(Some(ResourceKind::Network))).immutable(),
    P::required("subnet_type", T::Enum(SUBNET_TYPES)),
    P::optional("security_groups", T::ReferenceList(Some(ResourceKind::SecurityGroup))),
    P::optional("publicly_accessible", T::Bool),
    P::optional("multi_az", T::Bool),
    P::optional("allocated_storage_gb", T::Integer { min: 20, max: 65536 }),
    P::optional("credentials_secret", T::String),
];

const FUNCTION: &[PropertySchema] = &[
    P::required("function_name", T::String).immutable(),
    P::required("runtime", T::Enum(RUNTIMES)),
    P::required("handler", T::String),
    P::required("code", T::String),
    P::optional("memory_mb", T::Integer { min: 128, max: 10240 }),
    P::optional("timeout_secs", T::Integer { min: 1, max: 900 }),
    P::optional("environment", T::StringMap),
    P::optional("network", T::Reference(Some(ResourceKind::Network))),
    P::optional("security_groups", T::ReferenceList(Some(ResourceKind::SecurityGroup))),
    P::optional("secret_grants", T::StringList),
];

const BUCKET: &[PropertySchema] = &[
    P::required("bucket_name", T::String).immutable(),
    P::optional("versioned", T::Bool),
    P::optional("public_read", T::Bool),
    P::optional("read_write", T::ReferenceList(None)),
];

const PIPELINE: &[PropertySchema] = &[
    P::required("project_name", T::String).immutable(),
    P::optional("description", T::String),
    P::required("source", T::Object(SOURCE_FIELDS)),
    P::required("compute", T::Enum(COMPUTE_SIZES)),
    P::required("build_image", T::String),
    P::optional("concurrent_build_limit", T::Integer { min: 1, max: 100 }),
    P::optional("environment_variables", T::StringMap),
    P::optional("build_spec", T::String),
];

const GATEWAY: &[PropertySchema] = &[
    P::required("api_name", T::String).immutable(),
    P::optional("description", T::String),
    P::required("stage_name", T::String),
    P::required("routes", T::ObjectList(ROUTE_FIELDS)),
];

/// Returns the property schema for a resource kind.
#[must_use]
pub const fn schema_for(kind: ResourceKind) -> &'static [PropertySchema] {
    match kind {
        ResourceKind::Network => NETWORK,
        ResourceKind::SecurityGroup => SECURITY_GROUP,
        ResourceKind::Database => DATABASE,
        ResourceKind::Function => FUNCTION,
        ResourceKind::Bucket => BUCKET,
        ResourceKind::Pipeline => PIPELINE,
        ResourceKind::Gateway => GATEWAY,
    }
}

/// Looks up a property schema by name.
#[must_use]
pub fn property_schema(kind: ResourceKind, name: &str) -> Option<&'static PropertySchema> {
    schema_for(kind).iter().find(|p| p.name == name)
}

/// Returns true if changing `property` on a resource of `kind` forces a replacement.
#[must_use]
pub fn is_immutable(kind: ResourceKind, property: &str) -> bool {
    property_schema(kind, property).is_some_and(|p| p.immutable)
}

/// Parses an address block like `10.0.0.0/16` or `::/0`.
///
/// Host bits below the prefix must be zero.
///
/// # Errors
///
/// Returns a description of the problem when the block is malformed.
pub fn parse_cidr(block: &str) -> Result<(IpAddr, u8), String> {
    let (addr, prefix) = block
        .split_once('/')
        .ok_or_else(|| format!("'{block}' is missing a prefix length"))?;

    let addr: IpAddr = addr
        .parse()
        .map_err(|_| format!("'{addr}' is not a valid IP address"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("'{prefix}' is not a valid prefix length"))?;

    let host_bits_set = match addr {
        IpAddr::V4(v4) => {
            if prefix > 32 {
                return Err(format!("prefix /{prefix} exceeds 32 bits"));
            }
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shr(u32::from(prefix)).unwrap_or(0);
            bits & mask != 0
        }
        IpAddr::V6(v6) => {
            if prefix > 128 {
                return Err(format!("prefix /{prefix} exceeds 128 bits"));
            }
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shr(u32::from(prefix)).unwrap_or(0);
            bits & mask != 0
        }
    };

    if host_bits_set {
        return Err(format!("'{block}' has host bits set below the prefix"));
    }

    Ok((addr, prefix))
}

/// Returns true if the block matches every address.
#[must_use]
pub fn is_open_to_world(block: &str) -> bool {
    matches!(parse_cidr(block), Ok((_, 0)))
}
