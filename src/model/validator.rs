//! Declaration validation.
//!
//! Every descriptor is checked against its kind's schema, then against the
//! cross-property rules of that kind. All violations are collected before
//! the run fails, so a single pass reports everything that is wrong.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::config::StackDeclaration;
use crate::error::{Result, StackformError, ValidationError, Violation};

use super::descriptor::ResourceDescriptor;
use super::kind::ResourceKind;
use super::schema::{PropertySchema, PropertyType, is_open_to_world, parse_cidr, schema_for};
use super::value::{Properties, PropertyValue};

/// Validation result containing every problem found.
#[derive(Debug, Default, serde::Serialize)]
pub struct ValidationReport {
    /// Violations that fail the run.
    pub errors: Vec<Violation>,
    /// Non-fatal issues.
    pub warnings: Vec<Violation>,
}

impl ValidationReport {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

/// Validator for stack declarations.
#[derive(Debug, Default)]
pub struct ResourceValidator;

impl ResourceValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a whole declaration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` listing every violation when any exists.
    pub fn validate_stack(&self, declaration: &StackDeclaration) -> Result<ValidationReport> {
        let report = self.check(declaration);

        if report.is_valid() {
            debug!(
                "Declaration validation passed with {} warning(s)",
                report.warning_count()
            );
            Ok(report)
        } else {
            Err(StackformError::Validation(ValidationError::new(report.errors)))
        }
    }

    /// Collects errors and warnings without failing.
    #[must_use]
    pub fn check(&self, declaration: &StackDeclaration) -> ValidationReport {
        let mut checker = Checker {
            report: ValidationReport::default(),
            kinds: declaration
                .resources
                .iter()
                .map(|r| (r.name.as_str(), r.kind))
                .collect(),
            deny_public_exposure: declaration.policy.deny_public_exposure,
        };

        checker.check_stack(&declaration.resources);
        checker.report
    }
}

struct Checker<'a> {
    report: ValidationReport,
    kinds: HashMap<&'a str, ResourceKind>,
    deny_public_exposure: bool,
}

impl Checker<'_> {
    fn error(&mut self, resource: &str, field: impl Into<String>, message: impl Into<String>) {
        self.report.errors.push(Violation::new(resource, field, message));
    }

    fn warn(&mut self, resource: &str, field: impl Into<String>, message: impl Into<String>) {
        self.report.warnings.push(Violation::new(resource, field, message));
    }

    fn exposure(&mut self, resource: &str, field: impl Into<String>, message: impl Into<String>) {
        if self.deny_public_exposure {
            self.error(resource, field, message);
        } else {
            self.warn(resource, field, message);
        }
    }

    fn check_stack(&mut self, resources: &[ResourceDescriptor]) {
        if resources.is_empty() {
            self.warn("stack", "resources", "No resources declared");
            return;
        }

        let mut seen = HashSet::new();
        for resource in resources {
            if !seen.insert(resource.name.as_str()) {
                self.error(&resource.name, "name", format!("Duplicate resource name: {}", resource.name));
            }

            if !is_valid_name(&resource.name) {
                self.error(
                    &resource.name,
                    "name",
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            for dep in &resource.depends_on {
                if dep.is_empty() {
                    self.error(&resource.name, "depends_on", "Dependency name cannot be empty");
                }
            }

            self.check_fields(&resource.name, "", schema_for(resource.kind), &resource.properties);
            self.check_rules(resource);
        }
    }

    /// Checks presence, unknown keys and types of every field in `map`.
    fn check_fields(
        &mut self,
        resource: &str,
        prefix: &str,
        fields: &[PropertySchema],
        map: &BTreeMap<String, PropertyValue>,
    ) {
        for field in fields {
            if field.required && !map.contains_key(field.name) {
                self.error(
                    resource,
                    format!("{prefix}{}", field.name),
                    "Required property is missing",
                );
            }
        }

        for (key, value) in map {
            let path = format!("{prefix}{key}");
            match fields.iter().find(|f| f.name == key) {
                Some(field) => self.check_value(resource, &path, field.ty, value),
                None => self.error(resource, path, "Unknown property"),
            }
        }
    }

    fn check_value(&mut self, resource: &str, path: &str, ty: PropertyType, value: &PropertyValue) {
        match ty {
            PropertyType::String => {
                if value.as_str().is_none() {
                    self.type_mismatch(resource, path, "string", value);
                }
            }
            PropertyType::Integer { min, max } => match value.as_i64() {
                Some(i) if i < min || i > max => {
                    self.error(resource, path, format!("Value {i} is outside {min}..={max}"));
                }
                Some(_) => {}
                None => self.type_mismatch(resource, path, "integer", value),
            },
            PropertyType::Bool => {
                if value.as_bool().is_none() {
                    self.type_mismatch(resource, path, "bool", value);
                }
            }
            PropertyType::Cidr => match value.as_str() {
                Some(block) => {
                    if let Err(message) = parse_cidr(block) {
                        self.error(resource, path, format!("Invalid CIDR block: {message}"));
                    }
                }
                None => self.type_mismatch(resource, path, "CIDR string", value),
            },
            PropertyType::Enum(allowed) => match value.as_str() {
                Some(s) if !allowed.contains(&s) => {
                    self.error(
                        resource,
                        path,
                        format!("'{s}' is not one of: {}", allowed.join(", ")),
                    );
                }
                Some(_) => {}
                None => self.type_mismatch(resource, path, "string", value),
            },
            PropertyType::StringList => match value.as_list() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        if item.as_str().is_none() {
                            self.type_mismatch(resource, &format!("{path}[{i}]"), "string", item);
                        }
                    }
                }
                None => self.type_mismatch(resource, path, "list", value),
            },
            PropertyType::StringMap => match value.as_map() {
                Some(map) => {
                    for (key, item) in map {
                        if matches!(item, PropertyValue::List(_) | PropertyValue::Map(_)) {
                            self.type_mismatch(resource, &format!("{path}.{key}"), "scalar", item);
                        } else if let PropertyValue::Reference(r) = item {
                            self.check_reference_kind(resource, &format!("{path}.{key}"), None, &r.target);
                        }
                    }
                }
                None => self.type_mismatch(resource, path, "map", value),
            },
            PropertyType::Reference(kind) => match value.as_reference() {
                Some(r) => self.check_reference_kind(resource, path, kind, &r.target),
                None => self.type_mismatch(resource, path, "reference", value),
            },
            PropertyType::ReferenceList(kind) => match value.as_list() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        let item_path = format!("{path}[{i}]");
                        match item.as_reference() {
                            Some(r) => self.check_reference_kind(resource, &item_path, kind, &r.target),
                            None => self.type_mismatch(resource, &item_path, "reference", item),
                        }
                    }
                }
                None => self.type_mismatch(resource, path, "list", value),
            },
            PropertyType::Object(fields) => match value.as_map() {
                Some(map) => self.check_fields(resource, &format!("{path}."), fields, map),
                None => self.type_mismatch(resource, path, "object", value),
            },
            PropertyType::ObjectList(fields) => match value.as_list() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        let item_path = format!("{path}[{i}]");
                        match item.as_map() {
                            Some(map) => self.check_fields(resource, &format!("{item_path}."), fields, map),
                            None => self.type_mismatch(resource, &item_path, "object", item),
                        }
                    }
                }
                None => self.type_mismatch(resource, path, "list", value),
            },
        }
    }

    fn type_mismatch(&mut self, resource: &str, path: &str, expected: &str, value: &PropertyValue) {
        self.error(
            resource,
            path,
            format!("Expected {expected}, found {}", value.type_name()),
        );
    }

    /// Missing targets are reported by the graph builder, not here.
    fn check_reference_kind(
        &mut self,
        resource: &str,
        path: &str,
        expected: Option<ResourceKind>,
        target: &str,
    ) {
        let actual = self.kinds.get(target).copied();
        if let (Some(expected), Some(actual)) = (expected, actual)
            && expected != actual
        {
            self.error(
                resource,
                path,
                format!("Reference to '{target}' must point to a {expected}, found {actual}"),
            );
        }
    }

    fn check_rules(&mut self, resource: &ResourceDescriptor) {
        let name = resource.name.as_str();
        let props = &resource.properties;

        match resource.kind {
            ResourceKind::Network => self.check_network(name, props),
            ResourceKind::SecurityGroup => self.check_security_group(name, props),
            ResourceKind::Database => self.check_database(name, props),
            ResourceKind::Function => {
                if props.contains_key("security_groups") && !props.contains_key("network") {
                    self.error(
                        name,
                        "security_groups",
                        "Security groups require the function to be attached to a network",
                    );
                }
            }
            ResourceKind::Bucket => self.check_bucket(name, props),
            ResourceKind::Gateway => self.check_gateway(name, props),
            ResourceKind::Pipeline => {}
        }
    }

    fn check_network(&mut self, name: &str, props: &Properties) {
        if let Some(Ok((_, prefix))) = str_prop(props, "cidr").map(parse_cidr)
            && !(16..=28).contains(&prefix)
        {
            self.error(
                name,
                "cidr",
                format!("Prefix length /{prefix} must be between /16 and /28"),
            );
        }

        if props
            .get("availability_zones")
            .and_then(PropertyValue::as_list)
            .is_some_and(<[_]>::is_empty)
        {
            self.error(name, "availability_zones", "At least one availability zone is required");
        }

        let has_gateway = bool_prop(props, "internet_gateway");
        let mut seen = HashSet::new();
        for (i, subnet) in objects(props, "subnets").into_iter().enumerate() {
            if let Some(subnet_name) = str_prop(subnet, "name")
                && !seen.insert(subnet_name)
            {
                self.error(
                    name,
                    format!("subnets[{i}].name"),
                    format!("Duplicate subnet name: {subnet_name}"),
                );
            }

            if str_prop(subnet, "type") == Some("public") && !has_gateway {
                self.error(
                    name,
                    format!("subnets[{i}].type"),
                    "Public subnets require internet_gateway: true",
                );
            }
        }
    }

    fn check_security_group(&mut self, name: &str, props: &Properties) {
        for (i, rule) in objects(props, "ingress").into_iter().enumerate() {
            if let Some(peer) = str_prop(rule, "peer")
                && is_open_to_world(peer)
            {
                let port = rule.get("port").and_then(PropertyValue::as_i64).unwrap_or_default();
                self.exposure(
                    name,
                    format!("ingress[{i}].peer"),
                    format!("Port {port} is open to every address ({peer})"),
                );
            }
        }
    }

    fn check_database(&mut self, name: &str, props: &Properties) {
        if !bool_prop(props, "publicly_accessible") {
            return;
        }

        match str_prop(props, "subnet_type") {
            Some(subnet) if subnet != "public" => self.error(
                name,
                "publicly_accessible",
                format!("A publicly accessible database cannot be placed in {subnet} subnets"),
            ),
            _ => self.exposure(
                name,
                "publicly_accessible",
                "Database is reachable from the public internet",
            ),
        }
    }

    fn check_bucket(&mut self, name: &str, props: &Properties) {
        if let Some(bucket_name) = str_prop(props, "bucket_name")
            && !is_dns_compliant(bucket_name)
        {
            self.error(
                name,
                "bucket_name",
                format!(
                    "Bucket name '{bucket_name}' must be 3-63 lowercase letters, digits, hyphens or dots"
                ),
            );
        }

        if bool_prop(props, "public_read") {
            self.exposure(name, "public_read", "Bucket contents are publicly readable");
        }
    }

    fn check_gateway(&mut self, name: &str, props: &Properties) {
        let mut seen = HashSet::new();

        for (i, route) in objects(props, "routes").into_iter().enumerate() {
            let Some(path) = str_prop(route, "path") else {
                continue;
            };

            if !path.starts_with('/') {
                self.error(name, format!("routes[{i}].path"), format!("Route path '{path}' must start with '/'"));
            }

            let has_integration = route.contains_key("integration");
            let is_mock = bool_prop(route, "mock");
            if has_integration == is_mock {
                self.error(
                    name,
                    format!("routes[{i}]"),
                    "A route needs exactly one of integration or mock: true",
                );
            }

            let method = str_prop(route, "method").unwrap_or("ANY");
            if !seen.insert((method, path)) {
                self.error(
                    name,
                    format!("routes[{i}]"),
                    format!("Duplicate route {method} {path}"),
                );
            }
        }
    }
}

fn str_prop<'a>(props: &'a BTreeMap<String, PropertyValue>, key: &str) -> Option<&'a str> {
    props.get(key).and_then(PropertyValue::as_str)
}

fn bool_prop(props: &BTreeMap<String, PropertyValue>, key: &str) -> bool {
    props.get(key).and_then(PropertyValue::as_bool).unwrap_or(false)
}

fn objects<'a>(props: &'a BTreeMap<String, PropertyValue>, key: &str) -> Vec<&'a BTreeMap<String, PropertyValue>> {
    props
        .get(key)
        .and_then(PropertyValue::as_list)
        .map(|items| items.iter().filter_map(PropertyValue::as_map).collect())
        .unwrap_or_default()
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

fn is_dns_compliant(name: &str) -> bool {
    let len_ok = (3..=63).contains(&name.len());
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let edges_ok = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());

    len_ok && chars_ok && edges_ok && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn declaration(resources: &str) -> StackDeclaration {
        let yaml = format!("stack:\n  name: test\nresources:\n{resources}");
        ConfigParser::new().parse_yaml(&yaml, None).unwrap()
    }

    fn fields(violations: &[Violation]) -> Vec<String> {
        violations
            .iter()
            .map(|v| format!("{}.{}", v.resource, v.field))
            .collect()
    }

    const NETWORK: &str = r"
  - name: vpc
    kind: network
    properties:
      cidr: 10.0.0.0/16
      availability_zones: [eu-west-1a, eu-west-1b]
      internet_gateway: true
      subnets:
        - { name: public, type: public }
        - { name: isolated, type: isolated }
";

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("cvbuilder-vpc"));
        assert!(is_valid_name("db-1"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Vpc"));
        assert!(!is_valid_name("1-db"));
        assert!(!is_valid_name("my_db"));
        assert!(!is_valid_name("db-"));
        assert!(!is_valid_name("db--main"));
    }

    #[test]
    fn test_valid_network_passes() {
        let report = ResourceValidator::new()
            .validate_stack(&declaration(NETWORK))
            .unwrap();
        assert_eq!(report.warning_count(), 0);
    }

    #[test]
    fn test_empty_stack_warns() {
        let decl = ConfigParser::new()
            .parse_yaml("stack:\n  name: test\n", None)
            .unwrap();
        let report = ResourceValidator::new().validate_stack(&decl).unwrap();
        assert_eq!(report.warning_count(), 1);
    }

    #[test]
    fn test_collects_every_violation() {
        let resources = r"
  - name: vpc
    kind: network
    properties:
      cidr: 10.0.0.1/8
      availability_zones: []
      subnets:
        - { name: a, type: public }
        - { name: a, type: private }
  - name: Bad_Name
    kind: bucket
    properties:
      bucket_name: X
      colour: blue
";
        let err = ResourceValidator::new()
            .validate_stack(&declaration(resources))
            .unwrap_err();
        let StackformError::Validation(err) = err else {
            panic!("expected validation error");
        };

        let found = fields(&err.violations);
        assert!(found.contains(&String::from("vpc.cidr")));
        assert!(found.contains(&String::from("vpc.availability_zones")));
        assert!(found.contains(&String::from("vpc.subnets[0].type")));
        assert!(found.contains(&String::from("vpc.subnets[1].name")));
        assert!(found.contains(&String::from("Bad_Name.name")));
        assert!(found.contains(&String::from("Bad_Name.bucket_name")));
        assert!(found.contains(&String::from("Bad_Name.colour")));
    }

    #[test]
    fn test_missing_required_and_type_mismatch() {
        let resources = r"
  - name: fn
    kind: function
    properties:
      function_name: handler
      runtime: cobol
      memory_mb: 64
      timeout_secs: fast
";
        let report = ResourceValidator::new().check(&declaration(resources));
        let found = fields(&report.errors);

        assert!(found.contains(&String::from("fn.handler")));
        assert!(found.contains(&String::from("fn.code")));
        assert!(found.contains(&String::from("fn.runtime")));
        assert!(found.contains(&String::from("fn.memory_mb")));
        assert!(found.contains(&String::from("fn.timeout_secs")));
    }

    #[test]
    fn test_public_database_in_isolated_subnet() {
        let resources = format!(
            "{NETWORK}{}",
            r"
  - name: db
    kind: database
    properties:
      engine: postgres
      instance_class: t3.micro
      database_name: cvbuilder
      network: { ref: vpc }
      subnet_type: isolated
      publicly_accessible: true
"
        );
        let report = ResourceValidator::new().check(&declaration(&resources));
        assert_eq!(fields(&report.errors), vec!["db.publicly_accessible"]);
    }

    #[test]
    fn test_exposure_warns_by_default_and_fails_under_policy() {
        let resources = format!(
            "{NETWORK}{}",
            r"
  - name: db-sg
    kind: security_group
    properties:
      network: { ref: vpc }
      ingress:
        - { peer: 0.0.0.0/0, port: 5432 }
"
        );
        let mut decl = declaration(&resources);

        let report = ResourceValidator::new().validate_stack(&decl).unwrap();
        assert_eq!(fields(&report.warnings), vec!["db-sg.ingress[0].peer"]);

        decl.policy.deny_public_exposure = true;
        assert!(ResourceValidator::new().validate_stack(&decl).is_err());
    }

    #[test]
    fn test_reference_to_wrong_kind() {
        let resources = format!(
            "{NETWORK}{}",
            r"
  - name: sg
    kind: security_group
    properties:
      network: { ref: bucket }
  - name: bucket
    kind: bucket
    properties:
      bucket_name: some-bucket
  - name: orphan-sg
    kind: security_group
    properties:
      network: { ref: missing }
"
        );
        let report = ResourceValidator::new().check(&declaration(&resources));
        // Missing targets are left to the graph builder
        assert_eq!(fields(&report.errors), vec!["sg.network"]);
    }

    #[test]
    fn test_gateway_routes() {
        let resources = r"
  - name: api
    kind: gateway
    properties:
      api_name: CVBuilderAPI
      stage_name: alpha
      routes:
        - { path: /cvs, method: GET, mock: true }
        - { path: cvs, method: POST, mock: true }
        - { path: /cvs, method: GET, mock: true }
        - { path: /health }
";
        let report = ResourceValidator::new().check(&declaration(resources));
        assert_eq!(
            fields(&report.errors),
            vec!["api.routes[1].path", "api.routes[2]", "api.routes[3]"]
        );
    }

    #[test]
    fn test_function_security_groups_need_network() {
        let resources = r"
  - name: sg
    kind: security_group
    properties:
      network: { ref: vpc }
  - name: fn
    kind: function
    properties:
      function_name: handler
      runtime: java17
      handler: com.my.corp.Handler::handle
      code: ./assets/handler.jar
      security_groups: [{ ref: sg }]
";
        let report = ResourceValidator::new().check(&declaration(resources));
        assert_eq!(fields(&report.errors), vec!["fn.security_groups"]);
    }

    #[test]
    fn test_dns_compliant_bucket_names() {
        assert!(is_dns_compliant("cv-builder-bucket"));
        assert!(is_dns_compliant("logs.example.com"));
        assert!(!is_dns_compliant("ab"));
        assert!(!is_dns_compliant("-bucket"));
        assert!(!is_dns_compliant("Bucket"));
        assert!(!is_dns_compliant("a..b"));
    }
}
