//! Declaration parser for loading stack files.
//!
//! This module handles loading declarations from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StackformError};
use std::path::Path;
use tracing::{debug, info};

use super::spec::StackDeclaration;

/// Environment variable holding the provisioning API token.
pub const PROVIDER_TOKEN_VAR: &str = "STACKFORM_PROVIDER_TOKEN";

/// Parser for loading stack declarations.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new declaration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a declaration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackDeclaration> {
        let path = path.as_ref();
        info!("Loading declaration from: {}", path.display());

        if !path.exists() {
            return Err(StackformError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackformError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a declaration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackDeclaration> {
        debug!("Parsing YAML declaration");

        let declaration: StackDeclaration = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackformError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        declaration.provider.check()?;

        debug!(
            "Parsed stack '{}' with {} resource(s)",
            declaration.stack.name,
            declaration.resources.len()
        );
        Ok(declaration)
    }

    /// Loads a declaration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `STACKFORM_<SECTION>_<KEY>` (e.g., `STACKFORM_STACK_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackDeclaration> {
        let mut declaration = self.load_file(path)?;

        Self::apply_env_overrides(&mut declaration);
        declaration.provider.check()?;

        Ok(declaration)
    }

    /// Applies environment variable overrides to the declaration.
    fn apply_env_overrides(declaration: &mut StackDeclaration) {
        if let Ok(name) = std::env::var("STACKFORM_STACK_NAME") {
            debug!("Overriding stack.name from environment");
            declaration.stack.name = name;
        }

        if let Ok(env) = std::env::var("STACKFORM_STACK_ENVIRONMENT") {
            debug!("Overriding stack.environment from environment");
            declaration.stack.environment = env;
        }

        if let Ok(region) = std::env::var("STACKFORM_STACK_REGION") {
            debug!("Overriding stack.region from environment");
            declaration.stack.region = Some(region);
        }

        if let Ok(endpoint) = std::env::var("STACKFORM_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            declaration.provider.endpoint = endpoint;
        }

        if let Ok(path) = std::env::var("STACKFORM_STATE_PATH") {
            debug!("Overriding state.path from environment");
            declaration.state.path = Some(path);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackformError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provisioning API token from the environment (optional).
    #[must_use]
    pub fn get_provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR).ok().filter(|t| !t.is_empty())
    }

    /// Gets the provisioning API token, failing when it is not set.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn require_provider_token() -> Result<String> {
        Self::get_provider_token().ok_or_else(|| {
            StackformError::Config(ConfigError::MissingEnvVar {
                name: String::from(PROVIDER_TOKEN_VAR),
            })
        })
    }
}

/// Default declaration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackform.yaml",
    "stackform.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the declaration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no declaration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found declaration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackformError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use crate::model::ResourceKind;

    #[test]
    fn test_parse_minimal_declaration() {
        let yaml = r"
stack:
  name: test-stack
";
        let parser = ConfigParser::new();
        let declaration = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(declaration.stack.name, "test-stack");
        assert_eq!(declaration.stack.environment, "dev");
        assert_eq!(declaration.state.backend, StateBackend::Local);
        assert_eq!(declaration.provider.parallelism, 4);
        assert!(declaration.resources.is_empty());
    }

    #[test]
    fn test_parse_full_declaration() {
        let yaml = r"
stack:
  name: cvbuilder
  environment: prod
  region: eu-west-1

state:
  backend: memory

provider:
  endpoint: https://provision.example.com
  max_attempts: 3
  parallelism: 2

policy:
  deny_public_exposure: true

resources:
  - name: cvbuilder-vpc
    kind: network
    properties:
      cidr: 10.0.0.0/16
      availability_zones: [eu-west-1a, eu-west-1b]
      subnets:
        - { name: public, type: public }
  - name: cv-bucket
    kind: bucket
    depends_on: [cvbuilder-vpc]
    properties:
      bucket_name: cv-builder-bucket
";
        let parser = ConfigParser::new();
        let declaration = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(declaration.qualified_name(), "cvbuilder-prod");
        assert_eq!(declaration.state.backend, StateBackend::Memory);
        assert_eq!(declaration.provider.max_attempts, 3);
        assert!(declaration.policy.deny_public_exposure);
        assert_eq!(declaration.resource_names(), vec!["cvbuilder-vpc", "cv-bucket"]);
        assert_eq!(declaration.resources[0].kind, ResourceKind::Network);
        assert_eq!(declaration.resources[1].depends_on, vec!["cvbuilder-vpc"]);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let yaml = r"
stack:
  name: test-stack
resources:
  - name: q
    kind: queue
";
        let result = ConfigParser::new().parse_yaml(yaml, None);
        assert!(matches!(
            result,
            Err(StackformError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_provider() {
        let yaml = r"
stack:
  name: test-stack
provider:
  parallelism: 0
";
        let result = ConfigParser::new().parse_yaml(yaml, None);
        assert!(matches!(
            result,
            Err(StackformError::Config(ConfigError::InvalidProvider { .. }))
        ));
    }

    #[test]
    fn test_find_config_file_walks_parents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stackform.yaml"), "stack: { name: x }").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stackform.yaml"));
    }

    #[test]
    fn test_starter_template_plans_cleanly() {
        let template = include_str!("../../templates/stack.yaml");
        let declaration = ConfigParser::new().parse_yaml(template, None).unwrap();

        let report = crate::model::ResourceValidator::new()
            .validate_stack(&declaration)
            .unwrap();
        assert!(report.warnings.is_empty());

        let graph = crate::graph::GraphBuilder::new()
            .build(&declaration.resources)
            .unwrap();
        assert_eq!(
            graph.names_in_order(),
            vec!["vpc", "db-sg", "db", "cv-handler", "api", "assets", "build"]
        );

        let vpc = declaration.resource("vpc").unwrap();
        assert_eq!(
            vpc.properties["availability_zones"],
            crate::model::PropertyValue::from(vec!["eu-west-1a", "eu-west-1b"])
        );
    }
}
