//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::schema::{ClusterConfig, RoutingConfig};
use crate::config::validation::{validate_config, validate_routing, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load and validate a node configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ClusterConfig, ConfigError> {
    let config: ClusterConfig = read_toml(path)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate a routing table from a TOML file.
pub fn load_routing(path: &Path) -> Result<RoutingConfig, ConfigError> {
    let routing: RoutingConfig = read_toml(path)?;
    validate_routing(&routing).map_err(ConfigError::Validation)?;
    Ok(routing)
}
