//! Configuration file loading.

use crate::config::{validate_config, Config};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading configuration or building pools from it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    #[error("upstream '{upstream}': invalid server address '{address}'")]
    InvalidAddress { upstream: String, address: String },

    #[error("upstream '{upstream}': server {address} has weight {weight} (must be >= 1)")]
    InvalidWeight {
        upstream: String,
        address: SocketAddr,
        weight: i64,
    },

    #[error("upstream '{upstream}': duplicate server address {address}")]
    DuplicateAddress { upstream: String, address: SocketAddr },

    #[error("upstream '{upstream}': invalid health check: {reason}")]
    InvalidHealthCheck { upstream: String, reason: String },
}

/// Load configuration from a YAML file.
///
/// Reads the file, parses the YAML and validates the result, including
/// building every upstream pool definition once.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config).map_err(ConfigError::ValidationError)?;
    Ok(config)
}
