//! Loading configuration files.
//!
//! Files are TOML or JSON, chosen by extension. Missing files resolve to the
//! built-in defaults; present files are parsed and validated semantically.

use crate::fit::FitConfig;
use crate::priors::Priors;
use crate::resolve::{resolve_config, ConfigSource};
use crate::validate::{validate_config, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid JSON in config file {path}: {source}")]
    JsonError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid TOML in config file {path}: {source}")]
    TomlError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Semantic validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for ssm_common::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::IoError { source, .. } => ssm_common::Error::Io(source),
            ConfigError::JsonError { source, .. } => ssm_common::Error::Json(source),
            ConfigError::TomlError { source, .. } => ssm_common::Error::Toml(source),
            ConfigError::ValidationError(v) => v.into(),
            other => ssm_common::Error::InvalidConfigFile(other.to_string()),
        }
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsmConfig {
    pub schema_version: String,
    pub fit: FitConfig,
    pub priors: Priors,
}

impl Default for SsmConfig {
    fn default() -> Self {
        Self {
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            fit: FitConfig::default(),
            priors: Priors::default(),
        }
    }
}

impl SsmConfig {
    /// Parse and validate a file, picking the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config: SsmConfig = if is_json {
            serde_json::from_str(&content).map_err(|e| ConfigError::JsonError {
                path: path.to_path_buf(),
                source: e,
            })?
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::TomlError {
                path: path.to_path_buf(),
                source: e,
            })?
        };

        validate_config(&config)?;
        Ok(config)
    }
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file path (highest priority).
    pub config_path: Option<PathBuf>,
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: SsmConfig,
    /// Path the configuration was read from (None if using defaults).
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Load configuration with the standard resolution order.
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    if let Some(path) = &options.config_path {
        if !path.exists() {
            return Err(ConfigError::NotFound { path: path.clone() });
        }
    }

    let (path, source) = resolve_config(options.config_path.as_deref());
    let config = match &path {
        Some(p) => SsmConfig::from_file(p)?,
        None => SsmConfig::default(),
    };

    Ok(ResolvedConfig {
        config,
        path,
        source,
    })
}
