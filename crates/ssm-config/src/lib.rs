//! Configuration loading and validation for state-space fitting.
//!
//! This crate provides:
//! - Typed structs for the fit loop (`FitConfig`) and prior hyper-parameters (`Priors`)
//! - Config resolution (CLI → env → XDG → /etc → defaults)
//! - JSON and TOML loading
//! - Semantic validation with stable error codes

pub mod fit;
pub mod load;
pub mod priors;
pub mod resolve;
pub mod validate;

pub use fit::{EmissionUpdate, FitConfig, Verbosity};
pub use load::{load_config, ConfigError, ConfigOptions, ResolvedConfig, SsmConfig};
pub use priors::{GammaPrior, GaussianPriors, Priors};
pub use resolve::{resolve_config, ConfigSource};
pub use validate::{ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
