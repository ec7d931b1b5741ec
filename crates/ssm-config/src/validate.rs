//! Configuration validation errors and semantic validation.

use crate::fit::FitConfig;
use crate::load::SsmConfig;
use crate::priors::Priors;
use thiserror::Error;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::SemanticError(_) => 14,
            ValidationError::InvalidValue { .. } => 15,
            ValidationError::VersionMismatch { .. } => 16,
        }
    }
}

impl From<ValidationError> for ssm_common::Error {
    fn from(err: ValidationError) -> Self {
        ssm_common::Error::Config(err.to_string())
    }
}

/// Validate a whole configuration file.
pub fn validate_config(config: &SsmConfig) -> ValidationResult<()> {
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }
    validate_fit(&config.fit)?;
    validate_priors(&config.priors)
}

/// Validate EM loop settings.
pub fn validate_fit(fit: &FitConfig) -> ValidationResult<()> {
    if !fit.tol.is_finite() || fit.tol < 0.0 {
        return Err(ValidationError::InvalidValue {
            field: "fit.tol".to_string(),
            message: format!("Must be finite and non-negative, got {}", fit.tol),
        });
    }
    if fit.optimizer_max_iters == 0 {
        return Err(ValidationError::InvalidValue {
            field: "fit.optimizer_max_iters".to_string(),
            message: "Must be at least 1".to_string(),
        });
    }
    Ok(())
}

/// Validate prior hyper-parameters.
pub fn validate_priors(priors: &Priors) -> ValidationResult<()> {
    validate_concentration("priors.initial_concentration", priors.initial_concentration)?;
    validate_concentration(
        "priors.transition_concentration",
        priors.transition_concentration,
    )?;
    validate_concentration(
        "priors.categorical_concentration",
        priors.categorical_concentration,
    )?;
    validate_positive("priors.poisson.shape", priors.poisson.shape)?;
    validate_positive("priors.poisson.rate", priors.poisson.rate)?;

    let g = &priors.gaussian;
    validate_non_negative("priors.gaussian.mean_concentration", g.mean_concentration)?;
    if !g.prior_mean.is_finite() {
        return Err(ValidationError::InvalidValue {
            field: "priors.gaussian.prior_mean".to_string(),
            message: format!("Must be finite, got {}", g.prior_mean),
        });
    }
    validate_non_negative("priors.gaussian.covariance_scale", g.covariance_scale)?;
    validate_non_negative(
        "priors.gaussian.covariance_pseudo_count",
        g.covariance_pseudo_count,
    )?;
    validate_non_negative(
        "priors.gaussian.covariance_regularization",
        g.covariance_regularization,
    )
}

fn validate_non_negative(field: &str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("Must be finite and non-negative, got {}", value),
        });
    }
    Ok(())
}

/// Concentrations at or below 1 make the Dirichlet mode undefined for empty
/// categories.
fn validate_concentration(field: &str, value: f64) -> ValidationResult<()> {
    validate_positive(field, value)?;
    if value < 1.0 {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("Must be >= 1 for a posterior-mode update, got {}", value),
        });
    }
    Ok(())
}

fn validate_positive(field: &str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("Must be positive, got {}", value),
        });
    }
    Ok(())
}
