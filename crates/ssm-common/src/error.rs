//! Error types for state-space inference and fitting.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - Remediation suggestions for humans
//!
//! Errors serialize to structured JSON through [`StructuredError`]:
//! ```json
//! {
//!   "code": 31,
//!   "category": "numerical",
//!   "message": "eliminated precision block not positive definite at step 4",
//!   "recoverable": true,
//!   "context": { "step": 4 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for state-space operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Shape, value and schema errors detected before any computation.
    Config,
    /// Factorization failures and non-finite quantities.
    Numerical,
    /// Capabilities a model or collaborator does not provide.
    Unsupported,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Numerical => write!(f, "numerical"),
            ErrorCategory::Unsupported => write!(f, "unsupported"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for inference and fitting.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    #[error("parameter schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("invalid configuration file: {0}")]
    InvalidConfigFile(String),

    // Numerical errors (30-39)
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("{what} not positive definite{}", step_suffix(.step))]
    NotPositiveDefinite { what: String, step: Option<usize> },

    #[error("non-finite marginal log probability {value} at iteration {iteration}")]
    NonFiniteBound { iteration: usize, value: f64 },

    #[error("sequence {sequence} has zero probability under the model")]
    ZeroProbabilitySequence { sequence: usize },

    #[error("marginal log probability decreased at iteration {iteration}: {previous} -> {current}")]
    BoundDecreased {
        iteration: usize,
        previous: f64,
        current: f64,
    },

    #[error("non-finite value in {0}")]
    NonFiniteInput(String),

    // Unsupported operations (40-49)
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("missing collaborator: {0}")]
    MissingCollaborator(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn step_suffix<S: std::borrow::Borrow<Option<usize>>>(step: S) -> String {
    match step.borrow() {
        Some(s) => format!(" at step {s}"),
        None => String::new(),
    }
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 30-39: Numerical errors
    /// - 40-49: Unsupported operations
    /// - 60-69: I/O and file-format errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::DimensionMismatch { .. } => 11,
            Error::SchemaMismatch(_) => 12,
            Error::InvalidConfigFile(_) => 13,
            Error::Numerical(_) => 30,
            Error::NotPositiveDefinite { .. } => 31,
            Error::NonFiniteBound { .. } => 32,
            Error::ZeroProbabilitySequence { .. } => 33,
            Error::BoundDecreased { .. } => 34,
            Error::NonFiniteInput(_) => 35,
            Error::Unsupported(_) => 40,
            Error::MissingCollaborator(_) => 41,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::Toml(_) => 62,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::DimensionMismatch { .. }
            | Error::SchemaMismatch(_)
            | Error::InvalidConfigFile(_) => ErrorCategory::Config,

            Error::Numerical(_)
            | Error::NotPositiveDefinite { .. }
            | Error::NonFiniteBound { .. }
            | Error::ZeroProbabilitySequence { .. }
            | Error::BoundDecreased { .. }
            | Error::NonFiniteInput(_) => ErrorCategory::Numerical,

            Error::Unsupported(_) | Error::MissingCollaborator(_) => ErrorCategory::Unsupported,

            Error::Io(_) | Error::Json(_) | Error::Toml(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable.
    ///
    /// Recoverable errors may be resolved by changing inputs, initial
    /// parameters or configuration and retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::DimensionMismatch { .. } => true,
            Error::SchemaMismatch(_) => false, // Record was written by another layout
            Error::InvalidConfigFile(_) => true,

            Error::Numerical(_) => true,
            Error::NotPositiveDefinite { .. } => true,
            Error::NonFiniteBound { .. } => true,
            Error::ZeroProbabilitySequence { .. } => true,
            Error::BoundDecreased { .. } => true,
            Error::NonFiniteInput(_) => true,

            Error::Unsupported(_) => false,
            Error::MissingCollaborator(_) => true,

            Error::Io(_) => true,
            Error::Json(_) => true,
            Error::Toml(_) => true,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => "Check the fit configuration and model construction arguments.",
            Error::DimensionMismatch { .. } => {
                "Check that every sequence has the same length and that matrix shapes agree with the model dimensions."
            }
            Error::SchemaMismatch(_) => {
                "The flat parameter vector was produced for a different parameter layout. Re-flatten from the current record."
            }
            Error::InvalidConfigFile(_) => "Fix the syntax of the configuration file or remove it to use defaults.",

            Error::Numerical(_) => "Inspect the inputs for extreme values; rescaling observations often helps.",
            Error::NotPositiveDefinite { .. } => {
                "A covariance or precision block is singular. Increase noise covariances or enable the covariance regularizer in the priors."
            }
            Error::NonFiniteBound { .. } => {
                "The fit diverged. Re-initialize parameters or strengthen the priors."
            }
            Error::ZeroProbabilitySequence { .. } => {
                "No state path explains this sequence. Check for impossible transitions or emissions with zero likelihood."
            }
            Error::BoundDecreased { .. } => {
                "EM is monotone in exact arithmetic. Disable strict monotonic mode or check a custom M-step."
            }
            Error::NonFiniteInput(_) => "Remove NaN or infinite values from the observations and parameters.",

            Error::Unsupported(_) => "This model family does not provide the requested capability.",
            Error::MissingCollaborator(_) => {
                "Supply the required collaborator (for example a gradient optimizer) before fitting."
            }

            Error::Io(_) => "Check that the file exists and is readable.",
            Error::Json(_) => "Invalid JSON. Check syntax or restore from backup.",
            Error::Toml(_) => "Invalid TOML. Check the line and column in the message.",
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::DimensionMismatch { .. } => "Dimension Mismatch",
            Error::SchemaMismatch(_) => "Parameter Schema Mismatch",
            Error::InvalidConfigFile(_) => "Invalid Configuration File",

            Error::Numerical(_) => "Numerical Error",
            Error::NotPositiveDefinite { .. } => "Matrix Not Positive Definite",
            Error::NonFiniteBound { .. } => "Non-finite Log Probability",
            Error::ZeroProbabilitySequence { .. } => "Zero-probability Sequence",
            Error::BoundDecreased { .. } => "Log Probability Decreased",
            Error::NonFiniteInput(_) => "Non-finite Input",

            Error::Unsupported(_) => "Unsupported Operation",
            Error::MissingCollaborator(_) => "Missing Collaborator",

            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
            Error::Toml(_) => "TOML Parse Error",
        }
    }

    /// Wraps `err` with the index of the sequence it came from, keeping the
    /// variant when it already carries positional context.
    pub fn in_sequence(self, sequence: usize) -> Self {
        match self {
            Error::NotPositiveDefinite { what, step } => Error::NotPositiveDefinite {
                what: format!("sequence {sequence}: {what}"),
                step,
            },
            Error::Numerical(msg) => Error::Numerical(format!("sequence {sequence}: {msg}")),
            Error::NonFiniteInput(msg) => {
                Error::NonFiniteInput(format!("sequence {sequence}: {msg}"))
            }
            Error::DimensionMismatch {
                what,
                expected,
                got,
            } => Error::DimensionMismatch {
                what: format!("sequence {sequence}: {what}"),
                expected,
                got,
            },
            Error::Config(msg) => Error::Config(format!("sequence {sequence}: {msg}")),
            Error::ZeroProbabilitySequence { .. } => Error::ZeroProbabilitySequence { sequence },
            other => other,
        }
    }
}

/// Structured error record for JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Additional structured context (e.g., step, iteration).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::NotPositiveDefinite {
                step: Some(step), ..
            } => {
                context.insert("step".to_string(), serde_json::json!(step));
            }
            Error::NonFiniteBound { iteration, .. } => {
                context.insert("iteration".to_string(), serde_json::json!(iteration));
            }
            Error::ZeroProbabilitySequence { sequence } => {
                context.insert("sequence".to_string(), serde_json::json!(sequence));
            }
            Error::BoundDecreased {
                iteration,
                previous,
                current,
            } => {
                context.insert("iteration".to_string(), serde_json::json!(iteration));
                context.insert("previous".to_string(), serde_json::json!(previous));
                context.insert("current".to_string(), serde_json::json!(current));
            }
            Error::DimensionMismatch { expected, got, .. } => {
                context.insert("expected".to_string(), serde_json::json!(expected));
                context.insert("got".to_string(), serde_json::json!(got));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            context,
        }
    }
}

impl StructuredError {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}
