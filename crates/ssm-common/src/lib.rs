//! Shared types for the state-space workspace.
//!
//! This crate provides the error taxonomy used by every other crate:
//! - Stable error codes for machine parsing
//! - Category classification
//! - Recoverability and remediation hints

pub mod error;

pub use error::{Error, ErrorCategory, Result, StructuredError};
