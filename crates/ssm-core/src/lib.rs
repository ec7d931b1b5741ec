//! State-space model core library.
//!
//! This library provides exact inference and EM fitting for:
//! - Hidden Markov models with Gaussian, Poisson, categorical and
//!   autoregressive Gaussian emissions
//! - Factorial HMMs over the product of several independent chains
//! - Linear dynamical systems with Gaussian noise
//!
//! Inference is exact: log-space forward-backward for discrete chains and
//! block-tridiagonal elimination for linear-Gaussian chains. Fitting goes
//! through [`fit::EmDriver`], which works against any [`models::StateSpaceModel`].

pub mod data;
pub mod fit;
pub mod inference;
pub mod logging;
pub mod models;

pub use data::{Dataset, Sequence};
pub use fit::{fit_em, EmDriver, EmFit, EmStatus};
pub use models::{GaussianLds, Hmm, StateSpaceModel};
pub use ssm_common::{Error, Result};
