//! Prior hyper-parameters used by the closed-form M-steps.

use serde::{Deserialize, Serialize};

/// Shape/rate pair for a Gamma prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaPrior {
    pub shape: f64,
    pub rate: f64,
}

impl Default for GammaPrior {
    fn default() -> Self {
        Self {
            shape: 1.1,
            rate: 0.1,
        }
    }
}

/// Normal-inverse-Wishart style prior on Gaussian emission parameters.
///
/// The M-step adds these as pseudo-observations to the weighted statistics
/// and takes the posterior mode:
///
/// ```text
/// m = (Σ w y + κ μ₀) / (W + κ)
/// Σ = (Σ w (y − m)(y − m)ᵀ + κ (m − μ₀)(m − μ₀)ᵀ + ψ I) / (W + ν) + r I
/// ```
///
/// With `ψ > 0` every re-estimated covariance is positive definite, even for
/// a state that owns a single observation. The same pseudo-observations
/// regularize autoregressive and factorial emission fits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianPriors {
    /// `κ`: pseudo-observations at the prior mean. Also the ridge precision on
    /// regression coefficients.
    pub mean_concentration: f64,

    /// `μ₀`, broadcast to every dimension.
    pub prior_mean: f64,

    /// `ψ`: diagonal of the prior scatter matrix.
    pub covariance_scale: f64,

    /// `ν`: pseudo-counts in the covariance denominator. The NIW mode
    /// corresponds to `ν₀ + N + 2`.
    pub covariance_pseudo_count: f64,

    /// `r`: added to the diagonal after the update. Zero disables it.
    pub covariance_regularization: f64,
}

impl Default for GaussianPriors {
    fn default() -> Self {
        Self {
            mean_concentration: 1e-4,
            prior_mean: 0.0,
            covariance_scale: 1e-4,
            covariance_pseudo_count: 1.0,
            covariance_regularization: 0.0,
        }
    }
}

impl GaussianPriors {
    /// No pseudo-observations: the update is the weighted maximum-likelihood
    /// fit and can produce singular covariances.
    pub fn flat() -> Self {
        Self {
            mean_concentration: 0.0,
            prior_mean: 0.0,
            covariance_scale: 0.0,
            covariance_pseudo_count: 0.0,
            covariance_regularization: 0.0,
        }
    }
}

/// All prior hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Priors {
    /// Symmetric Dirichlet concentration on the initial-state distribution.
    pub initial_concentration: f64,

    /// Symmetric Dirichlet concentration on each transition row.
    pub transition_concentration: f64,

    pub gaussian: GaussianPriors,

    /// Gamma prior on each Poisson rate.
    pub poisson: GammaPrior,

    /// Symmetric Dirichlet concentration on categorical emission rows.
    pub categorical_concentration: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            initial_concentration: 1.1,
            transition_concentration: 1.1,
            gaussian: GaussianPriors::default(),
            poisson: GammaPrior::default(),
            categorical_concentration: 1.1,
        }
    }
}
