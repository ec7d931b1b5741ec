//! Dirichlet priors for discrete distributions.
//!
//! Initial-state, transition-row and categorical-emission updates all share
//! the same conjugate structure:
//! - Prior: `p ~ Dirichlet(α_1..α_K)`
//! - Expected counts: `s = (s_1..s_K)`
//! - Posterior: `p | s ~ Dirichlet(α_i + s_i)`
//!
//! The M-step uses the posterior mode `(α_i + s_i − 1) / (Σ_j (α_j + s_j) − K)`.

/// Parameters for a Dirichlet distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct DirichletParams {
    /// Concentration parameters (all must be > 0)
    pub alpha: Vec<f64>,
}

impl DirichletParams {
    /// Create new Dirichlet parameters with validation.
    ///
    /// Returns None if any parameter is non-positive, NaN, or if the vector is empty.
    pub fn new(alpha: Vec<f64>) -> Option<Self> {
        if alpha.is_empty() {
            return None;
        }
        if alpha.iter().any(|a| a.is_nan() || *a <= 0.0) {
            return None;
        }
        Some(Self { alpha })
    }

    /// Create a symmetric Dirichlet with all α_i = value.
    pub fn symmetric(k: usize, value: f64) -> Option<Self> {
        if k == 0 || value.is_nan() || value <= 0.0 {
            return None;
        }
        Some(Self {
            alpha: vec![value; k],
        })
    }

    /// Number of categories K.
    pub fn k(&self) -> usize {
        self.alpha.len()
    }

    /// Sum of all concentration parameters: α_0 = Σ_i α_i.
    pub fn concentration(&self) -> f64 {
        self.alpha.iter().sum()
    }

    /// Mean of the Dirichlet distribution: E[p_i] = α_i / α_0.
    pub fn mean(&self) -> Vec<f64> {
        let sum = self.concentration();
        self.alpha.iter().map(|a| a / sum).collect()
    }

    /// Mode of the distribution.
    ///
    /// Defined when every α_i > 1. Otherwise falls back to the mean, which is
    /// what the M-step wants for categories with no mass.
    pub fn mode(&self) -> Vec<f64> {
        let k = self.k() as f64;
        if self.alpha.iter().all(|a| *a > 1.0) {
            let denom = self.concentration() - k;
            self.alpha.iter().map(|a| (a - 1.0) / denom).collect()
        } else {
            self.mean()
        }
    }

}

/// Posterior parameters after observing (possibly fractional) counts.
///
/// Returns None if the lengths differ or any count is negative or NaN.
pub fn posterior_params(prior: &DirichletParams, counts: &[f64]) -> Option<DirichletParams> {
    if counts.len() != prior.k() {
        return None;
    }
    if counts.iter().any(|c| c.is_nan() || *c < 0.0) {
        return None;
    }
    let alpha = prior
        .alpha
        .iter()
        .zip(counts)
        .map(|(a, n)| a + n)
        .collect();
    Some(DirichletParams { alpha })
}

/// Posterior mode under a symmetric prior, the usual M-step for a
/// probability vector.
pub fn posterior_mode(concentration: f64, counts: &[f64]) -> Option<Vec<f64>> {
    let prior = DirichletParams::symmetric(counts.len(), concentration)?;
    Some(posterior_params(&prior, counts)?.mode())
}
