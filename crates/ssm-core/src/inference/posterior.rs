//! Posterior containers produced by one E-step and consumed by one M-step.
//!
//! Both containers are immutable after construction. Shapes always match the
//! sequence they were computed from: `T` rows of states or means, `T − 1`
//! transition or cross-moment slices.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use ssm_math::gaussian::LN_2PI;

use super::block_tridiag::GaussianChainNaturalParams;

/// Shared view of a per-sequence posterior.
pub trait Posterior {
    /// log p(y) for the sequence under the parameters the posterior was
    /// computed with.
    fn marginal_log_likelihood(&self) -> f64;

    fn num_timesteps(&self) -> usize;
}

/// Posterior over a discrete chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmmPosterior {
    pub(crate) marginal_log_likelihood: f64,
    /// `T × K`, each row sums to 1.
    pub(crate) expected_states: DMatrix<f64>,
    /// `T − 1` slices of `K × K`, each slice sums to 1.
    pub(crate) expected_transitions: Vec<DMatrix<f64>>,
}

impl HmmPosterior {
    pub fn num_states(&self) -> usize {
        self.expected_states.ncols()
    }

    /// `P(z_t = k | y)` as a `T × K` matrix.
    pub fn expected_states(&self) -> &DMatrix<f64> {
        &self.expected_states
    }

    /// `P(z_t = i, z_{t+1} = j | y)` for `t = 0..T−1`.
    pub fn expected_transitions(&self) -> &[DMatrix<f64>] {
        &self.expected_transitions
    }

    /// Posterior over the first state.
    pub fn initial_state_probs(&self) -> DVector<f64> {
        self.expected_states.row(0).transpose()
    }

    /// Expected transition counts summed over time.
    pub fn expected_transition_counts(&self) -> DMatrix<f64> {
        let k = self.num_states();
        self.expected_transitions
            .iter()
            .fold(DMatrix::zeros(k, k), |acc, xi| acc + xi)
    }
}

impl Posterior for HmmPosterior {
    fn marginal_log_likelihood(&self) -> f64 {
        self.marginal_log_likelihood
    }

    fn num_timesteps(&self) -> usize {
        self.expected_states.nrows()
    }
}

/// Posterior over a linear-Gaussian chain.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianChainPosterior {
    pub(crate) log_normalizer: f64,
    pub(crate) means: Vec<DVector<f64>>,
    pub(crate) covariances: Vec<DMatrix<f64>>,
    /// `E[x_{t+1} x_tᵀ]`
    pub(crate) cross_moments: Vec<DMatrix<f64>>,
    pub(crate) natural_params: GaussianChainNaturalParams,
}

impl GaussianChainPosterior {
    pub fn state_dim(&self) -> usize {
        self.means[0].len()
    }

    /// Log normalizer of the information-form potential.
    pub fn log_normalizer(&self) -> f64 {
        self.log_normalizer
    }

    /// Posterior means as `T` vectors.
    pub fn means(&self) -> &[DVector<f64>] {
        &self.means
    }

    /// Marginal covariances `Cov[x_t | y]`.
    pub fn covariances(&self) -> &[DMatrix<f64>] {
        &self.covariances
    }

    /// `E[x_t x_tᵀ | y]` at step `t`.
    pub fn second_moment(&self, t: usize) -> DMatrix<f64> {
        &self.covariances[t] + &self.means[t] * self.means[t].transpose()
    }

    /// `E[x_t x_tᵀ | y]` for every step.
    pub fn second_moments(&self) -> Vec<DMatrix<f64>> {
        (0..self.means.len()).map(|t| self.second_moment(t)).collect()
    }

    /// `E[x_{t+1} x_tᵀ | y]` for `t = 0..T−1`.
    pub fn cross_moments(&self) -> &[DMatrix<f64>] {
        &self.cross_moments
    }

    pub fn natural_params(&self) -> &GaussianChainNaturalParams {
        &self.natural_params
    }

    /// Log density of a full trajectory: `−½ xᵀJx + hᵀx − log Z`.
    pub fn log_prob(&self, states: &[DVector<f64>]) -> Result<f64> {
        let np = &self.natural_params;
        if states.len() != np.num_timesteps() {
            return Err(Error::DimensionMismatch {
                what: "trajectory length".to_string(),
                expected: np.num_timesteps(),
                got: states.len(),
            });
        }
        let d = np.state_dim();
        let mut quad = 0.0;
        let mut linear = 0.0;
        for (t, x) in states.iter().enumerate() {
            if x.len() != d {
                return Err(Error::DimensionMismatch {
                    what: format!("state at step {t}"),
                    expected: d,
                    got: x.len(),
                });
            }
            quad += x.dot(&(&np.j_diag[t] * x));
            linear += np.h[t].dot(x);
            if t + 1 < states.len() {
                quad += 2.0 * states[t + 1].dot(&(&np.j_lower[t] * x));
            }
        }
        Ok(-0.5 * quad + linear - self.log_normalizer)
    }

    /// Entropy of the posterior, `½ log|2πe Σ_joint|`, computed from the
    /// identity `H = log Z − hᵀμ + ½ E[xᵀJx]`.
    pub fn entropy(&self) -> f64 {
        let np = &self.natural_params;
        let mut expected_quad = 0.0;
        let mut linear = 0.0;
        for t in 0..self.means.len() {
            expected_quad += (&np.j_diag[t] * self.second_moment(t)).trace();
            linear += np.h[t].dot(&self.means[t]);
            if t + 1 < self.means.len() {
                expected_quad += 2.0 * (&np.j_lower[t] * self.cross_moments[t].transpose()).trace();
            }
        }
        self.log_normalizer - linear + 0.5 * expected_quad
    }
}

impl Posterior for GaussianChainPosterior {
    fn marginal_log_likelihood(&self) -> f64 {
        self.log_normalizer
    }

    fn num_timesteps(&self) -> usize {
        self.means.len()
    }
}

/// `(D/2) log 2π` per block; shared with the elimination pass.
pub(crate) fn half_log_2pi(dim: usize) -> f64 {
    0.5 * dim as f64 * LN_2PI
}
