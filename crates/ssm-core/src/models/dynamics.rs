//! Latent transition functions for linear-Gaussian models.
//!
//! A [`DynamicsFn`] maps `(step, covariate)` to the affine-Gaussian transition
//! `x_t | x_{t−1} ~ N(A x_{t−1} + b, Q)` that produces step `t`. It is
//! evaluated once for every `t = 1..T−1`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use std::fmt;

/// `(A, b, Q)` for a single transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub matrix: DMatrix<f64>,
    pub bias: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl Transition {
    pub fn new(matrix: DMatrix<f64>, bias: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        Self {
            matrix,
            bias,
            covariance,
        }
    }

    pub fn state_dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// Checks every piece is `dim`-shaped and finite.
    pub fn validate(&self, dim: usize, step: usize) -> Result<()> {
        let shapes = [
            ("dynamics matrix A", self.matrix.nrows(), self.matrix.ncols()),
            ("dynamics covariance Q", self.covariance.nrows(), self.covariance.ncols()),
            ("dynamics bias b", self.bias.len(), dim),
        ];
        for (what, rows, cols) in shapes {
            if rows != dim || cols != dim {
                return Err(Error::DimensionMismatch {
                    what: format!("{what} at step {step}"),
                    expected: dim,
                    got: if rows != dim { rows } else { cols },
                });
            }
        }
        let finite = self.matrix.iter().all(|v| v.is_finite())
            && self.bias.iter().all(|v| v.is_finite())
            && self.covariance.iter().all(|v| v.is_finite());
        if !finite {
            return Err(Error::NonFiniteInput(format!("transition at step {step}")));
        }
        Ok(())
    }
}

/// Per-step transition function with a fixed signature.
pub trait DynamicsFn: Send + Sync {
    /// Transition producing step `step` (≥ 1), given that step's covariate.
    fn transition(&self, step: usize, covariate: Option<&DVector<f64>>) -> Result<Transition>;

    /// True when the transition ignores its arguments, which lets the
    /// M-step re-estimate it.
    fn is_stationary(&self) -> bool {
        false
    }
}

/// Time-invariant dynamics.
#[derive(Debug, Clone, PartialEq)]
pub struct StationaryDynamics {
    transition: Transition,
}

impl StationaryDynamics {
    pub fn new(transition: Transition) -> Self {
        Self { transition }
    }
}

impl DynamicsFn for StationaryDynamics {
    fn transition(&self, _step: usize, _covariate: Option<&DVector<f64>>) -> Result<Transition> {
        Ok(self.transition.clone())
    }

    fn is_stationary(&self) -> bool {
        true
    }
}

/// Adapter for covariate-driven dynamics written as a closure.
pub struct FnDynamics<F> {
    f: F,
}

impl<F> FnDynamics<F>
where
    F: Fn(usize, Option<&DVector<f64>>) -> Result<Transition> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> DynamicsFn for FnDynamics<F>
where
    F: Fn(usize, Option<&DVector<f64>>) -> Result<Transition> + Send + Sync,
{
    fn transition(&self, step: usize, covariate: Option<&DVector<f64>>) -> Result<Transition> {
        (self.f)(step, covariate)
    }
}

impl<F> fmt::Debug for FnDynamics<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnDynamics(..)")
    }
}
