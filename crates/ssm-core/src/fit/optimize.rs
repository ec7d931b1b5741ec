//! Gradient-based minimization collaborator.
//!
//! The gradient M-step hands a scalar objective over a flat parameter vector
//! to a [`GradientOptimizer`]. [`LbfgsOptimizer`] is the shipped
//! implementation: `argmin`'s L-BFGS with a More–Thuente line search and a
//! central finite-difference gradient.

use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use finitediff::FiniteDiff;
use ssm_common::{Error, Result};
use tracing::{debug, warn};

use crate::logging::event_names;

/// Minimizes a scalar objective starting from `x0`.
pub trait GradientOptimizer: Send + Sync {
    /// Returns a point whose objective is no worse than `x0`'s.
    fn minimize(
        &self,
        objective: &dyn Fn(&[f64]) -> f64,
        x0: Vec<f64>,
        max_iters: u64,
    ) -> Result<Vec<f64>>;
}

/// L-BFGS settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LbfgsOptimizer {
    /// History length.
    pub memory: usize,
    pub tol_grad: f64,
    pub tol_cost: f64,
}

impl Default for LbfgsOptimizer {
    fn default() -> Self {
        Self {
            memory: 7,
            tol_grad: 1e-6,
            tol_cost: 1e-10,
        }
    }
}

impl LbfgsOptimizer {
    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }
}

/// Adapter exposing a plain closure as an `argmin` problem.
struct Objective<'a> {
    f: &'a dyn Fn(&[f64]) -> f64,
}

impl CostFunction for Objective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        let value = (self.f)(x);
        if !value.is_finite() {
            return Err(argmin::core::Error::msg(format!("non-finite cost {value}")));
        }
        Ok(value)
    }
}

impl Gradient for Objective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        let grad = x.central_diff(&|p: &Vec<f64>| (self.f)(p));
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(argmin::core::Error::msg("non-finite finite-difference gradient"));
        }
        Ok(grad)
    }
}

impl GradientOptimizer for LbfgsOptimizer {
    fn minimize(
        &self,
        objective: &dyn Fn(&[f64]) -> f64,
        x0: Vec<f64>,
        max_iters: u64,
    ) -> Result<Vec<f64>> {
        let start_cost = objective(&x0);
        if !start_cost.is_finite() {
            return Err(Error::Numerical(format!(
                "objective is {start_cost} at the starting point"
            )));
        }
        if x0.is_empty() || max_iters == 0 {
            return Ok(x0);
        }

        let linesearch: MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64> =
            MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, self.memory)
            .with_tolerance_grad(self.tol_grad)
            .and_then(|s| s.with_tolerance_cost(self.tol_cost))
            .map_err(|e| Error::Config(format!("invalid L-BFGS tolerance: {e}")))?;

        let start = x0.clone();
        let run = Executor::new(Objective { f: objective }, solver)
            .configure(|state| state.param(start).max_iters(max_iters))
            .run();

        let result = match run {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    event = event_names::OPTIMIZER_DONE,
                    error = %e,
                    "optimizer stopped early, keeping the starting point"
                );
                return Ok(x0);
            }
        };

        let state = result.state();
        let best_cost = state.get_best_cost();
        debug!(
            event = event_names::OPTIMIZER_DONE,
            iterations = state.get_iter(),
            start_cost,
            best_cost,
            "optimizer finished"
        );
        match state.get_best_param() {
            Some(best) if best_cost.is_finite() && best_cost < start_cost => Ok(best.clone()),
            _ => Ok(x0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimizes_quadratic() {
        let quad = |x: &[f64]| (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2);
        let best = LbfgsOptimizer::default()
            .minimize(&quad, vec![0.0, 0.0], 100)
            .unwrap();
        assert!((best[0] - 3.0).abs() < 1e-4);
        assert!((best[1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_never_returns_worse_point() {
        let flat = |x: &[f64]| x[0].abs();
        let best = LbfgsOptimizer::default().minimize(&flat, vec![0.0], 20).unwrap();
        assert!(flat(&best) <= 0.0 + 1e-12);
    }

    #[test]
    fn test_rejects_non_finite_start() {
        let bad = |_x: &[f64]| f64::NAN;
        let err = LbfgsOptimizer::default().minimize(&bad, vec![1.0], 10).unwrap_err();
        assert!(matches!(err, Error::Numerical(_)));
    }

    #[test]
    fn test_zero_budget_is_identity() {
        let quad = |x: &[f64]| x[0] * x[0];
        let best = LbfgsOptimizer::default().minimize(&quad, vec![2.0], 0).unwrap();
        assert_eq!(best, vec![2.0]);
    }
}
