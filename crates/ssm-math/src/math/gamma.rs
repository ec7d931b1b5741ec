//! Gamma prior for Poisson rates.
//!
//! # Parameterization
//!
//! Uses **rate parameterization**: `Gamma(α, β)` where:
//! - `α` = shape parameter (α > 0)
//! - `β` = rate parameter (β > 0)
//!
//! The density is: `f(λ) = β^α / Γ(α) * λ^(α-1) * e^(-βλ)`
//!
//! With weighted Poisson counts `Σ w_t y_t` over total weight `Σ w_t` the
//! posterior is `Gamma(α + Σ w y, β + Σ w)`.

use super::stable::log_factorial;

/// Shape/rate pair of a Gamma distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaParams {
    pub shape: f64,
    pub rate: f64,
}

impl GammaParams {
    /// Returns None unless both parameters are finite and positive.
    pub fn new(shape: f64, rate: f64) -> Option<Self> {
        if !(shape.is_finite() && rate.is_finite()) || shape <= 0.0 || rate <= 0.0 {
            return None;
        }
        Some(Self { shape, rate })
    }

    pub fn mean(&self) -> f64 {
        self.shape / self.rate
    }

    /// Posterior mode `(α − 1) / β`, clamped at zero for α < 1.
    pub fn mode(&self) -> f64 {
        ((self.shape - 1.0) / self.rate).max(0.0)
    }

    /// Conjugate update from weighted count totals.
    pub fn posterior(&self, weighted_sum: f64, total_weight: f64) -> Self {
        Self {
            shape: self.shape + weighted_sum,
            rate: self.rate + total_weight,
        }
    }
}

/// Poisson log-probability of a count `y` under rate `lambda`.
pub fn poisson_log_pmf(y: f64, lambda: f64) -> f64 {
    if y.is_nan() || lambda.is_nan() || lambda < 0.0 {
        return f64::NAN;
    }
    if y < 0.0 {
        return f64::NEG_INFINITY;
    }
    if lambda == 0.0 {
        return if y == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    y * lambda.ln() - lambda - log_factorial(y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn mode_and_posterior() {
        let prior = GammaParams::new(1.1, 0.1).unwrap();
        let post = prior.posterior(20.0, 4.0);
        assert!(approx_eq(post.shape, 21.1, 1e-12));
        assert!(approx_eq(post.rate, 4.1, 1e-12));
        assert!(approx_eq(post.mode(), 20.1 / 4.1, 1e-12));
    }

    #[test]
    fn mode_clamps_at_zero() {
        let g = GammaParams::new(0.5, 1.0).unwrap();
        assert_eq!(g.mode(), 0.0);
    }

    #[test]
    fn new_rejects_invalid() {
        assert!(GammaParams::new(0.0, 1.0).is_none());
        assert!(GammaParams::new(1.0, -1.0).is_none());
        assert!(GammaParams::new(f64::INFINITY, 1.0).is_none());
    }

    #[test]
    fn poisson_known_values() {
        // P(Y=2 | λ=3) = 9 e^{-3} / 2
        let lp = poisson_log_pmf(2.0, 3.0);
        assert!(approx_eq(lp, (4.5f64).ln() - 3.0, 1e-10));
        assert_eq!(poisson_log_pmf(0.0, 0.0), 0.0);
        assert_eq!(poisson_log_pmf(1.0, 0.0), f64::NEG_INFINITY);
    }
}
