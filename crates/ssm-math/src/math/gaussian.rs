//! Dense Gaussian helpers on `nalgebra`.
//!
//! Every routine that factors a matrix returns `Option` so callers can attach
//! their own context (matrix name, time step) to the failure.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

/// ln(2π)
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// `0.5 * (m + mᵀ)`
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Cholesky factor of a symmetric positive-definite matrix.
///
/// Returns None for non-square input, non-finite entries, or when the
/// factorization breaks down.
pub fn cholesky(m: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if !m.is_square() || m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let chol = symmetrize(m).cholesky()?;
    let l = chol.l_dirty();
    for i in 0..l.nrows() {
        let d = l[(i, i)];
        if d <= 0.0 || !d.is_finite() {
            return None;
        }
    }
    Some(chol)
}

/// log|M| from its Cholesky factor: `2 Σ log L_ii`.
pub fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    let l = chol.l_dirty();
    (0..l.nrows()).map(|i| 2.0 * l[(i, i)].ln()).sum()
}

/// Inverse of an SPD matrix, symmetrized.
pub fn spd_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let chol = cholesky(m)?;
    Some(symmetrize(&chol.inverse()))
}

/// Multivariate normal log-density `log N(x | mean, cov)`.
pub fn mvn_log_pdf(x: &DVector<f64>, mean: &DVector<f64>, cov: &DMatrix<f64>) -> Option<f64> {
    if x.len() != mean.len() || cov.nrows() != x.len() {
        return None;
    }
    let chol = cholesky(cov)?;
    let diff = x - mean;
    let quad = diff.dot(&chol.solve(&diff));
    let d = x.len() as f64;
    Some(-0.5 * (d * LN_2PI + log_det(&chol) + quad))
}

/// Outer product `a bᵀ`.
pub fn outer(a: &DVector<f64>, b: &DVector<f64>) -> DMatrix<f64> {
    a * b.transpose()
}
