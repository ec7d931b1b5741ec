//! Exact inference for linear-Gaussian chains in information form.
//!
//! # Model
//!
//! The joint over `x_0..x_{T−1}` (each of dimension `D`) is
//! `p(x) ∝ exp(−½ xᵀ J x + hᵀ x)` where `J` is block tridiagonal:
//! - diagonal blocks `J_t` (`T` of them, symmetric)
//! - lower blocks `L_t` coupling `x_{t+1}` (row) to `x_t` (column), `T − 1` of them
//!
//! One forward sweep eliminates each step into the next via its Schur
//! complement, `J̃_{t+1} = J_{t+1} − L_t J̃_t⁻¹ L_tᵀ`,
//! `h̃_{t+1} = h_{t+1} − L_t J̃_t⁻¹ h̃_t`, and one backward sweep recovers means,
//! covariances and cross-covariances. The dense `TD × TD` matrix is never
//! formed; cost is `O(T D³)`.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ssm_common::{Error, Result};
use ssm_math::gaussian::{cholesky, log_det, outer, symmetrize};

use super::posterior::{half_log_2pi, GaussianChainPosterior};

/// `(J_diag, J_lower, h)` for one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianChainNaturalParams {
    pub(crate) j_diag: Vec<DMatrix<f64>>,
    pub(crate) j_lower: Vec<DMatrix<f64>>,
    pub(crate) h: Vec<DVector<f64>>,
}

impl GaussianChainNaturalParams {
    /// Validates shapes and finiteness; diagonal blocks are symmetrized.
    pub fn new(
        j_diag: Vec<DMatrix<f64>>,
        j_lower: Vec<DMatrix<f64>>,
        h: Vec<DVector<f64>>,
    ) -> Result<Self> {
        let t_len = j_diag.len();
        if t_len == 0 {
            return Err(Error::Config("chain has no time steps".to_string()));
        }
        let d = j_diag[0].nrows();
        if d == 0 {
            return Err(Error::Config("latent dimension is zero".to_string()));
        }
        if j_lower.len() != t_len - 1 {
            return Err(Error::DimensionMismatch {
                what: "number of off-diagonal precision blocks".to_string(),
                expected: t_len - 1,
                got: j_lower.len(),
            });
        }
        if h.len() != t_len {
            return Err(Error::DimensionMismatch {
                what: "number of linear potential vectors".to_string(),
                expected: t_len,
                got: h.len(),
            });
        }
        for (t, block) in j_diag.iter().chain(j_lower.iter()).enumerate() {
            if block.nrows() != d || block.ncols() != d {
                return Err(Error::DimensionMismatch {
                    what: format!("precision block {t}"),
                    expected: d,
                    got: if block.nrows() != d {
                        block.nrows()
                    } else {
                        block.ncols()
                    },
                });
            }
            if block.iter().any(|v| !v.is_finite()) {
                return Err(Error::NonFiniteInput(format!("precision block {t}")));
            }
        }
        for (t, v) in h.iter().enumerate() {
            if v.len() != d {
                return Err(Error::DimensionMismatch {
                    what: format!("linear potential at step {t}"),
                    expected: d,
                    got: v.len(),
                });
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(Error::NonFiniteInput(format!("linear potential at step {t}")));
            }
        }
        let j_diag = j_diag.iter().map(symmetrize).collect();
        Ok(Self { j_diag, j_lower, h })
    }

    pub fn num_timesteps(&self) -> usize {
        self.j_diag.len()
    }

    pub fn state_dim(&self) -> usize {
        self.j_diag[0].nrows()
    }

    pub fn j_diag(&self) -> &[DMatrix<f64>] {
        &self.j_diag
    }

    pub fn j_lower(&self) -> &[DMatrix<f64>] {
        &self.j_lower
    }

    pub fn h(&self) -> &[DVector<f64>] {
        &self.h
    }
}

/// Result of the forward elimination sweep.
struct Elimination {
    factors: Vec<Cholesky<f64, Dyn>>,
    h_tilde: Vec<DVector<f64>>,
    log_normalizer: f64,
}

fn eliminate(params: &GaussianChainNaturalParams) -> Result<Elimination> {
    let t_len = params.num_timesteps();
    let d = params.state_dim();

    let mut factors = Vec::with_capacity(t_len);
    let mut h_tilde = Vec::with_capacity(t_len);
    let mut log_normalizer = 0.0;

    let mut j_cur = params.j_diag[0].clone();
    let mut h_cur = params.h[0].clone();
    for t in 0..t_len {
        let chol = cholesky(&j_cur).ok_or_else(|| Error::NotPositiveDefinite {
            what: "eliminated precision block".to_string(),
            step: Some(t),
        })?;
        let mean_part = chol.solve(&h_cur);
        log_normalizer += 0.5 * h_cur.dot(&mean_part) - 0.5 * log_det(&chol) + half_log_2pi(d);

        let next = if t + 1 < t_len {
            let lower = &params.j_lower[t];
            // J̃_t⁻¹ L_tᵀ
            let gain = chol.solve(&lower.transpose());
            Some((
                symmetrize(&(&params.j_diag[t + 1] - lower * &gain)),
                &params.h[t + 1] - lower * &mean_part,
            ))
        } else {
            None
        };

        factors.push(chol);
        h_tilde.push(h_cur);
        match next {
            Some((j_next, h_next)) => {
                j_cur = j_next;
                h_cur = h_next;
            }
            None => break,
        }
    }

    Ok(Elimination {
        factors,
        h_tilde,
        log_normalizer,
    })
}

/// Exact posterior marginals and log normalizer for one chain.
///
/// Fails with [`Error::NotPositiveDefinite`] naming the step whose eliminated
/// block could not be factored.
pub fn gaussian_chain_posterior(
    params: &GaussianChainNaturalParams,
) -> Result<GaussianChainPosterior> {
    let t_len = params.num_timesteps();
    let Elimination {
        factors,
        h_tilde,
        log_normalizer,
    } = eliminate(params)?;

    let mut means: Vec<DVector<f64>> = vec![DVector::zeros(0); t_len];
    let mut covariances: Vec<DMatrix<f64>> = vec![DMatrix::zeros(0, 0); t_len];
    let mut cross_moments: Vec<DMatrix<f64>> = Vec::with_capacity(t_len.saturating_sub(1));

    let last = t_len - 1;
    covariances[last] = symmetrize(&factors[last].inverse());
    means[last] = factors[last].solve(&h_tilde[last]);

    for t in (0..last).rev() {
        let chol = &factors[t];
        let j_inv = chol.inverse();
        // G_t = −J̃_t⁻¹ L_tᵀ
        let g = -chol.solve(&params.j_lower[t].transpose());
        let mean = chol.solve(&h_tilde[t]) + &g * &means[t + 1];
        let cov_next_gt = &covariances[t + 1] * g.transpose();
        let cov = symmetrize(&(j_inv + &g * &cov_next_gt));

        cross_moments.push(&cov_next_gt + outer(&means[t + 1], &mean));
        means[t] = mean;
        covariances[t] = cov;
    }
    cross_moments.reverse();

    Ok(GaussianChainPosterior {
        log_normalizer,
        means,
        covariances,
        cross_moments,
        natural_params: params.clone(),
    })
}

/// Posteriors for a batch; errors name the failing sequence.
pub fn gaussian_chain_posteriors(
    batch: &[GaussianChainNaturalParams],
) -> Result<Vec<GaussianChainPosterior>> {
    batch
        .iter()
        .enumerate()
        .map(|(i, p)| gaussian_chain_posterior(p).map_err(|e| e.in_sequence(i)))
        .collect()
}
