//! Natural-parameter extraction: model parameters + one sequence → the
//! canonical inputs of the inference engines.
//!
//! Singular covariances surface as [`Error::NotPositiveDefinite`] naming the
//! matrix (and step, for transitions). No jitter is added here; any
//! regularization belongs to the M-step.

use nalgebra::{DMatrix, DVector};
use ssm_common::{Error, Result};
use ssm_math::gaussian::spd_inverse;

use super::block_tridiag::GaussianChainNaturalParams;
use super::forward_backward::DiscreteNaturalParams;
use crate::data::Sequence;
use crate::models::dynamics::DynamicsFn;
use crate::models::lds::LdsParams;

/// Discrete-chain parameters from probabilities and a `T × K` log-likelihood
/// matrix. Zero probabilities become `−∞` logits.
pub fn discrete_natural_params(
    initial_probs: &DVector<f64>,
    transition_matrix: &DMatrix<f64>,
    log_likelihoods: DMatrix<f64>,
) -> Result<DiscreteNaturalParams> {
    DiscreteNaturalParams::new(
        initial_probs.map(f64::ln),
        transition_matrix.map(f64::ln),
        log_likelihoods,
    )
}

/// Information-form parameters of `p(x | y)` for a linear-Gaussian model.
///
/// With transitions `(A_t, b_t, Q_t)` producing step `t`:
/// - `J_t = CᵀR⁻¹C (+ Q₁⁻¹ at t=0) (+ A_{t+1}ᵀQ_{t+1}⁻¹A_{t+1} for t<T−1) (+ Q_t⁻¹ for t>0)`
/// - `L_t = −Q_{t+1}⁻¹A_{t+1}`
/// - `h_t = CᵀR⁻¹(y_t − d) (+ Q₁⁻¹m₁ at 0) (− A_{t+1}ᵀQ_{t+1}⁻¹b_{t+1}) (+ Q_t⁻¹b_t for t>0)`
pub fn lds_natural_params(
    params: &LdsParams,
    dynamics: &dyn DynamicsFn,
    sequence: &Sequence,
) -> Result<GaussianChainNaturalParams> {
    let d = params.state_dim();
    let n = params.obs_dim();
    if sequence.obs_dim() != n {
        return Err(Error::DimensionMismatch {
            what: "observation dimension".to_string(),
            expected: n,
            got: sequence.obs_dim(),
        });
    }
    let t_len = sequence.num_timesteps();

    let r_inv = spd_inverse(&params.emissions_covariance).ok_or_else(|| {
        Error::NotPositiveDefinite {
            what: "emission covariance R".to_string(),
            step: None,
        }
    })?;
    let q1_inv = spd_inverse(&params.initial_covariance).ok_or_else(|| {
        Error::NotPositiveDefinite {
            what: "initial covariance Q1".to_string(),
            step: None,
        }
    })?;

    let ct_rinv = params.emissions_matrix.transpose() * &r_inv;
    let j_obs = &ct_rinv * &params.emissions_matrix;

    let mut j_diag: Vec<DMatrix<f64>> = vec![j_obs; t_len];
    let mut h: Vec<DVector<f64>> = (0..t_len)
        .map(|t| &ct_rinv * (sequence.observation(t) - &params.emissions_bias))
        .collect();
    let mut j_lower: Vec<DMatrix<f64>> = Vec::with_capacity(t_len.saturating_sub(1));

    j_diag[0] += &q1_inv;
    h[0] += &q1_inv * &params.initial_mean;

    for t in 1..t_len {
        let covariate = sequence.covariate(t);
        let tr = dynamics.transition(t, covariate.as_ref())?;
        tr.validate(d, t)?;
        let q_inv = spd_inverse(&tr.covariance).ok_or_else(|| Error::NotPositiveDefinite {
            what: "dynamics covariance Q".to_string(),
            step: Some(t),
        })?;
        let q_inv_a = &q_inv * &tr.matrix;
        let q_inv_b = &q_inv * &tr.bias;

        j_diag[t - 1] += tr.matrix.transpose() * &q_inv_a;
        j_diag[t] += &q_inv;
        j_lower.push(-q_inv_a);
        h[t - 1] -= tr.matrix.transpose() * &q_inv_b;
        h[t] += q_inv_b;
    }

    GaussianChainNaturalParams::new(j_diag, j_lower, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dynamics::{FnDynamics, StationaryDynamics, Transition};

    fn scalar(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    fn scalar_lds(a: f64, q: f64, r: f64) -> LdsParams {
        LdsParams {
            initial_mean: DVector::from_element(1, 0.5),
            initial_covariance: scalar(2.0),
            dynamics_matrix: scalar(a),
            dynamics_bias: DVector::from_element(1, 0.1),
            dynamics_covariance: scalar(q),
            emissions_matrix: scalar(1.0),
            emissions_bias: DVector::zeros(1),
            emissions_covariance: scalar(r),
        }
    }

    #[test]
    fn test_discrete_zero_probability_is_neg_inf() {
        let np = discrete_natural_params(
            &DVector::from_vec(vec![1.0, 0.0]),
            &DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 0.0, 1.0]),
            DMatrix::zeros(3, 2),
        )
        .unwrap();
        assert_eq!(np.log_initial()[1], f64::NEG_INFINITY);
        assert_eq!(np.log_transition()[(1, 0)], f64::NEG_INFINITY);
    }

    #[test]
    fn test_scalar_lds_blocks() {
        let params = scalar_lds(0.9, 0.5, 4.0);
        let dynamics = StationaryDynamics::new(params.transition());
        let seq = Sequence::from_scalars(&[1.0, 2.0, 3.0]).unwrap();
        let np = lds_natural_params(&params, &dynamics, &seq).unwrap();

        let obs = 0.25;
        let aqa = 0.9 * 0.9 / 0.5;
        let q_inv = 2.0;
        assert!((np.j_diag()[0][(0, 0)] - (obs + 0.5 + aqa)).abs() < 1e-12);
        assert!((np.j_diag()[1][(0, 0)] - (obs + aqa + q_inv)).abs() < 1e-12);
        assert!((np.j_diag()[2][(0, 0)] - (obs + q_inv)).abs() < 1e-12);
        assert!((np.j_lower()[0][(0, 0)] + 0.9 * q_inv).abs() < 1e-12);

        // h_0 = y_0/R + m1/Q1 − A b / Q
        let h0 = 1.0 / 4.0 + 0.5 / 2.0 - 0.9 * 0.1 * q_inv;
        assert!((np.h()[0][0] - h0).abs() < 1e-12);
        // h_2 = y_2/R + b/Q
        let h2 = 3.0 / 4.0 + 0.1 * q_inv;
        assert!((np.h()[2][0] - h2).abs() < 1e-12);
    }

    #[test]
    fn test_singular_emission_covariance() {
        let params = scalar_lds(1.0, 1.0, 0.0);
        let dynamics = StationaryDynamics::new(params.transition());
        let seq = Sequence::from_scalars(&[1.0]).unwrap();
        let err = lds_natural_params(&params, &dynamics, &seq).unwrap_err();
        assert!(err.to_string().contains("emission covariance R"));
    }

    #[test]
    fn test_singular_transition_names_step() {
        let params = scalar_lds(1.0, 1.0, 1.0);
        let dynamics = FnDynamics::new(|step, _u: Option<&DVector<f64>>| {
            let q = if step == 2 { 0.0 } else { 1.0 };
            Ok(Transition::new(scalar(1.0), DVector::zeros(1), scalar(q)))
        });
        let seq = Sequence::from_scalars(&[1.0, 2.0, 3.0]).unwrap();
        let err = lds_natural_params(&params, &dynamics, &seq).unwrap_err();
        assert!(matches!(err, Error::NotPositiveDefinite { step: Some(2), .. }));
    }

    #[test]
    fn test_time_varying_uses_covariates() {
        let params = scalar_lds(1.0, 1.0, 1.0);
        let dynamics = FnDynamics::new(|_step, u: Option<&DVector<f64>>| {
            let a = u.map(|u| u[0]).unwrap_or(0.0);
            Ok(Transition::new(scalar(a), DVector::zeros(1), scalar(1.0)))
        });
        let seq = Sequence::from_scalars(&[0.0, 0.0, 0.0])
            .unwrap()
            .with_covariates(DMatrix::from_column_slice(3, 1, &[9.0, 0.5, 2.0]))
            .unwrap();
        let np = lds_natural_params(&params, &dynamics, &seq).unwrap();
        assert!((np.j_lower()[0][(0, 0)] + 0.5).abs() < 1e-12);
        assert!((np.j_lower()[1][(0, 0)] + 2.0).abs() < 1e-12);
    }
}
