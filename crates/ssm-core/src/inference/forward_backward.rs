//! Forward-backward message passing over discrete chains, in log space.
//!
//! # Model
//!
//! - Latent chain: `z_0 ~ π`, `z_{t+1} | z_t = i ~ A_{i,·}`
//! - Per-step evidence: `L_{t,k} = log p(y_t | z_t = k)`
//!
//! Messages:
//! - `α_0 = log π + L_0`, `α_t = logsumexp_i(α_{t−1,i} + log A_{i,·}) + L_t`
//! - `β_{T−1} = 0`, `β_t = logsumexp_j(log A_{·,j} + L_{t+1,j} + β_{t+1,j})`
//! - `log p(y) = logsumexp_k α_{T−1,k}`
//!
//! No probability is ever multiplied outside the log domain. Time is
//! `O(T K²)` and memory `O(T K)` per sequence.

use nalgebra::{DMatrix, DVector};
use ssm_common::{Error, Result};
use ssm_math::{argmax, log_normalize, log_sum_exp, softmax};

use super::posterior::HmmPosterior;

/// `(log π, log A, log L)` for one sequence.
///
/// Construction normalizes `log π` and every row of `log A` by its own
/// log-sum-exp, so raw logits are accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteNaturalParams {
    log_initial: DVector<f64>,
    log_transition: DMatrix<f64>,
    log_likelihoods: DMatrix<f64>,
}

impl DiscreteNaturalParams {
    pub fn new(
        initial_logits: DVector<f64>,
        transition_logits: DMatrix<f64>,
        log_likelihoods: DMatrix<f64>,
    ) -> Result<Self> {
        let k = initial_logits.len();
        if k == 0 {
            return Err(Error::Config("discrete chain has zero states".to_string()));
        }
        if transition_logits.nrows() != k || transition_logits.ncols() != k {
            return Err(Error::DimensionMismatch {
                what: "transition matrix".to_string(),
                expected: k,
                got: if transition_logits.nrows() != k {
                    transition_logits.nrows()
                } else {
                    transition_logits.ncols()
                },
            });
        }
        if log_likelihoods.ncols() != k {
            return Err(Error::DimensionMismatch {
                what: "log-likelihood columns".to_string(),
                expected: k,
                got: log_likelihoods.ncols(),
            });
        }
        if log_likelihoods.nrows() == 0 {
            return Err(Error::Config("sequence has no time steps".to_string()));
        }
        if initial_logits.iter().any(|v| v.is_nan()) {
            return Err(Error::NonFiniteInput("initial distribution".to_string()));
        }
        if transition_logits.iter().any(|v| v.is_nan()) {
            return Err(Error::NonFiniteInput("transition matrix".to_string()));
        }
        if log_likelihoods.iter().any(|v| v.is_nan()) {
            return Err(Error::NonFiniteInput("log-likelihoods".to_string()));
        }

        let mut log_initial = initial_logits;
        if !log_normalize(log_initial.as_mut_slice()).is_finite() {
            return Err(Error::Numerical(
                "initial distribution has no finite mass".to_string(),
            ));
        }

        let mut log_transition = transition_logits;
        for i in 0..k {
            let mut row: Vec<f64> = log_transition.row(i).iter().copied().collect();
            if !log_normalize(&mut row).is_finite() {
                return Err(Error::Numerical(format!(
                    "transition row {i} has no finite mass"
                )));
            }
            for (j, v) in row.into_iter().enumerate() {
                log_transition[(i, j)] = v;
            }
        }

        Ok(Self {
            log_initial,
            log_transition,
            log_likelihoods,
        })
    }

    pub fn num_states(&self) -> usize {
        self.log_initial.len()
    }

    pub fn num_timesteps(&self) -> usize {
        self.log_likelihoods.nrows()
    }

    pub fn log_initial(&self) -> &DVector<f64> {
        &self.log_initial
    }

    pub fn log_transition(&self) -> &DMatrix<f64> {
        &self.log_transition
    }

    pub fn log_likelihoods(&self) -> &DMatrix<f64> {
        &self.log_likelihoods
    }
}

/// Forward messages `α` (`T × K`) and `log p(y)`.
pub fn forward_pass(params: &DiscreteNaturalParams) -> (DMatrix<f64>, f64) {
    let (t_len, k) = (params.num_timesteps(), params.num_states());
    let log_a = &params.log_transition;
    let log_l = &params.log_likelihoods;

    let mut alphas = DMatrix::from_element(t_len, k, f64::NEG_INFINITY);
    for j in 0..k {
        alphas[(0, j)] = params.log_initial[j] + log_l[(0, j)];
    }

    let mut scratch = vec![0.0; k];
    for t in 1..t_len {
        for j in 0..k {
            for i in 0..k {
                scratch[i] = alphas[(t - 1, i)] + log_a[(i, j)];
            }
            alphas[(t, j)] = log_sum_exp(&scratch) + log_l[(t, j)];
        }
    }

    let last: Vec<f64> = alphas.row(t_len - 1).iter().copied().collect();
    let log_normalizer = log_sum_exp(&last);
    (alphas, log_normalizer)
}

/// Backward messages `β` (`T × K`), with `β_{T−1} = 0`.
pub fn backward_pass(params: &DiscreteNaturalParams) -> DMatrix<f64> {
    let (t_len, k) = (params.num_timesteps(), params.num_states());
    let log_a = &params.log_transition;
    let log_l = &params.log_likelihoods;

    let mut betas = DMatrix::zeros(t_len, k);
    let mut scratch = vec![0.0; k];
    for t in (0..t_len.saturating_sub(1)).rev() {
        for i in 0..k {
            for j in 0..k {
                scratch[j] = log_a[(i, j)] + log_l[(t + 1, j)] + betas[(t + 1, j)];
            }
            betas[(t, i)] = log_sum_exp(&scratch);
        }
    }
    betas
}

/// Smoothed posterior for one sequence.
///
/// Fails with [`Error::ZeroProbabilitySequence`] when no state path has
/// positive probability.
pub fn hmm_posterior(params: &DiscreteNaturalParams) -> Result<HmmPosterior> {
    let (t_len, k) = (params.num_timesteps(), params.num_states());
    let (alphas, log_normalizer) = forward_pass(params);
    if log_normalizer == f64::NEG_INFINITY {
        return Err(Error::ZeroProbabilitySequence { sequence: 0 });
    }
    if !log_normalizer.is_finite() {
        return Err(Error::Numerical(format!(
            "log marginal likelihood is {log_normalizer}"
        )));
    }
    let betas = backward_pass(params);

    let mut expected_states = DMatrix::zeros(t_len, k);
    let mut row = vec![0.0; k];
    for t in 0..t_len {
        for j in 0..k {
            row[j] = alphas[(t, j)] + betas[(t, j)];
        }
        for (j, p) in softmax(&row).into_iter().enumerate() {
            expected_states[(t, j)] = p;
        }
    }

    let log_a = &params.log_transition;
    let log_l = &params.log_likelihoods;
    let mut pair = vec![0.0; k * k];
    let mut expected_transitions = Vec::with_capacity(t_len.saturating_sub(1));
    for t in 0..t_len.saturating_sub(1) {
        for i in 0..k {
            for j in 0..k {
                pair[i * k + j] =
                    alphas[(t, i)] + log_a[(i, j)] + log_l[(t + 1, j)] + betas[(t + 1, j)];
            }
        }
        let probs = softmax(&pair);
        expected_transitions.push(DMatrix::from_row_slice(k, k, &probs));
    }

    Ok(HmmPosterior {
        marginal_log_likelihood: log_normalizer,
        expected_states,
        expected_transitions,
    })
}

/// Smoothed posteriors for a batch; errors name the failing sequence.
pub fn hmm_posteriors(batch: &[DiscreteNaturalParams]) -> Result<Vec<HmmPosterior>> {
    batch
        .iter()
        .enumerate()
        .map(|(i, p)| hmm_posterior(p).map_err(|e| e.in_sequence(i)))
        .collect()
}

/// Filtered marginals `P(z_t | y_{0..=t})`, i.e. `softmax(α_t)`.
pub fn filtered_states(params: &DiscreteNaturalParams) -> Result<DMatrix<f64>> {
    let (alphas, log_normalizer) = forward_pass(params);
    if log_normalizer == f64::NEG_INFINITY {
        return Err(Error::ZeroProbabilitySequence { sequence: 0 });
    }
    let mut out = DMatrix::zeros(alphas.nrows(), alphas.ncols());
    for t in 0..alphas.nrows() {
        let row: Vec<f64> = alphas.row(t).iter().copied().collect();
        for (j, p) in softmax(&row).into_iter().enumerate() {
            out[(t, j)] = p;
        }
    }
    Ok(out)
}

/// Most likely state path (Viterbi). Ties go to the lowest state index.
pub fn most_likely_states(params: &DiscreteNaturalParams) -> Result<Vec<usize>> {
    let (t_len, k) = (params.num_timesteps(), params.num_states());
    let log_a = &params.log_transition;
    let log_l = &params.log_likelihoods;

    let mut scores = DMatrix::from_element(t_len, k, f64::NEG_INFINITY);
    let mut backpointers = vec![vec![0usize; k]; t_len];
    for j in 0..k {
        scores[(0, j)] = params.log_initial[j] + log_l[(0, j)];
    }

    let mut candidates = vec![0.0; k];
    for t in 1..t_len {
        for j in 0..k {
            for i in 0..k {
                candidates[i] = scores[(t - 1, i)] + log_a[(i, j)];
            }
            let best = argmax(&candidates).unwrap_or(0);
            backpointers[t][j] = best;
            scores[(t, j)] = candidates[best] + log_l[(t, j)];
        }
    }

    let last: Vec<f64> = scores.row(t_len - 1).iter().copied().collect();
    if last.iter().all(|v| *v == f64::NEG_INFINITY) {
        return Err(Error::ZeroProbabilitySequence { sequence: 0 });
    }
    let mut path = vec![0usize; t_len];
    path[t_len - 1] = argmax(&last).unwrap_or(0);
    for t in (1..t_len).rev() {
        path[t - 1] = backpointers[t][path[t]];
    }
    Ok(path)
}
