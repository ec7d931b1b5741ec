//! Emission families for hidden Markov models.
//!
//! Each family evaluates a `T × K` log-likelihood matrix for a sequence,
//! re-estimates itself from posterior state weights, and carries a parameter
//! schema so the gradient M-step can treat it as a flat vector.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use rand::distr::weighted::WeightedIndex;
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use ssm_config::{GaussianPriors, Priors};
use ssm_math::gaussian::{self, LN_2PI};
use ssm_math::{dirichlet, poisson_log_pmf, GammaParams};

use super::sample_mvn;
use super::params::{FieldKind, FieldSpec, FlatReader, FlatWriter, ParameterRecord, ParameterSchema};
use crate::data::{Dataset, Sequence};

/// Total weight below which a state is treated as unvisited.
pub(crate) const MIN_STATE_WEIGHT: f64 = 1e-10;

/// Per-state observation distribution of an HMM.
pub trait Emissions: ParameterRecord + Clone + fmt::Debug + Send + Sync {
    fn num_states(&self) -> usize;

    fn obs_dim(&self) -> usize;

    /// `log p(y_t | z_t = k)` as a `T × K` matrix.
    fn log_likelihoods(&self, sequence: &Sequence) -> Result<DMatrix<f64>>;

    /// Conjugate / weighted-MLE update from per-sequence `T × K` weights.
    fn closed_form_update(
        &self,
        dataset: &Dataset,
        weights: &[DMatrix<f64>],
        priors: &Priors,
    ) -> Result<Self>;

    /// Draw the next observation from state `state`. `history` holds the
    /// observations drawn so far in the same sequence.
    fn sample<R: Rng + ?Sized>(
        &self,
        state: usize,
        history: &[DVector<f64>],
        rng: &mut R,
    ) -> Result<DVector<f64>>;

    /// Rejects observations outside the family's support. Runs once before
    /// inference; errors name the sequence and step.
    fn validate_support(&self, _dataset: &Dataset) -> Result<()> {
        Ok(())
    }

    /// `Σ_seq Σ_t Σ_k w_tk log p(y_t | k)`. Zero weights contribute nothing,
    /// even against a `−∞` log-likelihood.
    fn expected_log_likelihood(&self, dataset: &Dataset, weights: &[DMatrix<f64>]) -> Result<f64> {
        check_weights(dataset, weights, self.num_states())?;
        let mut total = 0.0;
        for (seq, w) in dataset.iter().zip(weights) {
            let ll = self.log_likelihoods(seq)?;
            for (l, wt) in ll.iter().zip(w.iter()) {
                if *wt > 0.0 {
                    total += wt * l;
                }
            }
        }
        Ok(total)
    }
}

pub(crate) fn check_weights(dataset: &Dataset, weights: &[DMatrix<f64>], k: usize) -> Result<()> {
    if weights.len() != dataset.len() {
        return Err(Error::DimensionMismatch {
            what: "number of weight matrices".to_string(),
            expected: dataset.len(),
            got: weights.len(),
        });
    }
    for (seq, w) in dataset.iter().zip(weights) {
        if w.nrows() != seq.num_timesteps() || w.ncols() != k {
            return Err(Error::DimensionMismatch {
                what: "state weight matrix".to_string(),
                expected: seq.num_timesteps() * k,
                got: w.nrows() * w.ncols(),
            });
        }
    }
    Ok(())
}

/// Posterior-mode covariance from a weighted scatter matrix and its total
/// weight, with the prior scatter and pseudo-counts of `prior` folded in.
pub(crate) fn covariance_mode(
    scatter: DMatrix<f64>,
    weight: f64,
    prior: &GaussianPriors,
) -> DMatrix<f64> {
    let n = scatter.nrows();
    let identity = DMatrix::<f64>::identity(n, n);
    let cov = (scatter + &identity * prior.covariance_scale)
        / (weight + prior.covariance_pseudo_count)
        + identity * prior.covariance_regularization;
    gaussian::symmetrize(&cov)
}

pub(crate) fn check_obs_dim(sequence: &Sequence, expected: usize) -> Result<()> {
    if sequence.obs_dim() != expected {
        return Err(Error::DimensionMismatch {
            what: "observation dimension".to_string(),
            expected,
            got: sequence.obs_dim(),
        });
    }
    Ok(())
}

pub(crate) fn check_state(state: usize, k: usize) -> Result<()> {
    if state >= k {
        return Err(Error::Config(format!("state {state} out of range for {k} states")));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Gaussian
// ----------------------------------------------------------------------------

/// Full-covariance Gaussian emissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianEmissions {
    /// `K × N`, one mean per row.
    means: DMatrix<f64>,
    covariances: Vec<DMatrix<f64>>,
}

impl GaussianEmissions {
    pub fn new(means: DMatrix<f64>, covariances: Vec<DMatrix<f64>>) -> Result<Self> {
        let (k, n) = means.shape();
        if k == 0 || n == 0 {
            return Err(Error::Config("gaussian emissions need at least one state and dimension".into()));
        }
        if covariances.len() != k {
            return Err(Error::DimensionMismatch {
                what: "number of emission covariances".to_string(),
                expected: k,
                got: covariances.len(),
            });
        }
        if means.iter().any(|v| !v.is_finite()) {
            return Err(Error::NonFiniteInput("emission means".into()));
        }
        for (i, cov) in covariances.iter().enumerate() {
            if cov.shape() != (n, n) {
                return Err(Error::DimensionMismatch {
                    what: format!("emission covariance of state {i}"),
                    expected: n,
                    got: cov.nrows(),
                });
            }
            if gaussian::cholesky(cov).is_none() {
                return Err(Error::NotPositiveDefinite {
                    what: format!("emission covariance of state {i}"),
                    step: None,
                });
            }
        }
        Ok(Self { means, covariances })
    }

    /// Unit covariances around the given means.
    pub fn with_unit_covariance(means: DMatrix<f64>) -> Result<Self> {
        let n = means.ncols();
        let covs = vec![DMatrix::identity(n, n); means.nrows()];
        Self::new(means, covs)
    }

    pub fn means(&self) -> &DMatrix<f64> {
        &self.means
    }

    pub fn mean(&self, state: usize) -> DVector<f64> {
        self.means.row(state).transpose()
    }

    pub fn covariances(&self) -> &[DMatrix<f64>] {
        &self.covariances
    }
}

impl ParameterRecord for GaussianEmissions {
    fn schema(&self) -> ParameterSchema {
        let (k, n) = self.means.shape();
        ParameterSchema::new(
            1,
            vec![
                FieldSpec::new("means", FieldKind::Matrix, vec![k, n]),
                FieldSpec::new("covariances", FieldKind::CholeskyFactor, vec![k, n]),
            ],
        )
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        writer.matrix(&self.means);
        for cov in &self.covariances {
            writer.cholesky(cov)?;
        }
        Ok(())
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let (k, n) = self.means.shape();
        let means = reader.matrix(k, n)?;
        let covariances = (0..k).map(|_| reader.cholesky(n)).collect::<Result<Vec<_>>>()?;
        Self::new(means, covariances)
    }
}

impl Emissions for GaussianEmissions {
    fn num_states(&self) -> usize {
        self.means.nrows()
    }

    fn obs_dim(&self) -> usize {
        self.means.ncols()
    }

    fn log_likelihoods(&self, sequence: &Sequence) -> Result<DMatrix<f64>> {
        let n = self.obs_dim();
        check_obs_dim(sequence, n)?;
        let t_len = sequence.num_timesteps();
        let mut out = DMatrix::zeros(t_len, self.num_states());
        for (k, cov) in self.covariances.iter().enumerate() {
            let chol = gaussian::cholesky(cov).ok_or_else(|| Error::NotPositiveDefinite {
                what: format!("emission covariance of state {k}"),
                step: None,
            })?;
            let norm = -0.5 * (n as f64 * LN_2PI + gaussian::log_det(&chol));
            let mean = self.mean(k);
            for t in 0..t_len {
                let diff = sequence.observation(t) - &mean;
                out[(t, k)] = norm - 0.5 * diff.dot(&chol.solve(&diff));
            }
        }
        Ok(out)
    }

    fn closed_form_update(
        &self,
        dataset: &Dataset,
        weights: &[DMatrix<f64>],
        priors: &Priors,
    ) -> Result<Self> {
        check_weights(dataset, weights, self.num_states())?;
        let n = self.obs_dim();
        let prior = &priors.gaussian;
        let prior_mean = DVector::from_element(n, prior.prior_mean);
        let mut means = self.means.clone();
        let mut covariances = self.covariances.clone();

        for k in 0..self.num_states() {
            let mut w_sum = 0.0;
            let mut x_sum = DVector::zeros(n);
            for (seq, w) in dataset.iter().zip(weights) {
                check_obs_dim(seq, n)?;
                for t in 0..seq.num_timesteps() {
                    w_sum += w[(t, k)];
                    x_sum += w[(t, k)] * seq.observation(t);
                }
            }
            if w_sum < MIN_STATE_WEIGHT {
                continue;
            }
            let mean = (x_sum + &prior_mean * prior.mean_concentration)
                / (w_sum + prior.mean_concentration);
            let shift = &mean - &prior_mean;
            let mut scatter = gaussian::outer(&shift, &shift) * prior.mean_concentration;
            for (seq, w) in dataset.iter().zip(weights) {
                for t in 0..seq.num_timesteps() {
                    let diff = seq.observation(t) - &mean;
                    scatter += w[(t, k)] * gaussian::outer(&diff, &diff);
                }
            }
            means.set_row(k, &mean.transpose());
            covariances[k] = covariance_mode(scatter, w_sum, prior);
        }
        Self::new(means, covariances)
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        state: usize,
        _history: &[DVector<f64>],
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        check_state(state, self.num_states())?;
        sample_mvn(
            &self.mean(state),
            &self.covariances[state],
            rng,
            &format!("emission covariance of state {state}"),
        )
    }
}

// ----------------------------------------------------------------------------
// Poisson
// ----------------------------------------------------------------------------

/// Independent Poisson counts per observation dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonEmissions {
    /// `K × N`
    rates: DMatrix<f64>,
}

impl PoissonEmissions {
    pub fn new(rates: DMatrix<f64>) -> Result<Self> {
        if rates.nrows() == 0 || rates.ncols() == 0 {
            return Err(Error::Config("poisson emissions need at least one state and dimension".into()));
        }
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(Error::NonFiniteInput("poisson rates must be finite and non-negative".into()));
        }
        Ok(Self { rates })
    }

    pub fn rates(&self) -> &DMatrix<f64> {
        &self.rates
    }
}

impl ParameterRecord for PoissonEmissions {
    fn schema(&self) -> ParameterSchema {
        let (k, n) = self.rates.shape();
        ParameterSchema::new(1, vec![FieldSpec::new("rates", FieldKind::LogRates, vec![k, n])])
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        writer.log_rates(&self.rates);
        Ok(())
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let (k, n) = self.rates.shape();
        Self::new(reader.log_rates(k, n)?)
    }
}

impl Emissions for PoissonEmissions {
    fn num_states(&self) -> usize {
        self.rates.nrows()
    }

    fn obs_dim(&self) -> usize {
        self.rates.ncols()
    }

    fn log_likelihoods(&self, sequence: &Sequence) -> Result<DMatrix<f64>> {
        check_obs_dim(sequence, self.obs_dim())?;
        check_counts(sequence)?;
        let y = sequence.observations();
        let k_len = self.num_states();
        Ok(DMatrix::from_fn(sequence.num_timesteps(), k_len, |t, k| {
            (0..self.obs_dim())
                .map(|n| poisson_log_pmf(y[(t, n)], self.rates[(k, n)]))
                .sum()
        }))
    }

    fn closed_form_update(
        &self,
        dataset: &Dataset,
        weights: &[DMatrix<f64>],
        priors: &Priors,
    ) -> Result<Self> {
        check_weights(dataset, weights, self.num_states())?;
        let prior = GammaParams::new(priors.poisson.shape, priors.poisson.rate)
            .ok_or_else(|| Error::Config("gamma prior needs positive shape and rate".into()))?;
        let (k_len, n) = self.rates.shape();
        let mut weighted_sums = DMatrix::zeros(k_len, n);
        let mut totals = vec![0.0; k_len];
        for (seq, w) in dataset.iter().zip(weights) {
            check_obs_dim(seq, n)?;
            let y = seq.observations();
            for t in 0..seq.num_timesteps() {
                for k in 0..k_len {
                    totals[k] += w[(t, k)];
                    for d in 0..n {
                        weighted_sums[(k, d)] += w[(t, k)] * y[(t, d)];
                    }
                }
            }
        }
        let rates = DMatrix::from_fn(k_len, n, |k, d| {
            prior.posterior(weighted_sums[(k, d)], totals[k]).mode()
        });
        Self::new(rates)
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        state: usize,
        _history: &[DVector<f64>],
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        check_state(state, self.num_states())?;
        let mut out = DVector::zeros(self.obs_dim());
        for d in 0..self.obs_dim() {
            let lambda = self.rates[(state, d)];
            if lambda > 0.0 {
                let dist = Poisson::new(lambda)
                    .map_err(|e| Error::Numerical(format!("poisson rate {lambda}: {e}")))?;
                out[d] = dist.sample(&mut *rng);
            }
        }
        Ok(out)
    }

    fn validate_support(&self, dataset: &Dataset) -> Result<()> {
        for (i, seq) in dataset.iter().enumerate() {
            check_counts(seq).map_err(|e| e.in_sequence(i))?;
        }
        Ok(())
    }
}

fn check_counts(sequence: &Sequence) -> Result<()> {
    let y = sequence.observations();
    for t in 0..y.nrows() {
        for v in y.row(t).iter() {
            if *v < 0.0 || v.fract() != 0.0 {
                return Err(Error::Config(format!(
                    "poisson observation {v} at step {t} is not a non-negative count"
                )));
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Categorical
// ----------------------------------------------------------------------------

/// A single categorical observation column with values in `0..C`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalEmissions {
    /// `K × C`, rows sum to one.
    probs: DMatrix<f64>,
}

impl CategoricalEmissions {
    pub fn new(probs: DMatrix<f64>) -> Result<Self> {
        if probs.nrows() == 0 || probs.ncols() == 0 {
            return Err(Error::Config("categorical emissions need at least one state and category".into()));
        }
        for k in 0..probs.nrows() {
            let row = probs.row(k);
            if row.iter().any(|p| !p.is_finite() || *p < 0.0) || (row.sum() - 1.0).abs() > 1e-8 {
                return Err(Error::Config(format!("categorical probabilities of state {k} must sum to 1")));
            }
        }
        Ok(Self { probs })
    }

    /// Uniform over `num_categories` for every state.
    pub fn uniform(num_states: usize, num_categories: usize) -> Result<Self> {
        Self::new(DMatrix::from_element(
            num_states,
            num_categories,
            1.0 / num_categories.max(1) as f64,
        ))
    }

    pub fn num_categories(&self) -> usize {
        self.probs.ncols()
    }

    pub fn probs(&self) -> &DMatrix<f64> {
        &self.probs
    }

    fn category(&self, value: f64, t: usize) -> Result<usize> {
        let c = self.num_categories();
        if value < 0.0 || value.fract() != 0.0 || value >= c as f64 {
            return Err(Error::Config(format!(
                "categorical observation {value} at step {t} is not in 0..{c}"
            )));
        }
        Ok(value as usize)
    }
}

impl ParameterRecord for CategoricalEmissions {
    fn schema(&self) -> ParameterSchema {
        let (k, c) = self.probs.shape();
        ParameterSchema::new(1, vec![FieldSpec::new("probs", FieldKind::Logits, vec![k, c])])
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        writer.logits(&self.probs);
        Ok(())
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let (k, c) = self.probs.shape();
        Self::new(reader.logits(k, c)?)
    }
}

impl Emissions for CategoricalEmissions {
    fn num_states(&self) -> usize {
        self.probs.nrows()
    }

    fn obs_dim(&self) -> usize {
        1
    }

    fn log_likelihoods(&self, sequence: &Sequence) -> Result<DMatrix<f64>> {
        check_obs_dim(sequence, 1)?;
        let t_len = sequence.num_timesteps();
        let mut out = DMatrix::zeros(t_len, self.num_states());
        for t in 0..t_len {
            let c = self.category(sequence.observations()[(t, 0)], t)?;
            for k in 0..self.num_states() {
                out[(t, k)] = self.probs[(k, c)].ln();
            }
        }
        Ok(out)
    }

    fn closed_form_update(
        &self,
        dataset: &Dataset,
        weights: &[DMatrix<f64>],
        priors: &Priors,
    ) -> Result<Self> {
        check_weights(dataset, weights, self.num_states())?;
        let (k_len, c_len) = self.probs.shape();
        let mut counts = DMatrix::zeros(k_len, c_len);
        for (seq, w) in dataset.iter().zip(weights) {
            check_obs_dim(seq, 1)?;
            for t in 0..seq.num_timesteps() {
                let c = self.category(seq.observations()[(t, 0)], t)?;
                for k in 0..k_len {
                    counts[(k, c)] += w[(t, k)];
                }
            }
        }
        let mut probs = DMatrix::zeros(k_len, c_len);
        for k in 0..k_len {
            let row: Vec<f64> = counts.row(k).iter().copied().collect();
            let mode = dirichlet::posterior_mode(priors.categorical_concentration, &row)
                .ok_or_else(|| Error::Config("invalid categorical concentration".into()))?;
            for (c, p) in mode.into_iter().enumerate() {
                probs[(k, c)] = p;
            }
        }
        Self::new(probs)
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        state: usize,
        _history: &[DVector<f64>],
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        check_state(state, self.num_states())?;
        let dist = WeightedIndex::new(self.probs.row(state).iter().copied())
            .map_err(|e| Error::Numerical(format!("categorical probabilities of state {state}: {e}")))?;
        Ok(DVector::from_element(1, dist.sample(rng) as f64))
    }

    fn validate_support(&self, dataset: &Dataset) -> Result<()> {
        for (i, seq) in dataset.iter().enumerate() {
            let column = seq.observations().column(0);
            for (t, v) in column.iter().enumerate() {
                self.category(*v, t).map_err(|e| e.in_sequence(i))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn one_hot(assign: &[usize], k: usize) -> DMatrix<f64> {
        DMatrix::from_fn(assign.len(), k, |t, j| if assign[t] == j { 1.0 } else { 0.0 })
    }

    fn gaussian_2d() -> GaussianEmissions {
        GaussianEmissions::new(
            DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 3.0, -1.0]),
            vec![
                DMatrix::identity(2, 2),
                DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_gaussian_log_likelihoods_match_density() {
        let em = gaussian_2d();
        let seq = Sequence::from_rows(&[
            DVector::from_vec(vec![0.5, 0.2]),
            DVector::from_vec(vec![2.0, -2.0]),
        ])
        .unwrap();
        let ll = em.log_likelihoods(&seq).unwrap();
        for t in 0..2 {
            for k in 0..2 {
                let expected =
                    gaussian::mvn_log_pdf(&seq.observation(t), &em.mean(k), &em.covariances()[k])
                        .unwrap();
                assert!((ll[(t, k)] - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_gaussian_rejects_non_pd() {
        let err = GaussianEmissions::new(
            DMatrix::zeros(1, 2),
            vec![DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0])],
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotPositiveDefinite { .. }));
    }

    fn flat_priors() -> Priors {
        let mut priors = Priors::default();
        priors.gaussian = GaussianPriors::flat();
        priors
    }

    #[test]
    fn test_gaussian_update_is_weighted_mle() {
        let em = GaussianEmissions::with_unit_covariance(DMatrix::zeros(2, 1)).unwrap();
        let seq = Sequence::from_scalars(&[1.0, 3.0, 10.0, 12.0]).unwrap();
        let data = Dataset::from_sequence(seq);
        let w = one_hot(&[0, 0, 1, 1], 2);
        let updated = em.closed_form_update(&data, &[w], &flat_priors()).unwrap();
        assert!((updated.means()[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((updated.means()[(1, 0)] - 11.0).abs() < 1e-12);
        assert!((updated.covariances()[0][(0, 0)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_gaussian_unvisited_state_keeps_params() {
        let em = gaussian_2d();
        let seq = Sequence::from_rows(&[
            DVector::from_vec(vec![1.0, 1.0]),
            DVector::from_vec(vec![2.0, 0.0]),
            DVector::from_vec(vec![0.0, 3.0]),
        ])
        .unwrap();
        let data = Dataset::from_sequence(seq);
        let w = one_hot(&[0, 0, 0], 2);
        let updated = em.closed_form_update(&data, &[w], &Priors::default()).unwrap();
        assert_eq!(updated.mean(1), em.mean(1));
        assert_eq!(updated.covariances()[1], em.covariances()[1]);
    }

    #[test]
    fn test_gaussian_regularizer_is_added() {
        let em = GaussianEmissions::with_unit_covariance(DMatrix::zeros(1, 1)).unwrap();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[1.0, 1.0]).unwrap());
        let mut priors = flat_priors();
        priors.gaussian.covariance_regularization = 0.25;
        let updated = em
            .closed_form_update(&data, &[DMatrix::from_element(2, 1, 1.0)], &priors)
            .unwrap();
        assert!((updated.covariances()[0][(0, 0)] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_gaussian_prior_matches_niw_mode() {
        let em = GaussianEmissions::with_unit_covariance(DMatrix::zeros(1, 1)).unwrap();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[2.0, 4.0]).unwrap());
        let mut priors = Priors::default();
        priors.gaussian.mean_concentration = 2.0;
        priors.gaussian.prior_mean = 0.0;
        priors.gaussian.covariance_scale = 1.0;
        priors.gaussian.covariance_pseudo_count = 3.0;
        let updated = em
            .closed_form_update(&data, &[DMatrix::from_element(2, 1, 1.0)], &priors)
            .unwrap();
        // m = 6 / 4; scatter 0.25 + 6.25 + 2·1.5² + 1 = 12 over 2 + 3
        assert!((updated.means()[(0, 0)] - 1.5).abs() < 1e-12);
        assert!((updated.covariances()[0][(0, 0)] - 12.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_point_state_stays_positive_definite() {
        let means = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 10.0, 10.0]);
        let em = GaussianEmissions::with_unit_covariance(means).unwrap();
        let seq = Sequence::from_rows(&[
            DVector::from_vec(vec![0.0, 0.1]),
            DVector::from_vec(vec![0.1, 0.0]),
            DVector::from_vec(vec![10.0, 10.0]),
        ])
        .unwrap();
        let data = Dataset::from_sequence(seq);
        let w = one_hot(&[0, 0, 1], 2);

        let err = em.closed_form_update(&data, &[w.clone()], &flat_priors()).unwrap_err();
        assert!(matches!(err, Error::NotPositiveDefinite { .. }));

        let updated = em.closed_form_update(&data, &[w], &Priors::default()).unwrap();
        for cov in updated.covariances() {
            assert!(gaussian::cholesky(cov).is_some());
        }
        assert!((updated.means()[(1, 0)] - 10.0).abs() < 1e-2);
    }

    #[test]
    fn test_poisson_update_is_gamma_mode() {
        let em = PoissonEmissions::new(DMatrix::from_element(1, 1, 1.0)).unwrap();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[2.0, 4.0]).unwrap());
        let updated = em
            .closed_form_update(&data, &[DMatrix::from_element(2, 1, 1.0)], &Priors::default())
            .unwrap();
        // (1.1 + 6 − 1) / (0.1 + 2)
        assert!((updated.rates()[(0, 0)] - 6.1 / 2.1).abs() < 1e-12);
    }

    #[test]
    fn test_poisson_log_likelihoods() {
        let em = PoissonEmissions::new(DMatrix::from_row_slice(2, 1, &[1.0, 5.0])).unwrap();
        let seq = Sequence::from_scalars(&[0.0, 3.0]).unwrap();
        let ll = em.log_likelihoods(&seq).unwrap();
        assert!((ll[(0, 0)] - (-1.0)).abs() < 1e-12);
        assert!((ll[(1, 1)] - poisson_log_pmf(3.0, 5.0)).abs() < 1e-12);
        let bad = Sequence::from_scalars(&[-1.0]).unwrap();
        assert!(em.log_likelihoods(&bad).is_err());
    }

    #[test]
    fn test_support_checks_name_sequence_and_step() {
        let pois = PoissonEmissions::new(DMatrix::from_element(2, 1, 1.0)).unwrap();
        let data = Dataset::new(vec![
            Sequence::from_scalars(&[0.0, 3.0, 1.0]).unwrap(),
            Sequence::from_scalars(&[2.0, 2.5, 1.0]).unwrap(),
        ])
        .unwrap();
        let err = pois.validate_support(&data).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let msg = err.to_string();
        assert!(msg.contains("sequence 1") && msg.contains("step 1"), "{msg}");

        let cat = CategoricalEmissions::uniform(2, 3).unwrap();
        let data = Dataset::new(vec![
            Sequence::from_scalars(&[0.0, 2.0]).unwrap(),
            Sequence::from_scalars(&[1.0, 3.0]).unwrap(),
        ])
        .unwrap();
        let msg = cat.validate_support(&data).unwrap_err().to_string();
        assert!(msg.contains("sequence 1") && msg.contains("step 1"), "{msg}");

        let ok = Dataset::from_sequence(Sequence::from_scalars(&[0.0, 1.0, 2.0]).unwrap());
        assert!(cat.validate_support(&ok).is_ok());
        assert!(pois.validate_support(&ok).is_ok());
    }

    #[test]
    fn test_categorical_update_and_validation() {
        let em = CategoricalEmissions::uniform(2, 3).unwrap();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[0.0, 0.0, 2.0]).unwrap());
        let w = one_hot(&[0, 0, 1], 2);
        let updated = em.closed_form_update(&data, &[w], &Priors::default()).unwrap();
        // state 0: counts [2, 0, 0] + 0.1 each, over 2.3
        assert!((updated.probs()[(0, 0)] - 2.1 / 2.3).abs() < 1e-12);
        assert!((updated.probs().row(1).sum() - 1.0).abs() < 1e-12);

        let bad = Sequence::from_scalars(&[1.5]).unwrap();
        assert!(matches!(em.log_likelihoods(&bad), Err(Error::Config(_))));
        let out_of_range = Sequence::from_scalars(&[3.0]).unwrap();
        assert!(em.log_likelihoods(&out_of_range).is_err());
    }

    #[test]
    fn test_expected_log_likelihood_skips_zero_weights() {
        let em = CategoricalEmissions::new(DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.5, 0.5]))
            .unwrap();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[1.0]).unwrap());
        let w = DMatrix::from_row_slice(1, 2, &[0.0, 1.0]);
        let ell = em.expected_log_likelihood(&data, &[w]).unwrap();
        assert!((ell - 0.5f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_samples_have_family_support() {
        let mut rng = StdRng::seed_from_u64(7);
        let cat = CategoricalEmissions::new(DMatrix::from_row_slice(1, 3, &[0.2, 0.0, 0.8])).unwrap();
        let pois = PoissonEmissions::new(DMatrix::from_row_slice(1, 2, &[3.0, 0.0])).unwrap();
        let gauss = gaussian_2d();
        for _ in 0..50 {
            let c = cat.sample(0, &[], &mut rng).unwrap()[0];
            assert!(c == 0.0 || c == 2.0);
            let p = pois.sample(0, &[], &mut rng).unwrap();
            assert!(p[0] >= 0.0 && p[0].fract() == 0.0);
            assert_eq!(p[1], 0.0);
            assert_eq!(gauss.sample(1, &[], &mut rng).unwrap().len(), 2);
        }
        assert!(cat.sample(4, &[], &mut rng).is_err());
    }

    #[test]
    fn test_schemas_recover_records() {
        let g = gaussian_2d();
        let back = g.unflatten(&g.flatten().unwrap()).unwrap();
        assert!((back.covariances()[1][(0, 1)] - 0.5).abs() < 1e-12);
        let p = PoissonEmissions::new(DMatrix::from_element(2, 3, 4.0)).unwrap();
        assert_eq!(p.schema().flat_len(), 6);
        let c = CategoricalEmissions::uniform(2, 4).unwrap();
        assert_eq!(c.schema().fields[0].kind, FieldKind::Logits);
    }
}
