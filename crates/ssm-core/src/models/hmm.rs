//! Hidden Markov model generic over its emission family.
//!
//! Initial and transition distributions carry symmetric Dirichlet priors and
//! are updated to their posterior mode. Emissions update either in closed
//! form or through the gradient collaborator over their flat schema.

use nalgebra::{DMatrix, DVector};
use rand::distr::weighted::WeightedIndex;
use rand::Rng;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use ssm_config::{EmissionUpdate, Priors};
use ssm_math::dirichlet;
use tracing::debug;

use super::emissions::Emissions;
use super::params::{FieldKind, FieldSpec, FlatParams, FlatReader, FlatWriter, ParameterRecord, ParameterSchema};
use super::{MStepContext, StateSpaceModel};
use crate::data::{Dataset, Sequence};
use crate::fit::init::StateInitializer;
use crate::fit::optimize::GradientOptimizer;
use crate::inference::{
    discrete_natural_params, filtered_states, hmm_posterior, most_likely_states,
    DiscreteNaturalParams, HmmPosterior,
};

const PROB_TOL: f64 = 1e-8;

/// Parameter record of an HMM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmmParams<E> {
    pub initial_probs: DVector<f64>,
    /// Row-stochastic `K × K`.
    pub transition_matrix: DMatrix<f64>,
    pub emissions: E,
}

pub(crate) fn check_distribution(what: &str, probs: &[f64]) -> Result<()> {
    if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(Error::NonFiniteInput(format!("{what} must be finite and non-negative")));
    }
    let total: f64 = probs.iter().sum();
    if (total - 1.0).abs() > PROB_TOL {
        return Err(Error::Config(format!("{what} sums to {total}, expected 1")));
    }
    Ok(())
}

impl<E: Emissions> HmmParams<E> {
    pub fn new(initial_probs: DVector<f64>, transition_matrix: DMatrix<f64>, emissions: E) -> Result<Self> {
        let params = Self {
            initial_probs,
            transition_matrix,
            emissions,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn num_states(&self) -> usize {
        self.emissions.num_states()
    }

    pub fn validate(&self) -> Result<()> {
        let k = self.num_states();
        if k == 0 {
            return Err(Error::Config("HMM needs at least one state".into()));
        }
        if self.initial_probs.len() != k {
            return Err(Error::DimensionMismatch {
                what: "initial distribution".to_string(),
                expected: k,
                got: self.initial_probs.len(),
            });
        }
        if self.transition_matrix.shape() != (k, k) {
            return Err(Error::DimensionMismatch {
                what: "transition matrix".to_string(),
                expected: k * k,
                got: self.transition_matrix.len(),
            });
        }
        check_distribution("initial distribution", self.initial_probs.as_slice())?;
        for i in 0..k {
            let row: Vec<f64> = self.transition_matrix.row(i).iter().copied().collect();
            check_distribution(&format!("transition row {i}"), &row)?;
        }
        Ok(())
    }
}

impl<E: Emissions> ParameterRecord for HmmParams<E> {
    fn schema(&self) -> ParameterSchema {
        let k = self.num_states();
        let mut schema = ParameterSchema::new(
            1,
            vec![
                FieldSpec::new("initial_probs", FieldKind::Logits, vec![1, k]),
                FieldSpec::new("transition_matrix", FieldKind::Logits, vec![k, k]),
            ],
        );
        schema.extend_prefixed("emissions", self.emissions.schema());
        schema
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        writer.logits(&DMatrix::from_row_slice(1, self.num_states(), self.initial_probs.as_slice()));
        writer.logits(&self.transition_matrix);
        self.emissions.write_fields(writer)
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let k = self.num_states();
        let initial = reader.logits(1, k)?;
        let transition_matrix = reader.logits(k, k)?;
        let emissions = self.emissions.read_fields(reader)?;
        Self::new(initial.row(0).transpose(), transition_matrix, emissions)
    }
}

/// HMM with emission family `E`.
#[derive(Debug, Clone)]
pub struct Hmm<E> {
    params: HmmParams<E>,
}

impl<E: Emissions> Hmm<E> {
    pub fn new(params: HmmParams<E>) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    /// Uniform initial distribution and a transition matrix with
    /// `self_transition` on the diagonal, the rest spread evenly.
    pub fn from_emissions(emissions: E, self_transition: f64) -> Result<Self> {
        let k = emissions.num_states();
        if !(0.0..=1.0).contains(&self_transition) {
            return Err(Error::Config(format!(
                "self-transition probability {self_transition} not in [0, 1]"
            )));
        }
        let off = if k > 1 {
            (1.0 - self_transition) / (k - 1) as f64
        } else {
            0.0
        };
        let transition = DMatrix::from_fn(k, k, |i, j| {
            if i == j {
                if k == 1 {
                    1.0
                } else {
                    self_transition
                }
            } else {
                off
            }
        });
        let initial = DVector::from_element(k, 1.0 / k.max(1) as f64);
        Self::new(HmmParams::new(initial, transition, emissions)?)
    }

    pub fn num_states(&self) -> usize {
        self.params.num_states()
    }

    pub fn emissions(&self) -> &E {
        &self.params.emissions
    }

    /// Natural parameters for one sequence.
    pub fn natural_params(&self, sequence: &Sequence) -> Result<DiscreteNaturalParams> {
        discrete_natural_params(
            &self.params.initial_probs,
            &self.params.transition_matrix,
            self.params.emissions.log_likelihoods(sequence)?,
        )
    }

    pub fn infer_posterior(&self, sequence: &Sequence) -> Result<HmmPosterior> {
        hmm_posterior(&self.natural_params(sequence)?)
    }

    /// Viterbi path.
    pub fn most_likely_states(&self, sequence: &Sequence) -> Result<Vec<usize>> {
        most_likely_states(&self.natural_params(sequence)?)
    }

    pub fn filtered_states(&self, sequence: &Sequence) -> Result<DMatrix<f64>> {
        filtered_states(&self.natural_params(sequence)?)
    }

    /// Draws `(states, observations)` of length `num_timesteps`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        num_timesteps: usize,
        rng: &mut R,
    ) -> Result<(Vec<usize>, Sequence)> {
        if num_timesteps == 0 {
            return Err(Error::Config("cannot sample an empty sequence".into()));
        }
        let p = &self.params;
        let initial = WeightedIndex::new(p.initial_probs.iter().copied())
            .map_err(|e| Error::Numerical(format!("initial distribution: {e}")))?;
        let rows = (0..self.num_states())
            .map(|i| {
                WeightedIndex::new(p.transition_matrix.row(i).iter().copied())
                    .map_err(|e| Error::Numerical(format!("transition row {i}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut states = Vec::with_capacity(num_timesteps);
        let mut z = initial.sample(&mut *rng);
        states.push(z);
        for _ in 1..num_timesteps {
            z = rows[z].sample(&mut *rng);
            states.push(z);
        }
        let mut observations = Vec::with_capacity(num_timesteps);
        for &k in &states {
            let y = p.emissions.sample(k, &observations, &mut *rng)?;
            observations.push(y);
        }
        Ok((states, Sequence::from_rows(&observations)?))
    }

    /// One emission M-step from the initializer's hard assignments.
    pub fn initialize(
        &mut self,
        dataset: &Dataset,
        initializer: &dyn StateInitializer,
        priors: &Priors,
    ) -> Result<()> {
        self.validate_dataset(dataset)?;
        let k = self.num_states();
        let assignments = initializer.assign(dataset, k)?;
        if assignments.len() != dataset.len() {
            return Err(Error::DimensionMismatch {
                what: "assignment sequences".to_string(),
                expected: dataset.len(),
                got: assignments.len(),
            });
        }
        let weights = assignments
            .iter()
            .zip(dataset.iter())
            .map(|(a, seq)| one_hot(a, seq.num_timesteps(), k))
            .collect::<Result<Vec<_>>>()?;
        let emissions = self
            .params
            .emissions
            .closed_form_update(dataset, &weights, priors)?;
        debug!(num_states = k, "initialized emissions from hard assignments");
        self.params.emissions = emissions;
        Ok(())
    }
}

pub(crate) fn one_hot(assignments: &[usize], num_timesteps: usize, k: usize) -> Result<DMatrix<f64>> {
    if assignments.len() != num_timesteps {
        return Err(Error::DimensionMismatch {
            what: "assignments per sequence".to_string(),
            expected: num_timesteps,
            got: assignments.len(),
        });
    }
    if let Some(bad) = assignments.iter().find(|&&a| a >= k) {
        return Err(Error::Config(format!("assignment {bad} out of range for {k} states")));
    }
    Ok(DMatrix::from_fn(num_timesteps, k, |t, j| {
        if assignments[t] == j {
            1.0
        } else {
            0.0
        }
    }))
}

/// Minimizes the per-step expected negative log-likelihood of `emissions`
/// over its flat schema.
fn gradient_emission_update<E: Emissions>(
    emissions: &E,
    dataset: &Dataset,
    weights: &[DMatrix<f64>],
    optimizer: &dyn GradientOptimizer,
    max_iters: u64,
) -> Result<E> {
    let start = emissions.flatten()?;
    let version = start.schema_version;
    let scale = weights.iter().map(|w| w.sum()).sum::<f64>().max(1.0);
    let objective = |x: &[f64]| -> f64 {
        let flat = FlatParams {
            schema_version: version,
            values: x.to_vec(),
        };
        emissions
            .unflatten(&flat)
            .and_then(|e| e.expected_log_likelihood(dataset, weights))
            .map(|ell| -ell / scale)
            .unwrap_or(f64::INFINITY)
    };
    let best = optimizer.minimize(&objective, start.values, max_iters)?;
    emissions.unflatten(&FlatParams {
        schema_version: version,
        values: best,
    })
}

impl<E: Emissions> StateSpaceModel for Hmm<E> {
    type Params = HmmParams<E>;
    type Posterior = HmmPosterior;

    fn params(&self) -> &HmmParams<E> {
        &self.params
    }

    fn replace_params(&mut self, params: HmmParams<E>) -> HmmParams<E> {
        std::mem::replace(&mut self.params, params)
    }

    fn validate_dataset(&self, dataset: &Dataset) -> Result<()> {
        check_emission_data(&self.params.emissions, dataset)
    }

    fn e_step(&self, dataset: &Dataset) -> Result<Vec<HmmPosterior>> {
        dataset
            .iter()
            .enumerate()
            .map(|(i, seq)| self.infer_posterior(seq).map_err(|e| e.in_sequence(i)))
            .collect()
    }

    fn m_step(
        &self,
        dataset: &Dataset,
        posteriors: &[HmmPosterior],
        ctx: &MStepContext<'_>,
    ) -> Result<HmmParams<E>> {
        if posteriors.len() != dataset.len() {
            return Err(Error::DimensionMismatch {
                what: "number of posteriors".to_string(),
                expected: dataset.len(),
                got: posteriors.len(),
            });
        }
        let k = self.num_states();
        let priors = ctx.priors;

        let initial_counts = posteriors
            .iter()
            .fold(DVector::zeros(k), |acc, p| acc + p.initial_state_probs());
        let transition_counts = posteriors
            .iter()
            .fold(DMatrix::zeros(k, k), |acc, p| acc + p.expected_transition_counts());
        let (initial, transition) = markov_mode(&initial_counts, &transition_counts, priors)?;

        let weights: Vec<DMatrix<f64>> =
            posteriors.iter().map(|p| p.expected_states().clone()).collect();
        let emissions = update_emissions(&self.params.emissions, dataset, &weights, ctx)?;

        HmmParams::new(initial, transition, emissions)
    }
}

/// Observation dimension, finiteness and support of `dataset` under `emissions`.
pub(crate) fn check_emission_data<E: Emissions>(emissions: &E, dataset: &Dataset) -> Result<()> {
    let n = emissions.obs_dim();
    if dataset.obs_dim() != n {
        return Err(Error::DimensionMismatch {
            what: "observation dimension".to_string(),
            expected: n,
            got: dataset.obs_dim(),
        });
    }
    dataset.check_finite()?;
    emissions.validate_support(dataset)
}

/// Dirichlet posterior modes of an initial distribution and a transition
/// matrix from their expected counts.
pub(crate) fn markov_mode(
    initial_counts: &DVector<f64>,
    transition_counts: &DMatrix<f64>,
    priors: &Priors,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let k = initial_counts.len();
    let initial = dirichlet::posterior_mode(priors.initial_concentration, initial_counts.as_slice())
        .ok_or_else(|| Error::Config("invalid initial concentration".into()))?;
    let mut transition = DMatrix::zeros(k, k);
    for i in 0..k {
        let row: Vec<f64> = transition_counts.row(i).iter().copied().collect();
        let mode = dirichlet::posterior_mode(priors.transition_concentration, &row)
            .ok_or_else(|| Error::Config("invalid transition concentration".into()))?;
        for (j, p) in mode.into_iter().enumerate() {
            transition[(i, j)] = p;
        }
    }
    Ok((DVector::from_vec(initial), transition))
}

/// Emission M-step in the mode `ctx.fit` selects.
pub(crate) fn update_emissions<E: Emissions>(
    emissions: &E,
    dataset: &Dataset,
    weights: &[DMatrix<f64>],
    ctx: &MStepContext<'_>,
) -> Result<E> {
    match ctx.fit.emission_update {
        EmissionUpdate::ClosedForm => emissions.closed_form_update(dataset, weights, ctx.priors),
        EmissionUpdate::Gradient => {
            let optimizer = ctx.optimizer.ok_or_else(|| {
                Error::MissingCollaborator(
                    "gradient emission update requested without an optimizer".into(),
                )
            })?;
            gradient_emission_update(
                emissions,
                dataset,
                weights,
                optimizer,
                ctx.fit.optimizer_max_iters,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::init::RandomAssignment;
    use crate::fit::optimize::LbfgsOptimizer;
    use crate::inference::Posterior;
    use crate::models::emissions::{CategoricalEmissions, GaussianEmissions, PoissonEmissions};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use ssm_config::FitConfig;

    fn gaussian_hmm() -> Hmm<GaussianEmissions> {
        let em = GaussianEmissions::with_unit_covariance(DMatrix::from_column_slice(2, 1, &[-2.0, 2.0]))
            .unwrap();
        Hmm::from_emissions(em, 0.9).unwrap()
    }

    #[test]
    fn test_params_validation() {
        let em = PoissonEmissions::new(DMatrix::from_element(2, 1, 1.0)).unwrap();
        let bad_rows = DMatrix::from_row_slice(2, 2, &[0.5, 0.4, 0.5, 0.5]);
        let err = HmmParams::new(DVector::from_vec(vec![0.5, 0.5]), bad_rows, em.clone()).unwrap_err();
        assert!(err.to_string().contains("transition row 0"));
        let err = HmmParams::new(DVector::from_vec(vec![1.0]), DMatrix::identity(2, 2), em).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn test_from_emissions_single_state() {
        let em = PoissonEmissions::new(DMatrix::from_element(1, 1, 2.0)).unwrap();
        let hmm = Hmm::from_emissions(em, 0.3).unwrap();
        assert_eq!(hmm.params().transition_matrix[(0, 0)], 1.0);
    }

    #[test]
    fn test_e_step_names_failing_sequence() {
        let em = CategoricalEmissions::new(DMatrix::from_row_slice(1, 2, &[1.0, 0.0])).unwrap();
        let hmm = Hmm::from_emissions(em, 1.0).unwrap();
        let data = Dataset::new(vec![
            Sequence::from_scalars(&[0.0, 0.0]).unwrap(),
            Sequence::from_scalars(&[0.0, 1.0]).unwrap(),
        ])
        .unwrap();
        let err = hmm.e_step(&data).unwrap_err();
        assert!(matches!(err, Error::ZeroProbabilitySequence { sequence: 1 }));
    }

    #[test]
    fn test_unsupported_symbols_fail_before_inference() {
        let em = CategoricalEmissions::uniform(2, 2).unwrap();
        let mut hmm = Hmm::from_emissions(em, 0.9).unwrap();
        let before = hmm.params().clone();
        let data = Dataset::new(vec![
            Sequence::from_scalars(&[0.0, 1.0, 1.0]).unwrap(),
            Sequence::from_scalars(&[1.0, 0.0, 2.0]).unwrap(),
        ])
        .unwrap();
        assert!(matches!(hmm.validate_dataset(&data), Err(Error::Config(_))));

        let config = FitConfig::default().with_num_iters(5);
        let err = crate::fit::fit_em(&mut hmm, &data, &config, &Priors::default()).unwrap_err();
        assert!(err.to_string().contains("sequence 1"));
        assert_eq!(hmm.params(), &before);
    }

    #[test]
    fn test_fractional_counts_rejected_by_poisson_hmm() {
        let em = PoissonEmissions::new(DMatrix::from_element(2, 1, 1.0)).unwrap();
        let mut hmm = Hmm::from_emissions(em, 0.5).unwrap();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[1.0, 0.5]).unwrap());
        let err = hmm
            .initialize(&data, &RandomAssignment::new(0), &Priors::default())
            .unwrap_err();
        assert_eq!(err.code(), 10);
    }

    #[test]
    fn test_m_step_uses_dirichlet_mode() {
        let hmm = gaussian_hmm();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[-2.0, -2.1, 2.0, 2.2]).unwrap());
        let posts = hmm.e_step(&data).unwrap();
        let fit = FitConfig::default();
        let priors = Priors::default();
        let next = hmm.m_step(&data, &posts, &MStepContext::new(&fit, &priors)).unwrap();
        assert!((next.initial_probs.sum() - 1.0).abs() < 1e-12);
        for i in 0..2 {
            assert!((next.transition_matrix.row(i).sum() - 1.0).abs() < 1e-12);
        }
        // Prior pseudo-counts keep every entry strictly positive.
        assert!(next.transition_matrix.iter().all(|p| *p > 0.0));
        assert!(next.emissions.means()[(0, 0)] < 0.0);
    }

    #[test]
    fn test_gradient_m_step_requires_optimizer() {
        let hmm = gaussian_hmm();
        let data = Dataset::from_sequence(Sequence::from_scalars(&[-2.0, 2.0]).unwrap());
        let posts = hmm.e_step(&data).unwrap();
        let fit = FitConfig::default().with_emission_update(EmissionUpdate::Gradient);
        let priors = Priors::default();
        let err = hmm.m_step(&data, &posts, &MStepContext::new(&fit, &priors)).unwrap_err();
        assert!(matches!(err, Error::MissingCollaborator(_)));
    }

    #[test]
    fn test_gradient_m_step_improves_poisson_rates() {
        let em = PoissonEmissions::new(DMatrix::from_row_slice(2, 1, &[1.0, 1.5])).unwrap();
        let hmm = Hmm::from_emissions(em, 0.8).unwrap();
        let data = Dataset::from_sequence(
            Sequence::from_scalars(&[0.0, 1.0, 0.0, 9.0, 11.0, 10.0]).unwrap(),
        );
        let posts = hmm.e_step(&data).unwrap();
        let weights: Vec<_> = posts.iter().map(|p| p.expected_states().clone()).collect();
        let before = hmm.emissions().expected_log_likelihood(&data, &weights).unwrap();

        let fit = FitConfig::default().with_emission_update(EmissionUpdate::Gradient);
        let priors = Priors::default();
        let optimizer = LbfgsOptimizer::default();
        let ctx = MStepContext::new(&fit, &priors).with_optimizer(&optimizer);
        let next = hmm.m_step(&data, &posts, &ctx).unwrap();
        let after = next.emissions.expected_log_likelihood(&data, &weights).unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_sample_then_decode() {
        let em = GaussianEmissions::new(
            DMatrix::from_column_slice(2, 1, &[-5.0, 5.0]),
            vec![DMatrix::from_element(1, 1, 0.1); 2],
        )
        .unwrap();
        let hmm = Hmm::from_emissions(em, 0.9).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let (states, seq) = hmm.sample(40, &mut rng).unwrap();
        assert_eq!(seq.num_timesteps(), 40);
        assert_eq!(hmm.most_likely_states(&seq).unwrap(), states);
        let filtered = hmm.filtered_states(&seq).unwrap();
        assert_eq!(filtered.shape(), (40, 2));
    }

    #[test]
    fn test_initialize_from_assignments() {
        let mut hmm = gaussian_hmm();
        let data = Dataset::from_sequence(
            Sequence::from_scalars(&[0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5]).unwrap(),
        );
        let mut priors = Priors::default();
        priors.gaussian.covariance_regularization = 0.1;
        hmm.initialize(&data, &RandomAssignment::new(5), &priors).unwrap();
        let posts = hmm.e_step(&data).unwrap();
        assert!(posts[0].marginal_log_likelihood().is_finite());
    }

    #[test]
    fn test_record_schema_prefixes_emissions() {
        let hmm = gaussian_hmm();
        let schema = hmm.params().schema();
        assert_eq!(schema.fields[2].name, "emissions.means");
        let flat = hmm.params().flatten().unwrap();
        let back = hmm.params().unflatten(&flat).unwrap();
        assert!((back.transition_matrix[(0, 0)] - 0.9).abs() < 1e-12);
    }
}
