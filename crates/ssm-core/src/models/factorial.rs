//! Factorial HMM: several independent Markov chains jointly drive one
//! emission distribution.
//!
//! Inference runs exact forward-backward over the product state space.
//! Product states are flattened in row-major order with the last group
//! varying fastest. The product transition matrix is the elementwise product
//! of the per-group transitions. The M-step marginalizes the product
//! posterior onto each group, so every chain keeps its own Dirichlet update.

use nalgebra::{DMatrix, DVector};
use rand::distr::weighted::WeightedIndex;
use rand::Rng;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use ssm_config::Priors;
use ssm_math::gaussian::{self, LN_2PI};
use tracing::debug;

use super::emissions::{check_obs_dim, check_state, check_weights, Emissions, MIN_STATE_WEIGHT};
use super::hmm::{check_distribution, check_emission_data, markov_mode, one_hot, update_emissions};
use super::params::{FieldKind, FieldSpec, FlatReader, FlatWriter, ParameterRecord, ParameterSchema};
use super::{sample_mvn, MStepContext, StateSpaceModel};
use crate::data::{Dataset, Sequence};
use crate::fit::init::StateInitializer;
use crate::inference::{
    discrete_natural_params, filtered_states, hmm_posterior, most_likely_states,
    DiscreteNaturalParams, HmmPosterior,
};

/// Index arithmetic over the joint states of several discrete groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSpace {
    sizes: Vec<usize>,
}

impl ProductSpace {
    pub fn new(sizes: Vec<usize>) -> Result<Self> {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(Error::Config(format!(
                "factorial model needs at least one group and one state per group, got {sizes:?}"
            )));
        }
        Ok(Self { sizes })
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn num_groups(&self) -> usize {
        self.sizes.len()
    }

    /// Number of joint states.
    pub fn num_states(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Flat index of one state per group.
    pub fn index(&self, states: &[usize]) -> Result<usize> {
        if states.len() != self.sizes.len() {
            return Err(Error::DimensionMismatch {
                what: "states per joint state".to_string(),
                expected: self.sizes.len(),
                got: states.len(),
            });
        }
        let mut index = 0;
        for (&s, &k) in states.iter().zip(&self.sizes) {
            check_state(s, k)?;
            index = index * k + s;
        }
        Ok(index)
    }

    /// Per-group states of a flat index.
    pub fn states(&self, mut index: usize) -> Vec<usize> {
        let mut out = vec![0; self.sizes.len()];
        for (slot, &k) in out.iter_mut().zip(&self.sizes).rev() {
            *slot = index % k;
            index /= k;
        }
        out
    }

    /// Collapse a `T × S` joint posterior onto group `group` (`T × K_g`).
    pub fn marginalize(&self, joint: &DMatrix<f64>, group: usize) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(joint.nrows(), self.sizes[group]);
        for s in 0..joint.ncols() {
            let g = self.states(s)[group];
            let mut col = out.column_mut(g);
            col += joint.column(s);
        }
        out
    }
}

// ----------------------------------------------------------------------------
// Emissions
// ----------------------------------------------------------------------------

/// Gaussian emissions whose mean is the sum of one contribution per group,
/// `y_t ~ N(Σ_g μ_{g, z_{tg}}, diag(σ²))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalFactorialEmissions {
    space: ProductSpace,
    /// One `K_g × N` matrix per group.
    means: Vec<DMatrix<f64>>,
    /// Per-dimension variance shared by every joint state.
    variances: DVector<f64>,
}

impl NormalFactorialEmissions {
    pub fn new(means: Vec<DMatrix<f64>>, variances: DVector<f64>) -> Result<Self> {
        let space = ProductSpace::new(means.iter().map(|m| m.nrows()).collect())?;
        let n = variances.len();
        if n == 0 {
            return Err(Error::Config("factorial emissions need at least one dimension".into()));
        }
        for (g, m) in means.iter().enumerate() {
            if m.ncols() != n {
                return Err(Error::DimensionMismatch {
                    what: format!("mean columns of group {g}"),
                    expected: n,
                    got: m.ncols(),
                });
            }
            if m.iter().any(|v| !v.is_finite()) {
                return Err(Error::NonFiniteInput(format!("means of group {g}")));
            }
        }
        if variances.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(Error::NotPositiveDefinite {
                what: "factorial emission variances".to_string(),
                step: None,
            });
        }
        Ok(Self {
            space,
            means,
            variances,
        })
    }

    pub fn space(&self) -> &ProductSpace {
        &self.space
    }

    pub fn means(&self) -> &[DMatrix<f64>] {
        &self.means
    }

    pub fn variances(&self) -> &DVector<f64> {
        &self.variances
    }

    /// Summed mean of a joint state.
    pub fn state_mean(&self, state: usize) -> DVector<f64> {
        let mut mean = DVector::zeros(self.obs_dim());
        for (m, s) in self.means.iter().zip(self.space.states(state)) {
            mean += m.row(s).transpose();
        }
        mean
    }

    /// Offsets of each group's block in the stacked design vector.
    fn offsets(&self) -> Vec<usize> {
        self.space
            .sizes()
            .iter()
            .scan(0, |acc, &k| {
                let start = *acc;
                *acc += k;
                Some(start)
            })
            .collect()
    }
}

impl ParameterRecord for NormalFactorialEmissions {
    fn schema(&self) -> ParameterSchema {
        let n = self.obs_dim();
        let mut fields: Vec<FieldSpec> = self
            .means
            .iter()
            .enumerate()
            .map(|(g, m)| FieldSpec::new(format!("means.{g}"), FieldKind::Matrix, vec![m.nrows(), n]))
            .collect();
        fields.push(FieldSpec::new("variances", FieldKind::LogRates, vec![1, n]));
        ParameterSchema::new(1, fields)
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        for m in &self.means {
            writer.matrix(m);
        }
        writer.log_rates(&DMatrix::from_row_slice(1, self.obs_dim(), self.variances.as_slice()));
        Ok(())
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let n = self.obs_dim();
        let means = self
            .means
            .iter()
            .map(|m| reader.matrix(m.nrows(), n))
            .collect::<Result<Vec<_>>>()?;
        let variances = reader.log_rates(1, n)?;
        Self::new(means, variances.row(0).transpose())
    }
}

impl Emissions for NormalFactorialEmissions {
    fn num_states(&self) -> usize {
        self.space.num_states()
    }

    fn obs_dim(&self) -> usize {
        self.variances.len()
    }

    fn log_likelihoods(&self, sequence: &Sequence) -> Result<DMatrix<f64>> {
        check_obs_dim(sequence, self.obs_dim())?;
        let norm: f64 = self
            .variances
            .iter()
            .map(|v| -0.5 * (LN_2PI + v.ln()))
            .sum();
        let mut out = DMatrix::zeros(sequence.num_timesteps(), self.num_states());
        for s in 0..self.num_states() {
            let mean = self.state_mean(s);
            for t in 0..sequence.num_timesteps() {
                let quad: f64 = sequence
                    .observations()
                    .row(t)
                    .iter()
                    .zip(mean.iter().zip(self.variances.iter()))
                    .map(|(y, (m, v))| (y - m).powi(2) / v)
                    .sum();
                out[(t, s)] = norm - 0.5 * quad;
            }
        }
        Ok(out)
    }

    /// Ridge least squares of the observations on the stacked one-hot group
    /// indicators, then the residual variance per dimension.
    fn closed_form_update(
        &self,
        dataset: &Dataset,
        weights: &[DMatrix<f64>],
        priors: &Priors,
    ) -> Result<Self> {
        let num_states = self.num_states();
        check_weights(dataset, weights, num_states)?;
        let n = self.obs_dim();
        let prior = &priors.gaussian;
        let offsets = self.offsets();
        let width: usize = self.space.sizes().iter().sum();

        // Per joint state: total weight and weighted observation sum.
        let mut state_weight = vec![0.0; num_states];
        let mut state_sum = DMatrix::<f64>::zeros(num_states, n);
        for (seq, w) in dataset.iter().zip(weights) {
            check_obs_dim(seq, n)?;
            state_sum += w.transpose() * seq.observations();
            for (s, total) in state_weight.iter_mut().enumerate() {
                *total += w.column(s).sum();
            }
        }
        let w_total: f64 = state_weight.iter().sum();
        if w_total < MIN_STATE_WEIGHT {
            return Ok(self.clone());
        }

        let mut gram = DMatrix::<f64>::identity(width, width) * prior.mean_concentration;
        let mut cross = DMatrix::<f64>::zeros(width, n);
        for s in 0..num_states {
            let active: Vec<usize> = self
                .space
                .states(s)
                .iter()
                .zip(&offsets)
                .map(|(k, off)| off + k)
                .collect();
            for &i in &active {
                for &j in &active {
                    gram[(i, j)] += state_weight[s];
                }
                let mut row = cross.row_mut(i);
                row += state_sum.row(s);
            }
        }
        let stacked = match gaussian::cholesky(&gram) {
            Some(chol) => chol.solve(&cross),
            // Without a ridge the group offsets are not identifiable.
            None => {
                gram.pseudo_inverse(1e-12)
                    .map_err(|e| Error::Numerical(format!("factorial mean update: {e}")))?
                    * cross
            }
        };
        let means: Vec<DMatrix<f64>> = self
            .space
            .sizes()
            .iter()
            .zip(&offsets)
            .map(|(&k, &off)| stacked.rows(off, k).into_owned())
            .collect();
        let mut next = Self::new(means, self.variances.clone())?;

        let mut scatter = stacked.column_iter().map(|c| c.norm_squared()).collect::<Vec<_>>();
        for v in scatter.iter_mut() {
            *v *= prior.mean_concentration;
        }
        for s in 0..num_states {
            let mean = next.state_mean(s);
            for (seq, w) in dataset.iter().zip(weights) {
                for t in 0..seq.num_timesteps() {
                    let wt = w[(t, s)];
                    if wt == 0.0 {
                        continue;
                    }
                    for (d, v) in scatter.iter_mut().enumerate() {
                        *v += wt * (seq.observations()[(t, d)] - mean[d]).powi(2);
                    }
                }
            }
        }
        next.variances = DVector::from_iterator(
            n,
            scatter.into_iter().map(|v| {
                (v + prior.covariance_scale) / (w_total + prior.covariance_pseudo_count)
                    + prior.covariance_regularization
            }),
        );
        Self::new(next.means, next.variances)
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        state: usize,
        _history: &[DVector<f64>],
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        check_state(state, self.num_states())?;
        sample_mvn(
            &self.state_mean(state),
            &DMatrix::from_diagonal(&self.variances),
            rng,
            "factorial emission variances",
        )
    }
}

// ----------------------------------------------------------------------------
// Model
// ----------------------------------------------------------------------------

/// Initial distribution and transition matrix of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkovChain {
    pub initial_probs: DVector<f64>,
    pub transition_matrix: DMatrix<f64>,
}

impl MarkovChain {
    pub fn new(initial_probs: DVector<f64>, transition_matrix: DMatrix<f64>) -> Result<Self> {
        let chain = Self {
            initial_probs,
            transition_matrix,
        };
        chain.validate()?;
        Ok(chain)
    }

    /// Uniform start with `self_transition` on the diagonal.
    pub fn sticky(num_states: usize, self_transition: f64) -> Result<Self> {
        if num_states == 0 || !(0.0..=1.0).contains(&self_transition) {
            return Err(Error::Config(format!(
                "sticky chain needs states and a probability, got {num_states} and {self_transition}"
            )));
        }
        let stay = if num_states == 1 { 1.0 } else { self_transition };
        let off = if num_states > 1 {
            (1.0 - self_transition) / (num_states - 1) as f64
        } else {
            0.0
        };
        Self::new(
            DVector::from_element(num_states, 1.0 / num_states as f64),
            DMatrix::from_fn(num_states, num_states, |i, j| if i == j { stay } else { off }),
        )
    }

    pub fn num_states(&self) -> usize {
        self.initial_probs.len()
    }

    fn validate(&self) -> Result<()> {
        let k = self.num_states();
        if k == 0 {
            return Err(Error::Config("chain needs at least one state".into()));
        }
        if self.transition_matrix.shape() != (k, k) {
            return Err(Error::DimensionMismatch {
                what: "chain transition matrix".to_string(),
                expected: k * k,
                got: self.transition_matrix.len(),
            });
        }
        check_distribution("chain initial distribution", self.initial_probs.as_slice())?;
        for i in 0..k {
            let row: Vec<f64> = self.transition_matrix.row(i).iter().copied().collect();
            check_distribution(&format!("chain transition row {i}"), &row)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorialHmmParams<E> {
    pub chains: Vec<MarkovChain>,
    /// Defined over the joint states.
    pub emissions: E,
}

impl<E: Emissions> FactorialHmmParams<E> {
    pub fn new(chains: Vec<MarkovChain>, emissions: E) -> Result<Self> {
        let params = Self { chains, emissions };
        params.space()?;
        Ok(params)
    }

    /// Product space of the chains, checked against the emissions.
    pub fn space(&self) -> Result<ProductSpace> {
        let space = ProductSpace::new(self.chains.iter().map(MarkovChain::num_states).collect())?;
        if space.num_states() != self.emissions.num_states() {
            return Err(Error::DimensionMismatch {
                what: "joint states of factorial emissions".to_string(),
                expected: space.num_states(),
                got: self.emissions.num_states(),
            });
        }
        for chain in &self.chains {
            chain.validate()?;
        }
        Ok(space)
    }
}

impl<E: Emissions> ParameterRecord for FactorialHmmParams<E> {
    fn schema(&self) -> ParameterSchema {
        let mut fields = Vec::with_capacity(2 * self.chains.len());
        for (g, chain) in self.chains.iter().enumerate() {
            let k = chain.num_states();
            fields.push(FieldSpec::new(format!("chains.{g}.initial_probs"), FieldKind::Logits, vec![1, k]));
            fields.push(FieldSpec::new(
                format!("chains.{g}.transition_matrix"),
                FieldKind::Logits,
                vec![k, k],
            ));
        }
        let mut schema = ParameterSchema::new(1, fields);
        schema.extend_prefixed("emissions", self.emissions.schema());
        schema
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        for chain in &self.chains {
            let k = chain.num_states();
            writer.logits(&DMatrix::from_row_slice(1, k, chain.initial_probs.as_slice()));
            writer.logits(&chain.transition_matrix);
        }
        self.emissions.write_fields(writer)
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let chains = self
            .chains
            .iter()
            .map(|chain| {
                let k = chain.num_states();
                let initial = reader.logits(1, k)?;
                let transition = reader.logits(k, k)?;
                MarkovChain::new(initial.row(0).transpose(), transition)
            })
            .collect::<Result<Vec<_>>>()?;
        let emissions = self.emissions.read_fields(reader)?;
        Self::new(chains, emissions)
    }
}

/// Factorial HMM with emission family `E` over the joint states.
#[derive(Debug, Clone)]
pub struct FactorialHmm<E> {
    params: FactorialHmmParams<E>,
    space: ProductSpace,
}

impl<E: Emissions> FactorialHmm<E> {
    pub fn new(params: FactorialHmmParams<E>) -> Result<Self> {
        let space = params.space()?;
        Ok(Self { params, space })
    }

    /// Sticky chains sized from `sizes` around the given emissions.
    pub fn from_emissions(sizes: &[usize], emissions: E, self_transition: f64) -> Result<Self> {
        let chains = sizes
            .iter()
            .map(|&k| MarkovChain::sticky(k, self_transition))
            .collect::<Result<Vec<_>>>()?;
        Self::new(FactorialHmmParams::new(chains, emissions)?)
    }

    pub fn space(&self) -> &ProductSpace {
        &self.space
    }

    pub fn emissions(&self) -> &E {
        &self.params.emissions
    }

    /// `π(s) = Π_g π_g(s_g)`.
    pub fn joint_initial_probs(&self) -> DVector<f64> {
        DVector::from_fn(self.space.num_states(), |s, _| {
            self.space
                .states(s)
                .iter()
                .zip(&self.params.chains)
                .map(|(&k, chain)| chain.initial_probs[k])
                .product()
        })
    }

    /// `P(s, s') = Π_g A_g(s_g, s'_g)`.
    pub fn joint_transition_matrix(&self) -> DMatrix<f64> {
        let decoded: Vec<Vec<usize>> = (0..self.space.num_states())
            .map(|s| self.space.states(s))
            .collect();
        DMatrix::from_fn(decoded.len(), decoded.len(), |i, j| {
            self.params
                .chains
                .iter()
                .enumerate()
                .map(|(g, chain)| chain.transition_matrix[(decoded[i][g], decoded[j][g])])
                .product()
        })
    }

    pub fn natural_params(&self, sequence: &Sequence) -> Result<DiscreteNaturalParams> {
        discrete_natural_params(
            &self.joint_initial_probs(),
            &self.joint_transition_matrix(),
            self.params.emissions.log_likelihoods(sequence)?,
        )
    }

    pub fn infer_posterior(&self, sequence: &Sequence) -> Result<HmmPosterior> {
        hmm_posterior(&self.natural_params(sequence)?)
    }

    /// Per-group posterior marginals, one `T × K_g` matrix per group.
    pub fn group_marginals(&self, posterior: &HmmPosterior) -> Vec<DMatrix<f64>> {
        (0..self.space.num_groups())
            .map(|g| self.space.marginalize(posterior.expected_states(), g))
            .collect()
    }

    /// Joint Viterbi path, decoded to one state per group at each step.
    pub fn most_likely_states(&self, sequence: &Sequence) -> Result<Vec<Vec<usize>>> {
        Ok(most_likely_states(&self.natural_params(sequence)?)?
            .into_iter()
            .map(|s| self.space.states(s))
            .collect())
    }

    /// Filtered joint-state probabilities, `T × S`.
    pub fn filtered_states(&self, sequence: &Sequence) -> Result<DMatrix<f64>> {
        filtered_states(&self.natural_params(sequence)?)
    }

    /// Draws independent chains, then observations from the joint states.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        num_timesteps: usize,
        rng: &mut R,
    ) -> Result<(Vec<Vec<usize>>, Sequence)> {
        if num_timesteps == 0 {
            return Err(Error::Config("cannot sample an empty sequence".into()));
        }
        let mut paths = vec![Vec::with_capacity(self.space.num_groups()); num_timesteps];
        for (g, chain) in self.params.chains.iter().enumerate() {
            let initial = WeightedIndex::new(chain.initial_probs.iter().copied())
                .map_err(|e| Error::Numerical(format!("chain {g} initial distribution: {e}")))?;
            let rows = (0..chain.num_states())
                .map(|i| {
                    WeightedIndex::new(chain.transition_matrix.row(i).iter().copied())
                        .map_err(|e| Error::Numerical(format!("chain {g} transition row {i}: {e}")))
                })
                .collect::<Result<Vec<_>>>()?;
            let mut z = initial.sample(&mut *rng);
            paths[0].push(z);
            for step in paths.iter_mut().skip(1) {
                z = rows[z].sample(&mut *rng);
                step.push(z);
            }
        }
        let mut observations = Vec::with_capacity(num_timesteps);
        for states in &paths {
            let joint = self.space.index(states)?;
            let y = self.params.emissions.sample(joint, &observations, &mut *rng)?;
            observations.push(y);
        }
        Ok((paths, Sequence::from_rows(&observations)?))
    }

    /// One emission M-step from hard joint-state assignments.
    pub fn initialize(
        &mut self,
        dataset: &Dataset,
        initializer: &dyn StateInitializer,
        priors: &Priors,
    ) -> Result<()> {
        self.validate_dataset(dataset)?;
        let k = self.space.num_states();
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
        self.params.emissions = self
            .params
            .emissions
            .closed_form_update(dataset, &weights, priors)?;
        debug!(groups = ?self.space.sizes(), "initialized factorial emissions");
        Ok(())
    }
}

impl<E: Emissions> StateSpaceModel for FactorialHmm<E> {
    type Params = FactorialHmmParams<E>;
    type Posterior = HmmPosterior;

    fn params(&self) -> &FactorialHmmParams<E> {
        &self.params
    }

    fn replace_params(&mut self, params: FactorialHmmParams<E>) -> FactorialHmmParams<E> {
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
    ) -> Result<FactorialHmmParams<E>> {
        if posteriors.len() != dataset.len() {
            return Err(Error::DimensionMismatch {
                what: "number of posteriors".to_string(),
                expected: dataset.len(),
                got: posteriors.len(),
            });
        }
        let s_len = self.space.num_states();
        let joint_initial = posteriors
            .iter()
            .fold(DVector::zeros(s_len), |acc, p| acc + p.initial_state_probs());
        let joint_transitions = posteriors
            .iter()
            .fold(DMatrix::zeros(s_len, s_len), |acc, p| acc + p.expected_transition_counts());
        let decoded: Vec<Vec<usize>> = (0..s_len).map(|s| self.space.states(s)).collect();

        let chains = self
            .space
            .sizes()
            .iter()
            .enumerate()
            .map(|(g, &k)| {
                let mut initial_counts = DVector::zeros(k);
                let mut transition_counts = DMatrix::zeros(k, k);
                for (i, from) in decoded.iter().enumerate() {
                    initial_counts[from[g]] += joint_initial[i];
                    for (j, to) in decoded.iter().enumerate() {
                        transition_counts[(from[g], to[g])] += joint_transitions[(i, j)];
                    }
                }
                let (initial, transition) = markov_mode(&initial_counts, &transition_counts, ctx.priors)?;
                MarkovChain::new(initial, transition)
            })
            .collect::<Result<Vec<_>>>()?;

        let weights: Vec<DMatrix<f64>> =
            posteriors.iter().map(|p| p.expected_states().clone()).collect();
        let emissions = update_emissions(&self.params.emissions, dataset, &weights, ctx)?;
        FactorialHmmParams::new(chains, emissions)
    }
}
