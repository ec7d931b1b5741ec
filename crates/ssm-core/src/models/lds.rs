//! Linear dynamical system with Gaussian noise.
//!
//! ```text
//! x_0 ~ N(m₁, Q₁)
//! x_t ~ N(A x_{t−1} + b, Q)          t ≥ 1
//! y_t ~ N(C x_t + d, R)
//! ```
//!
//! The transition may instead come from a [`DynamicsFn`] evaluated per step.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use ssm_config::EmissionUpdate;
use ssm_math::gaussian::{self, mvn_log_pdf};
use tracing::debug;

use super::dynamics::{DynamicsFn, StationaryDynamics, Transition};
use super::params::{FieldKind, FieldSpec, FlatReader, FlatWriter, ParameterRecord, ParameterSchema};
use super::{sample_mvn, MStepContext, StateSpaceModel};
use crate::data::{Dataset, Sequence};
use crate::inference::{
    gaussian_chain_posterior, lds_natural_params, GaussianChainNaturalParams,
    GaussianChainPosterior, Posterior,
};

/// Parameter record of a Gaussian LDS with stationary dynamics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdsParams {
    /// m₁
    pub initial_mean: DVector<f64>,
    /// Q₁
    pub initial_covariance: DMatrix<f64>,
    /// A
    pub dynamics_matrix: DMatrix<f64>,
    /// b
    pub dynamics_bias: DVector<f64>,
    /// Q
    pub dynamics_covariance: DMatrix<f64>,
    /// C, `N × D`
    pub emissions_matrix: DMatrix<f64>,
    /// d
    pub emissions_bias: DVector<f64>,
    /// R
    pub emissions_covariance: DMatrix<f64>,
}

impl LdsParams {
    /// Zero means, unit covariances, `A = 0.9 I`, and `C` the leading
    /// `N × D` block of the identity.
    pub fn isotropic(state_dim: usize, obs_dim: usize) -> Self {
        Self {
            initial_mean: DVector::zeros(state_dim),
            initial_covariance: DMatrix::identity(state_dim, state_dim),
            dynamics_matrix: DMatrix::identity(state_dim, state_dim) * 0.9,
            dynamics_bias: DVector::zeros(state_dim),
            dynamics_covariance: DMatrix::identity(state_dim, state_dim),
            emissions_matrix: DMatrix::identity(obs_dim, state_dim),
            emissions_bias: DVector::zeros(obs_dim),
            emissions_covariance: DMatrix::identity(obs_dim, obs_dim),
        }
    }

    pub fn state_dim(&self) -> usize {
        self.initial_mean.len()
    }

    pub fn obs_dim(&self) -> usize {
        self.emissions_bias.len()
    }

    /// The stationary transition `(A, b, Q)`.
    pub fn transition(&self) -> Transition {
        Transition::new(
            self.dynamics_matrix.clone(),
            self.dynamics_bias.clone(),
            self.dynamics_covariance.clone(),
        )
    }

    /// Shapes, finiteness and positive-definite covariances.
    pub fn validate(&self) -> Result<()> {
        let d = self.state_dim();
        let n = self.obs_dim();
        if d == 0 || n == 0 {
            return Err(Error::Config("LDS needs positive state and observation dimensions".into()));
        }
        let shapes: [(&str, (usize, usize), (usize, usize)); 5] = [
            ("initial covariance Q1", self.initial_covariance.shape(), (d, d)),
            ("dynamics matrix A", self.dynamics_matrix.shape(), (d, d)),
            ("dynamics covariance Q", self.dynamics_covariance.shape(), (d, d)),
            ("emission matrix C", self.emissions_matrix.shape(), (n, d)),
            ("emission covariance R", self.emissions_covariance.shape(), (n, n)),
        ];
        for (what, got, expected) in shapes {
            if got != expected {
                return Err(Error::DimensionMismatch {
                    what: what.to_string(),
                    expected: expected.0 * expected.1,
                    got: got.0 * got.1,
                });
            }
        }
        if self.dynamics_bias.len() != d {
            return Err(Error::DimensionMismatch {
                what: "dynamics bias b".to_string(),
                expected: d,
                got: self.dynamics_bias.len(),
            });
        }
        let all_finite = [
            self.initial_mean.as_slice(),
            self.initial_covariance.as_slice(),
            self.dynamics_matrix.as_slice(),
            self.dynamics_bias.as_slice(),
            self.dynamics_covariance.as_slice(),
            self.emissions_matrix.as_slice(),
            self.emissions_bias.as_slice(),
            self.emissions_covariance.as_slice(),
        ]
        .iter()
        .all(|s| s.iter().all(|v| v.is_finite()));
        if !all_finite {
            return Err(Error::NonFiniteInput("LDS parameters".into()));
        }
        for (what, cov) in [
            ("initial covariance Q1", &self.initial_covariance),
            ("dynamics covariance Q", &self.dynamics_covariance),
            ("emission covariance R", &self.emissions_covariance),
        ] {
            if gaussian::cholesky(cov).is_none() {
                return Err(Error::NotPositiveDefinite {
                    what: what.to_string(),
                    step: None,
                });
            }
        }
        Ok(())
    }
}

impl ParameterRecord for LdsParams {
    fn schema(&self) -> ParameterSchema {
        let d = self.state_dim();
        let n = self.obs_dim();
        ParameterSchema::new(
            1,
            vec![
                FieldSpec::new("initial_mean", FieldKind::Vector, vec![d]),
                FieldSpec::new("initial_covariance", FieldKind::CholeskyFactor, vec![1, d]),
                FieldSpec::new("dynamics_matrix", FieldKind::Matrix, vec![d, d]),
                FieldSpec::new("dynamics_bias", FieldKind::Vector, vec![d]),
                FieldSpec::new("dynamics_covariance", FieldKind::CholeskyFactor, vec![1, d]),
                FieldSpec::new("emissions_matrix", FieldKind::Matrix, vec![n, d]),
                FieldSpec::new("emissions_bias", FieldKind::Vector, vec![n]),
                FieldSpec::new("emissions_covariance", FieldKind::CholeskyFactor, vec![1, n]),
            ],
        )
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        writer.vector(&self.initial_mean);
        writer.cholesky(&self.initial_covariance)?;
        writer.matrix(&self.dynamics_matrix);
        writer.vector(&self.dynamics_bias);
        writer.cholesky(&self.dynamics_covariance)?;
        writer.matrix(&self.emissions_matrix);
        writer.vector(&self.emissions_bias);
        writer.cholesky(&self.emissions_covariance)
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let d = self.state_dim();
        let n = self.obs_dim();
        Ok(Self {
            initial_mean: reader.vector(d)?,
            initial_covariance: reader.cholesky(d)?,
            dynamics_matrix: reader.matrix(d, d)?,
            dynamics_bias: reader.vector(d)?,
            dynamics_covariance: reader.cholesky(d)?,
            emissions_matrix: reader.matrix(n, d)?,
            emissions_bias: reader.vector(n)?,
            emissions_covariance: reader.cholesky(n)?,
        })
    }
}

/// Posterior of one sequence under a Gaussian LDS.
#[derive(Debug, Clone, PartialEq)]
pub struct LdsPosterior {
    chain: GaussianChainPosterior,
    marginal_log_likelihood: f64,
}

impl LdsPosterior {
    pub fn chain(&self) -> &GaussianChainPosterior {
        &self.chain
    }

    pub fn means(&self) -> &[DVector<f64>] {
        self.chain.means()
    }

    pub fn covariances(&self) -> &[DMatrix<f64>] {
        self.chain.covariances()
    }
}

impl Posterior for LdsPosterior {
    fn marginal_log_likelihood(&self) -> f64 {
        self.marginal_log_likelihood
    }

    fn num_timesteps(&self) -> usize {
        self.chain.num_timesteps()
    }
}

/// Gaussian LDS with stationary or caller-supplied dynamics.
pub struct GaussianLds {
    params: LdsParams,
    dynamics: Option<Box<dyn DynamicsFn>>,
}

impl fmt::Debug for GaussianLds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaussianLds")
            .field("params", &self.params)
            .field("time_varying", &self.dynamics.is_some())
            .finish()
    }
}

impl GaussianLds {
    pub fn new(params: LdsParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            dynamics: None,
        })
    }

    /// Installs a dynamics function. A stationary function is folded into
    /// the parameter record so the M-step can keep re-estimating it.
    pub fn with_dynamics(mut self, dynamics: Box<dyn DynamicsFn>) -> Result<Self> {
        if dynamics.is_stationary() {
            let tr = dynamics.transition(1, None)?;
            tr.validate(self.params.state_dim(), 1)?;
            self.params.dynamics_matrix = tr.matrix;
            self.params.dynamics_bias = tr.bias;
            self.params.dynamics_covariance = tr.covariance;
            self.params.validate()?;
            self.dynamics = None;
        } else {
            self.dynamics = Some(dynamics);
        }
        Ok(self)
    }

    pub fn is_time_varying(&self) -> bool {
        self.dynamics.is_some()
    }

    pub fn state_dim(&self) -> usize {
        self.params.state_dim()
    }

    pub fn obs_dim(&self) -> usize {
        self.params.obs_dim()
    }

    fn with_dynamics_fn<T>(&self, f: impl FnOnce(&dyn DynamicsFn) -> Result<T>) -> Result<T> {
        match &self.dynamics {
            Some(dynamics) => f(dynamics.as_ref()),
            None => f(&StationaryDynamics::new(self.params.transition())),
        }
    }

    pub fn natural_params(&self, sequence: &Sequence) -> Result<GaussianChainNaturalParams> {
        self.with_dynamics_fn(|dynamics| lds_natural_params(&self.params, dynamics, sequence))
    }

    /// Exact posterior over states plus `log p(y)`.
    pub fn infer_posterior(&self, sequence: &Sequence) -> Result<LdsPosterior> {
        let chain = gaussian_chain_posterior(&self.natural_params(sequence)?)?;
        let at_mean = self.log_probability(sequence, chain.means())?;
        let marginal_log_likelihood = at_mean - chain.log_prob(chain.means())?;
        Ok(LdsPosterior {
            chain,
            marginal_log_likelihood,
        })
    }

    /// Joint `log p(y, x)` for a full state trajectory.
    pub fn log_probability(&self, sequence: &Sequence, states: &[DVector<f64>]) -> Result<f64> {
        let t_len = sequence.num_timesteps();
        if states.len() != t_len {
            return Err(Error::DimensionMismatch {
                what: "state trajectory length".to_string(),
                expected: t_len,
                got: states.len(),
            });
        }
        let p = &self.params;
        let mut lp = mvn_log_pdf(&states[0], &p.initial_mean, &p.initial_covariance).ok_or_else(
            || Error::NotPositiveDefinite {
                what: "initial covariance Q1".to_string(),
                step: None,
            },
        )?;
        self.with_dynamics_fn(|dynamics| {
            for t in 1..t_len {
                let tr = dynamics.transition(t, sequence.covariate(t).as_ref())?;
                tr.validate(p.state_dim(), t)?;
                let mean = &tr.matrix * &states[t - 1] + &tr.bias;
                lp += mvn_log_pdf(&states[t], &mean, &tr.covariance).ok_or_else(|| {
                    Error::NotPositiveDefinite {
                        what: "dynamics covariance Q".to_string(),
                        step: Some(t),
                    }
                })?;
            }
            Ok(())
        })?;
        for (t, x) in states.iter().enumerate() {
            let mean = &p.emissions_matrix * x + &p.emissions_bias;
            lp += mvn_log_pdf(&sequence.observation(t), &mean, &p.emissions_covariance)
                .ok_or_else(|| Error::NotPositiveDefinite {
                    what: "emission covariance R".to_string(),
                    step: None,
                })?;
        }
        Ok(lp)
    }

    /// Draws `(states, observations)`. Covariates, when given, are attached
    /// to the sequence and passed to the dynamics function.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        num_timesteps: usize,
        covariates: Option<DMatrix<f64>>,
        rng: &mut R,
    ) -> Result<(Vec<DVector<f64>>, Sequence)> {
        if num_timesteps == 0 {
            return Err(Error::Config("cannot sample an empty sequence".into()));
        }
        if let Some(c) = &covariates {
            if c.nrows() != num_timesteps {
                return Err(Error::DimensionMismatch {
                    what: "covariate rows".to_string(),
                    expected: num_timesteps,
                    got: c.nrows(),
                });
            }
        }
        let p = &self.params;
        let mut states = Vec::with_capacity(num_timesteps);
        states.push(sample_mvn(
            &p.initial_mean,
            &p.initial_covariance,
            &mut *rng,
            "initial covariance Q1",
        )?);
        self.with_dynamics_fn(|dynamics| {
            for t in 1..num_timesteps {
                let u = covariates.as_ref().map(|c| c.row(t).transpose());
                let tr = dynamics.transition(t, u.as_ref())?;
                tr.validate(p.state_dim(), t)?;
                let mean = &tr.matrix * &states[t - 1] + &tr.bias;
                states.push(sample_mvn(&mean, &tr.covariance, &mut *rng, "dynamics covariance Q")?);
            }
            Ok(())
        })?;
        let observations = states
            .iter()
            .map(|x| {
                let mean = &p.emissions_matrix * x + &p.emissions_bias;
                sample_mvn(&mean, &p.emissions_covariance, &mut *rng, "emission covariance R")
            })
            .collect::<Result<Vec<_>>>()?;
        let mut sequence = Sequence::from_rows(&observations)?;
        if let Some(c) = covariates {
            sequence = sequence.with_covariates(c)?;
        }
        Ok((states, sequence))
    }
}

/// Accumulated regression statistics `Σ E[x̃ x̃ᵀ]`, `Σ E[y x̃ᵀ]`, `Σ E[y yᵀ]`
/// with `x̃ = [x; 1]`.
struct RegressionStats {
    xx: DMatrix<f64>,
    yx: DMatrix<f64>,
    yy: DMatrix<f64>,
    count: f64,
}

impl RegressionStats {
    fn new(in_dim: usize, out_dim: usize) -> Self {
        Self {
            xx: DMatrix::zeros(in_dim + 1, in_dim + 1),
            yx: DMatrix::zeros(out_dim, in_dim + 1),
            yy: DMatrix::zeros(out_dim, out_dim),
            count: 0.0,
        }
    }

    /// Adds one term from `E[x]`, `E[x xᵀ]`, `E[y]`, `E[y xᵀ]`, `E[y yᵀ]`.
    fn add(
        &mut self,
        ex: &DVector<f64>,
        exx: &DMatrix<f64>,
        ey: &DVector<f64>,
        eyx: &DMatrix<f64>,
        eyy: &DMatrix<f64>,
    ) {
        let d = ex.len();
        let mut xx = self.xx.view_mut((0, 0), (d, d));
        xx += exx;
        for i in 0..d {
            self.xx[(i, d)] += ex[i];
            self.xx[(d, i)] += ex[i];
        }
        self.xx[(d, d)] += 1.0;
        let mut yx = self.yx.view_mut((0, 0), (ey.len(), d));
        yx += eyx;
        for i in 0..ey.len() {
            self.yx[(i, d)] += ey[i];
        }
        self.yy += eyy;
        self.count += 1.0;
    }

    /// Least-squares `[W b]` and residual covariance plus `reg · I`.
    fn solve(&self, what: &str, reg: f64) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> {
        let chol = gaussian::cholesky(&self.xx).ok_or_else(|| Error::NotPositiveDefinite {
            what: format!("{what} regression statistics"),
            step: None,
        })?;
        let w_full = chol.solve(&self.yx.transpose()).transpose();
        let in_dim = self.xx.nrows() - 1;
        let out_dim = self.yy.nrows();
        let weights = w_full.columns(0, in_dim).into_owned();
        let bias = w_full.column(in_dim).into_owned();
        let resid = (&self.yy - &w_full * self.yx.transpose()) / self.count;
        let cov = gaussian::symmetrize(&resid) + DMatrix::identity(out_dim, out_dim) * reg;
        Ok((weights, bias, cov))
    }
}

impl StateSpaceModel for GaussianLds {
    type Params = LdsParams;
    type Posterior = LdsPosterior;

    fn params(&self) -> &LdsParams {
        &self.params
    }

    fn replace_params(&mut self, params: LdsParams) -> LdsParams {
        std::mem::replace(&mut self.params, params)
    }

    fn validate_dataset(&self, dataset: &Dataset) -> Result<()> {
        if dataset.obs_dim() != self.obs_dim() {
            return Err(Error::DimensionMismatch {
                what: "observation dimension".to_string(),
                expected: self.obs_dim(),
                got: dataset.obs_dim(),
            });
        }
        dataset.check_finite()
    }

    fn e_step(&self, dataset: &Dataset) -> Result<Vec<LdsPosterior>> {
        dataset
            .iter()
            .enumerate()
            .map(|(i, seq)| self.infer_posterior(seq).map_err(|e| e.in_sequence(i)))
            .collect()
    }

    fn m_step(
        &self,
        dataset: &Dataset,
        posteriors: &[LdsPosterior],
        ctx: &MStepContext<'_>,
    ) -> Result<LdsParams> {
        if ctx.fit.emission_update == EmissionUpdate::Gradient {
            return Err(Error::Unsupported(
                "gradient emission update is not available for the Gaussian LDS".into(),
            ));
        }
        let update_dynamics = ctx.fit.update_dynamics;
        if update_dynamics && self.is_time_varying() {
            return Err(Error::Unsupported(
                "time-varying dynamics cannot be re-estimated; disable dynamics updates".into(),
            ));
        }
        if posteriors.len() != dataset.len() {
            return Err(Error::DimensionMismatch {
                what: "number of posteriors".to_string(),
                expected: dataset.len(),
                got: posteriors.len(),
            });
        }
        let d = self.state_dim();
        let n = self.obs_dim();
        let reg = ctx.priors.gaussian.covariance_regularization;

        let mut init_mean = DVector::zeros(d);
        let mut init_second = DMatrix::zeros(d, d);
        let mut dyn_stats = RegressionStats::new(d, d);
        let mut emit_stats = RegressionStats::new(d, n);

        for (seq, post) in dataset.iter().zip(posteriors) {
            let chain = post.chain();
            let means = chain.means();
            let second = chain.second_moments();
            init_mean += &means[0];
            init_second += &second[0];
            for t in 0..seq.num_timesteps() {
                let y = seq.observation(t);
                let yx = gaussian::outer(&y, &means[t]);
                let yy = gaussian::outer(&y, &y);
                emit_stats.add(&means[t], &second[t], &y, &yx, &yy);
            }
            if update_dynamics {
                for (t, cross) in chain.cross_moments().iter().enumerate() {
                    dyn_stats.add(&means[t], &second[t], &means[t + 1], cross, &second[t + 1]);
                }
            }
        }

        let num_seqs = dataset.len() as f64;
        let mut next = self.params.clone();
        next.initial_mean = init_mean / num_seqs;
        let init_cov = init_second / num_seqs - gaussian::outer(&next.initial_mean, &next.initial_mean);
        next.initial_covariance = gaussian::symmetrize(&init_cov) + DMatrix::identity(d, d) * reg;

        if update_dynamics && dyn_stats.count > 0.0 {
            let (a, b, q) = dyn_stats.solve("dynamics", reg)?;
            next.dynamics_matrix = a;
            next.dynamics_bias = b;
            next.dynamics_covariance = q;
        } else {
            debug!("lds m-step leaves dynamics unchanged");
        }

        let (c, dvec, r) = emit_stats.solve("emission", reg)?;
        next.emissions_matrix = c;
        next.emissions_bias = dvec;
        next.emissions_covariance = r;

        next.validate()?;
        Ok(next)
    }
}
