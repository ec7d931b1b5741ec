//! Model families and the contract the EM driver fits against.

pub mod autoregressive;
pub mod dynamics;
pub mod emissions;
pub mod factorial;
pub mod hmm;
pub mod lds;
pub mod params;

use std::fmt;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use ssm_common::{Error, Result};
use ssm_config::{FitConfig, Priors};
use ssm_math::gaussian;

use crate::data::Dataset;
use crate::fit::optimize::GradientOptimizer;
use crate::inference::Posterior;

pub use autoregressive::AutoregressiveEmissions;
pub use dynamics::{DynamicsFn, FnDynamics, StationaryDynamics, Transition};
pub use emissions::{CategoricalEmissions, Emissions, GaussianEmissions, PoissonEmissions};
pub use factorial::{
    FactorialHmm, FactorialHmmParams, MarkovChain, NormalFactorialEmissions, ProductSpace,
};
pub use hmm::{Hmm, HmmParams};
pub use lds::{GaussianLds, LdsParams, LdsPosterior};
pub use params::{FieldKind, FieldSpec, FlatParams, ParameterRecord, ParameterSchema};

/// Everything an M-step may consult besides data and posteriors.
#[derive(Clone, Copy)]
pub struct MStepContext<'a> {
    pub fit: &'a FitConfig,
    pub priors: &'a Priors,
    pub optimizer: Option<&'a dyn GradientOptimizer>,
}

impl<'a> MStepContext<'a> {
    pub fn new(fit: &'a FitConfig, priors: &'a Priors) -> Self {
        Self {
            fit,
            priors,
            optimizer: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: &'a dyn GradientOptimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }
}

impl fmt::Debug for MStepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MStepContext")
            .field("fit", self.fit)
            .field("priors", self.priors)
            .field("optimizer", &self.optimizer.is_some())
            .finish()
    }
}

/// A model family the EM driver can fit.
///
/// Parameters live in a single record owned by the model and are only ever
/// replaced whole.
pub trait StateSpaceModel {
    type Params: Clone + fmt::Debug;
    type Posterior: Posterior;

    fn params(&self) -> &Self::Params;

    /// Swaps in `params` and hands back the previous record.
    fn replace_params(&mut self, params: Self::Params) -> Self::Params;

    /// Shape and finiteness checks run once before inference.
    fn validate_dataset(&self, dataset: &Dataset) -> Result<()> {
        dataset.check_finite()
    }

    /// One posterior per sequence under the current parameters.
    fn e_step(&self, dataset: &Dataset) -> Result<Vec<Self::Posterior>>;

    /// New parameters from the posteriors; `self` is left untouched.
    fn m_step(
        &self,
        dataset: &Dataset,
        posteriors: &[Self::Posterior],
        ctx: &MStepContext<'_>,
    ) -> Result<Self::Params>;

    /// Per-sequence `log p(y)`.
    fn marginal_likelihood(
        &self,
        _dataset: &Dataset,
        posteriors: &[Self::Posterior],
    ) -> Result<Vec<f64>> {
        Ok(posteriors.iter().map(Posterior::marginal_log_likelihood).collect())
    }
}

/// `mean + L z` with `z ~ N(0, I)`.
pub(crate) fn sample_mvn<R: Rng + ?Sized>(
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
    rng: &mut R,
    what: &str,
) -> Result<DVector<f64>> {
    let chol = gaussian::cholesky(cov).ok_or_else(|| Error::NotPositiveDefinite {
        what: what.to_string(),
        step: None,
    })?;
    let z: DVector<f64> = DVector::from_fn(mean.len(), |_, _| StandardNormal.sample(&mut *rng));
    Ok(mean + chol.l() * z)
}
