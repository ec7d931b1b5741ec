//! Expectation-maximization driver.
//!
//! Every iteration injects the current parameter snapshot into the model,
//! runs the E-step over the whole dataset, sums the per-sequence marginal log
//! probabilities and asks the model for new parameters. The model's own slot
//! is restored after each iteration and the fitted record is written back
//! only once the loop ends.
//!
//! Status transitions:
//! - `Running` → `Converged` when the bound moves by less than `tol`
//! - `Running` → `Failed` on a numerical error, a non-finite bound or, in
//!   strict mode, a decrease of the bound
//! - `Running` stays `Running` when the iteration budget runs out

use serde::{Deserialize, Serialize};
use ssm_common::{Error, ErrorCategory, Result, StructuredError};
use ssm_config::validate::{validate_fit, validate_priors};
use ssm_config::{EmissionUpdate, FitConfig, Priors, Verbosity};
use tracing::{debug, error, info, info_span, warn};

use super::inject::with_parameters;
use super::optimize::GradientOptimizer;
use crate::data::Dataset;
use crate::logging::{event_names, generate_run_id, Stage};
use crate::models::{MStepContext, StateSpaceModel};

/// Where a fit run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmStatus {
    /// Budget exhausted before convergence; the fit can be resumed.
    Running,
    Converged,
    Failed,
}

impl std::fmt::Display for EmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EmStatus::Running => "running",
            EmStatus::Converged => "converged",
            EmStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of an EM run.
///
/// `params` is also written back into the model. `posteriors` come from the
/// last E-step whose bound was recorded.
#[derive(Debug)]
pub struct EmFit<P, Q> {
    pub status: EmStatus,
    pub params: P,
    pub posteriors: Vec<Q>,
    /// Total marginal log probability per completed iteration.
    pub log_probs: Vec<f64>,
    /// Iterations whose bound was recorded; always `log_probs.len()`.
    pub iterations: usize,
    pub run_id: String,
    /// The numerical error that stopped a `Failed` run.
    pub error: Option<Error>,
}

impl<P, Q> EmFit<P, Q> {
    pub fn is_converged(&self) -> bool {
        self.status == EmStatus::Converged
    }

    pub fn final_log_prob(&self) -> Option<f64> {
        self.log_probs.last().copied()
    }

    /// Serializable summary without parameters or posteriors.
    pub fn report(&self) -> EmReport {
        EmReport {
            run_id: self.run_id.clone(),
            status: self.status,
            iterations: self.iterations,
            log_probs: self.log_probs.clone(),
            final_log_prob: self.final_log_prob(),
            error: self.error.as_ref().map(StructuredError::from),
        }
    }
}

/// JSON-friendly view of an [`EmFit`].
#[derive(Debug, Clone, Serialize)]
pub struct EmReport {
    pub run_id: String,
    pub status: EmStatus,
    pub iterations: usize,
    pub log_probs: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_log_prob: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StructuredError>,
}

/// Fits any [`StateSpaceModel`] by EM.
#[derive(Clone, Copy)]
pub struct EmDriver<'a> {
    config: &'a FitConfig,
    priors: &'a Priors,
    optimizer: Option<&'a dyn GradientOptimizer>,
}

impl std::fmt::Debug for EmDriver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmDriver")
            .field("config", self.config)
            .field("priors", self.priors)
            .field("optimizer", &self.optimizer.is_some())
            .finish()
    }
}

impl<'a> EmDriver<'a> {
    pub fn new(config: &'a FitConfig, priors: &'a Priors) -> Self {
        Self {
            config,
            priors,
            optimizer: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: &'a dyn GradientOptimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    fn check_inputs<M: StateSpaceModel>(&self, model: &M, dataset: &Dataset) -> Result<()> {
        validate_fit(self.config)?;
        validate_priors(self.priors)?;
        if self.config.emission_update == EmissionUpdate::Gradient && self.optimizer.is_none() {
            return Err(Error::MissingCollaborator(
                "gradient emission update requested without an optimizer".into(),
            ));
        }
        model.validate_dataset(dataset)
    }

    /// Runs EM from the model's current parameters.
    ///
    /// Validation and capability errors are returned as `Err` before or
    /// during the run; numerical trouble ends the run with
    /// [`EmStatus::Failed`] and keeps the bound history.
    pub fn fit<M: StateSpaceModel>(
        &self,
        model: &mut M,
        dataset: &Dataset,
    ) -> Result<EmFit<M::Params, M::Posterior>> {
        let run_id = generate_run_id();
        let span = info_span!("em_fit", run_id = %run_id);
        let _enter = span.enter();

        if let Err(e) = self.check_inputs(model, dataset) {
            error!(
                event = event_names::FIT_FAILED,
                stage = %Stage::Init,
                code = e.code(),
                error = %e,
                "fit rejected before inference"
            );
            return Err(e);
        }

        let cfg = self.config;
        let mut ctx = MStepContext::new(cfg, self.priors);
        if let Some(optimizer) = self.optimizer {
            ctx = ctx.with_optimizer(optimizer);
        }

        progress(
            cfg.verbosity,
            event_names::FIT_STARTED,
            Stage::Init,
            0,
            None,
            "fit started",
        );
        debug!(
            num_sequences = dataset.len(),
            num_timesteps = dataset.num_timesteps(),
            num_iters = cfg.num_iters,
            tol = cfg.tol,
            strict = cfg.strict_monotonic,
            "fit configuration"
        );

        let mut params = model.params().clone();
        let mut posteriors = Vec::new();
        let mut log_probs: Vec<f64> = Vec::new();
        let mut status = EmStatus::Running;
        let mut failure = None;
        let mut iterations = 0;

        for iteration in 0..cfg.num_iters {
            let step = with_parameters(model, params.clone(), |m| {
                let posts = m.e_step(dataset)?;
                debug!(
                    event = event_names::E_STEP_DONE,
                    stage = %Stage::EStep,
                    iteration,
                    "posteriors computed"
                );
                let lp: f64 = m.marginal_likelihood(dataset, &posts)?.iter().sum();
                let next = m.m_step(dataset, &posts, &ctx)?;
                Ok((posts, lp, next))
            });

            let (posts, lp, next) = match step {
                Ok(out) => out,
                Err(e) if e.category() == ErrorCategory::Numerical => {
                    failure = Some(e);
                    status = EmStatus::Failed;
                    break;
                }
                Err(e) => {
                    error!(
                        event = event_names::FIT_FAILED,
                        stage = %Stage::MStep,
                        iteration,
                        code = e.code(),
                        error = %e,
                        "fit aborted"
                    );
                    return Err(e);
                }
            };
            if !lp.is_finite() {
                failure = Some(Error::NonFiniteBound {
                    iteration,
                    value: lp,
                });
                status = EmStatus::Failed;
                break;
            }

            let previous = log_probs.last().copied();
            log_probs.push(lp);
            iterations = iteration + 1;
            posteriors = posts;
            progress(
                cfg.verbosity,
                event_names::EM_ITERATION,
                Stage::Converge,
                iteration,
                Some(lp),
                "em iteration",
            );

            if let Some(prev) = previous {
                if (lp - prev).abs() < cfg.tol {
                    params = next;
                    status = EmStatus::Converged;
                    break;
                }
                if lp < prev {
                    warn!(
                        event = event_names::BOUND_DECREASED,
                        stage = %Stage::Converge,
                        iteration,
                        previous = prev,
                        current = lp,
                        "marginal log probability decreased"
                    );
                    if cfg.strict_monotonic {
                        failure = Some(Error::BoundDecreased {
                            iteration,
                            previous: prev,
                            current: lp,
                        });
                        status = EmStatus::Failed;
                        break;
                    }
                }
            }
            params = next;
        }

        match &failure {
            Some(e) => error!(
                event = event_names::FIT_FAILED,
                stage = %Stage::Converge,
                iterations,
                code = e.code(),
                error = %e,
                "fit failed"
            ),
            None if status == EmStatus::Converged => progress(
                cfg.verbosity,
                event_names::CONVERGED,
                Stage::Converge,
                iterations,
                log_probs.last().copied(),
                "converged",
            ),
            None => {}
        }
        progress(
            cfg.verbosity,
            event_names::FIT_FINISHED,
            Stage::Converge,
            iterations,
            log_probs.last().copied(),
            "fit finished",
        );

        model.replace_params(params.clone());
        Ok(EmFit {
            status,
            params,
            posteriors,
            log_probs,
            iterations,
            run_id,
            error: failure,
        })
    }
}

/// Progress lines go out at `info` for loud runs and `debug` otherwise.
fn progress(
    verbosity: Verbosity,
    event: &'static str,
    stage: Stage,
    iteration: usize,
    log_prob: Option<f64>,
    message: &str,
) {
    match verbosity {
        Verbosity::Off => {}
        Verbosity::Quiet => debug!(event, stage = %stage, iteration, log_prob, "{message}"),
        Verbosity::Loud | Verbosity::Debug => {
            info!(event, stage = %stage, iteration, log_prob, "{message}")
        }
    }
}

/// Shorthand for [`EmDriver::fit`] without a gradient optimizer.
pub fn fit_em<M: StateSpaceModel>(
    model: &mut M,
    dataset: &Dataset,
    config: &FitConfig,
    priors: &Priors,
) -> Result<EmFit<M::Params, M::Posterior>> {
    EmDriver::new(config, priors).fit(model, dataset)
}
