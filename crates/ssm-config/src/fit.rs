//! EM loop settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much progress the fit loop reports.
///
/// Mapped onto `tracing` levels by the driver: `Off` emits nothing per
/// iteration, `Quiet` only the final summary, `Loud` one info event per
/// iteration, `Debug` adds per-sequence E-step events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Off,
    #[default]
    Quiet,
    Loud,
    Debug,
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verbosity::Off => write!(f, "off"),
            Verbosity::Quiet => write!(f, "quiet"),
            Verbosity::Loud => write!(f, "loud"),
            Verbosity::Debug => write!(f, "debug"),
        }
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Ok(Verbosity::Off),
            "quiet" | "1" => Ok(Verbosity::Quiet),
            "loud" | "2" => Ok(Verbosity::Loud),
            "debug" | "3" => Ok(Verbosity::Debug),
            _ => Err(format!("unknown verbosity: {}", s)),
        }
    }
}

/// Which rule the HMM uses to re-estimate emission parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionUpdate {
    /// Conjugate closed-form update (posterior mode).
    #[default]
    ClosedForm,
    /// Numerical minimisation of the expected negative log-likelihood.
    Gradient,
}

/// Settings for one EM run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Maximum number of EM iterations. Zero returns the initial parameters.
    pub num_iters: usize,

    /// Absolute change in marginal log probability that declares convergence.
    pub tol: f64,

    pub verbosity: Verbosity,

    /// Treat any decrease of the marginal log probability as a failure
    /// instead of a warning.
    pub strict_monotonic: bool,

    pub emission_update: EmissionUpdate,

    /// Re-estimate LDS dynamics in the M-step.
    pub update_dynamics: bool,

    /// Iteration budget handed to the gradient optimizer per M-step.
    pub optimizer_max_iters: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            num_iters: 100,
            tol: 1e-4,
            verbosity: Verbosity::default(),
            strict_monotonic: false,
            emission_update: EmissionUpdate::default(),
            update_dynamics: true,
            optimizer_max_iters: 100,
        }
    }
}

impl FitConfig {
    pub fn with_num_iters(mut self, num_iters: usize) -> Self {
        self.num_iters = num_iters;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict_monotonic = true;
        self
    }

    pub fn with_emission_update(mut self, update: EmissionUpdate) -> Self {
        self.emission_update = update;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FitConfig::default();
        assert_eq!(cfg.num_iters, 100);
        assert_eq!(cfg.tol, 1e-4);
        assert!(!cfg.strict_monotonic);
        assert_eq!(cfg.emission_update, EmissionUpdate::ClosedForm);
    }

    #[test]
    fn test_verbosity_parse() {
        assert_eq!("LOUD".parse::<Verbosity>().unwrap(), Verbosity::Loud);
        assert_eq!("0".parse::<Verbosity>().unwrap(), Verbosity::Off);
        assert!("chatty".parse::<Verbosity>().is_err());
        assert!(Verbosity::Debug > Verbosity::Loud);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: FitConfig = serde_json::from_str(r#"{"num_iters": 5, "verbosity": "loud"}"#).unwrap();
        assert_eq!(cfg.num_iters, 5);
        assert_eq!(cfg.verbosity, Verbosity::Loud);
        assert_eq!(cfg.tol, 1e-4);
        assert!(cfg.update_dynamics);
    }

    #[test]
    fn test_builder() {
        let cfg = FitConfig::default()
            .with_num_iters(3)
            .with_tol(1e-8)
            .strict()
            .with_emission_update(EmissionUpdate::Gradient);
        assert_eq!(cfg.num_iters, 3);
        assert!(cfg.strict_monotonic);
        assert_eq!(cfg.emission_update, EmissionUpdate::Gradient);
    }
}
