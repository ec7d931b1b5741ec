//! Event names and stages attached to every fit-loop log line.

use serde::{Deserialize, Serialize};

/// Phase of a fit run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Configuration and data validation.
    Init,
    /// Posterior inference over latent states.
    EStep,
    /// Parameter re-estimation.
    MStep,
    /// Bound bookkeeping and convergence checks.
    Converge,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::EStep => "e_step",
            Stage::MStep => "m_step",
            Stage::Converge => "converge",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Run lifecycle
    pub const FIT_STARTED: &str = "fit.started";
    pub const FIT_FINISHED: &str = "fit.finished";
    pub const FIT_FAILED: &str = "fit.failed";

    // Per iteration
    pub const EM_ITERATION: &str = "em.iteration";
    pub const E_STEP_DONE: &str = "em.e_step_done";
    pub const BOUND_DECREASED: &str = "em.bound_decreased";
    pub const CONVERGED: &str = "em.converged";

    // Collaborators
    pub const INIT_ASSIGNED: &str = "init.assigned";
    pub const OPTIMIZER_DONE: &str = "optimizer.done";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serialization() {
        assert_eq!(serde_json::to_string(&Stage::EStep).unwrap(), "\"e_step\"");
        assert_eq!(Stage::Converge.to_string(), "converge");
    }
}
