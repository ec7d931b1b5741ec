//! Fitting: the EM driver and the collaborators it works with.

pub mod em;
pub mod init;
pub mod inject;
pub mod optimize;

pub use em::{fit_em, EmDriver, EmFit, EmReport, EmStatus};
pub use init::{KMeans, RandomAssignment, StateInitializer};
pub use inject::{with_parameters, ParameterScope};
pub use optimize::{GradientOptimizer, LbfgsOptimizer};
