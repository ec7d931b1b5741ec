//! State-space math utilities.

pub mod math;

pub use math::stable::*;
pub use math::dirichlet;
pub use math::gamma::*;
pub use math::gaussian;
