//! Exact inference engines.
//!
//! - [`forward_backward`]: discrete chains in log space
//! - [`block_tridiag`]: linear-Gaussian chains in information form
//! - [`natural_params`]: model parameters → engine inputs
//! - [`posterior`]: the immutable containers both engines produce

pub mod block_tridiag;
pub mod forward_backward;
pub mod natural_params;
pub mod posterior;

pub use block_tridiag::{gaussian_chain_posterior, gaussian_chain_posteriors, GaussianChainNaturalParams};
pub use forward_backward::{
    filtered_states, hmm_posterior, hmm_posteriors, most_likely_states, DiscreteNaturalParams,
};
pub use natural_params::{discrete_natural_params, lds_natural_params};
pub use posterior::{GaussianChainPosterior, HmmPosterior, Posterior};
