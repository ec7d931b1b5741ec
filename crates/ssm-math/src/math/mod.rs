//! Core math modules.

pub mod stable;
pub mod dirichlet;
pub mod gamma;
pub mod gaussian;
