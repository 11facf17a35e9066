//! Membrane Process Search - Library
//!
//! Stochastic global search over a nonlinear membrane-process design model:
//! randomized structurally valid starting points, bounded perturbation,
//! multistart, monotonic basin hopping, a clustered evolutionary search and
//! a prototype population search over structurally different models. The
//! model itself stays behind the [`model::Model`] trait; [`surrogate`]
//! provides an analytical cascade that implements it.

pub mod cluster;
pub mod error;
pub mod evolution;
pub mod init;
pub mod logs;
pub mod model;
pub mod orchestrator;
pub mod perturb;
pub mod population;
pub mod snapshot;
pub mod strategy;
pub mod surrogate;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SearchError};
pub use model::{Model, ModelBuilder, Prototype, SolveStatus};
pub use orchestrator::{GlobalOptimisation, SearchConfig};
pub use snapshot::Snapshot;
pub use strategy::{run_algorithm, Algorithm, RunOutcome};
