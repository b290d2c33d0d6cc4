//! Variational message passing on exponential-family graphical models.
//!
//! A [`Model`] is an arena of nodes: constants holding prior
//! hyperparameters, stochastic nodes with a variational posterior, and
//! deterministic nodes that reshape their parent's plates. Updates pull
//! moments from parents and messages from children; the forward–backward
//! recursion in [`alpha_beta`] provides the moments of Markov chain nodes.

pub mod alpha_beta;
pub mod deterministic;
pub mod distributions;
pub mod error;
pub mod graph;
pub mod inference;
pub mod moments;
pub mod persistence;
pub mod plates;
pub mod random;
pub mod stochastic;

pub use alpha_beta::{alpha_beta_recursion, ChainMarginals};
pub use deterministic::DeterministicOp;
pub use distributions::Distribution;
pub use error::{Result, VmpError};
pub use graph::{Model, Node, NodeId, NodeKind};
pub use inference::{run, update_order, VmpConfig, VmpResult};
pub use moments::{Moments, MomentsKind};
pub use persistence::{ModelSnapshot, NodeSnapshot};
pub use stochastic::StochasticState;

// Future: Gaussian and Wishart families on top of the same Distribution
// contract, and a dot-product deterministic node for linear-Gaussian models.
