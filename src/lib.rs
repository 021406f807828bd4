//! Numeric state management for gradient-based inference on probabilistic
//! computation graphs.
//!
//! A [`Graph`] is an arena of constant, variable, stochastic, deterministic
//! and query nodes. An [`InferenceState`] takes ownership of a graph and
//! keeps the unconstrained values of its latent nodes, their gradients and
//! the joint log density ready for a sampler, with backup and revert
//! operations for proposals. An [`AnalysisCache`] memoizes structural
//! analyses such as [`Successors`] beside a graph.
//!
//! ```
//! use bmg_state::{Distribution, Graph, InferenceState};
//!
//! let mut graph = Graph::new();
//! let zero = graph.add_constant(0.);
//! let one = graph.add_constant(1.);
//! let mu = graph.add_stochastic(Distribution::Normal, &[zero, one])?;
//! let y = graph.add_stochastic(Distribution::Normal, &[mu, one])?;
//! graph.observe(y, 0.3)?;
//! graph.query(mu)?;
//!
//! let mut state = InferenceState::new(graph, 42)?;
//! state.backup_values()?;
//! state.backup_grads()?;
//!
//! let mut position = state.flattened_values()?;
//! position[0] += 0.1;
//! state.set_flattened_values(&position)?;
//! state.update_backgrad()?;
//! state.update_log_prob()?;
//!
//! // rejected
//! state.revert_values()?;
//! state.revert_grads()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub(crate) mod analysis;
pub(crate) mod distribution;
pub(crate) mod graph;
pub(crate) mod math;
pub(crate) mod node;
pub(crate) mod state;
pub(crate) mod transform;
pub(crate) mod value;

pub use analysis::{out_nodes, Analysis, AnalysisCache, Successors};
pub use distribution::Distribution;
pub use graph::{Graph, GraphError, GraphId};
pub use node::{
    ConstantNode, DeterministicNode, Node, NodeId, NodeKind, Operator, QueryNode, StochasticNode,
    VariableNode,
};
pub use state::{InferenceState, InitStrategy, StateError, StateSettings};
pub use transform::Transform;
pub use value::{NodeValue, SizeMismatch, ValueType};
