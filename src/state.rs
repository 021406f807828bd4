//! The numeric state of the latent variables of a model, in the form
//! gradient-based samplers consume.
//!
//! A sampler snapshots a committed state with the `backup_*` methods,
//! proposes a move through the flattened unconstrained vector, and then
//! either keeps the proposal (by snapshotting again) or restores the
//! committed state with the `revert_*` methods.
//!
//! Gradients and the cached log density are never updated implicitly. After
//! changing values, call [`InferenceState::update_backgrad`] and
//! [`InferenceState::update_log_prob`] before trusting either.

use itertools::izip;
use log::{debug, trace};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::{
    graph::{Graph, GraphError},
    math::axpy,
    node::NodeId,
    value::{NodeValue, SizeMismatch},
};

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// A flattened vector did not have `flat_size` elements. The state is
    /// left unchanged and the current proposal should be abandoned.
    #[error("flattened vector has the wrong size: {0}")]
    SizeMismatch(#[from] SizeMismatch),
    /// A node lookup failed. This is a programming error and the run
    /// should be stopped.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// How latent values are chosen when an inference state is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitStrategy {
    /// Draw each latent node from its distribution given its parents.
    #[default]
    Prior,
    /// Draw each unconstrained element uniformly from `(-2, 2)`.
    Random,
    /// Set each unconstrained element to zero.
    Zero,
}

/// Settings for creating an [`InferenceState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSettings {
    /// Seed of the random source used during initialization.
    pub seed: u64,
    /// How to choose the initial latent values.
    pub init: InitStrategy,
}

/// Latent-variable state of one chain over an owned graph.
///
/// The state owns its graph, so neither the structure nor the shape of any
/// node can change while it exists, and the backups always line up with the
/// latent nodes they were taken from.
#[derive(Debug)]
pub struct InferenceState {
    graph: Graph,
    ordered_support: Vec<NodeId>,
    stochastic_nodes: Vec<NodeId>,
    deterministic_nodes: Vec<NodeId>,
    flat_size: usize,
    log_prob: f64,
    log_prob_backup: f64,
    vals_backup: Vec<NodeValue>,
    grads_backup: Vec<NodeValue>,
    arch: pulp::Arch,
}

fn init_node<R: Rng + ?Sized>(
    graph: &mut Graph,
    id: NodeId,
    init: InitStrategy,
    rng: &mut R,
) -> Result<()> {
    let latent = graph.node(id)?.is_stochastic();
    if !latent || init == InitStrategy::Prior {
        graph.eval(id, rng)?;
        return Ok(());
    }
    let node = graph.stochastic_mut(id)?;
    let unconstrained = match init {
        InitStrategy::Random => NodeValue::from_fn(node.value_type(), || rng.random_range(-2f64..2f64)),
        _ => NodeValue::zeros(node.value_type()),
    };
    node.set_unconstrained(unconstrained);
    Ok(())
}

impl InferenceState {
    /// Create a state with default settings and the given seed.
    pub fn new(graph: Graph, seed: u64) -> Result<Self> {
        Self::with_settings(
            graph,
            StateSettings {
                seed,
                ..Default::default()
            },
        )
    }

    /// Create a state, initializing latent values as `settings` asks.
    pub fn with_settings(mut graph: Graph, settings: StateSettings) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        let ordered_support: Vec<NodeId> = graph.compute_support().into_iter().collect();

        // Inputs precede their consumers in the support order, so every node
        // sees initialized inputs.
        for &id in &ordered_support {
            if !graph.node(id)?.is_observed() {
                init_node(&mut graph, id, settings.init, &mut rng)?;
            }
        }
        for &id in &ordered_support {
            if graph.node(id)?.is_stochastic() {
                graph.stochastic_mut(id)?.materialize_unconstrained();
            }
        }

        graph.update_backgrad(&ordered_support)?;

        let mut stochastic_nodes = Vec::new();
        let mut deterministic_nodes = Vec::new();
        for &id in &ordered_support {
            let node = graph.node(id)?;
            if !node.is_stochastic() {
                deterministic_nodes.push(id);
            } else if !node.is_observed() {
                stochastic_nodes.push(id);
            }
        }

        let mut flat_size = 0;
        let mut vals_backup = Vec::with_capacity(stochastic_nodes.len());
        let mut grads_backup = Vec::with_capacity(stochastic_nodes.len());
        for &id in &stochastic_nodes {
            let node = graph.stochastic(id)?;
            flat_size += node.unconstrained_value().len();
            vals_backup.push(node.unconstrained_value().clone());
            grads_backup.push(node.grad().clone());
        }

        let mut state = InferenceState {
            graph,
            ordered_support,
            stochastic_nodes,
            deterministic_nodes,
            flat_size,
            log_prob: 0f64,
            log_prob_backup: 0f64,
            vals_backup,
            grads_backup,
            arch: pulp::Arch::new(),
        };
        state.update_log_prob()?;
        state.log_prob_backup = state.log_prob;

        debug!(
            "Initialized inference state: {} support nodes, {} latent, {} deterministic, flat size {}, log prob {}",
            state.ordered_support.len(),
            state.stochastic_nodes.len(),
            state.deterministic_nodes.len(),
            state.flat_size,
            state.log_prob
        );
        Ok(state)
    }

    /// The owned graph, read-only while the state exists.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Give the graph back, dropping all numeric bookkeeping.
    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// The support in the order every pass over the model uses.
    pub fn ordered_support(&self) -> &[NodeId] {
        &self.ordered_support
    }

    /// Unobserved stochastic nodes, in flattening order.
    pub fn stochastic_nodes(&self) -> &[NodeId] {
        &self.stochastic_nodes
    }

    /// Non-stochastic support nodes (constants, variables, operators and
    /// queries), in support order.
    pub fn deterministic_nodes(&self) -> &[NodeId] {
        &self.deterministic_nodes
    }

    /// Total number of unconstrained scalars over all latent nodes.
    pub fn flat_size(&self) -> usize {
        self.flat_size
    }

    /// The cached joint log density.
    pub fn log_prob(&self) -> f64 {
        self.log_prob
    }

    fn check_size(&self, found: usize) -> Result<()> {
        if found != self.flat_size {
            return Err(SizeMismatch {
                expected: self.flat_size,
                found,
            }
            .into());
        }
        Ok(())
    }

    /// Snapshot the unconstrained values and the cached log density.
    pub fn backup_values(&mut self) -> Result<()> {
        for (&id, backup) in izip!(&self.stochastic_nodes, &mut self.vals_backup) {
            backup.clone_from(self.graph.stochastic(id)?.unconstrained_value());
        }
        self.log_prob_backup = self.log_prob;
        trace!("Backed up {} latent values", self.stochastic_nodes.len());
        Ok(())
    }

    pub fn backup_grads(&mut self) -> Result<()> {
        for (&id, backup) in izip!(&self.stochastic_nodes, &mut self.grads_backup) {
            backup.clone_from(self.graph.stochastic(id)?.grad());
        }
        trace!("Backed up {} latent gradients", self.stochastic_nodes.len());
        Ok(())
    }

    /// Restore the unconstrained values and the cached log density from the
    /// last backup, re-deriving every constrained value.
    pub fn revert_values(&mut self) -> Result<()> {
        for (&id, backup) in izip!(&self.stochastic_nodes, &self.vals_backup) {
            self.graph.stochastic_mut(id)?.set_unconstrained(backup.clone());
        }
        self.log_prob = self.log_prob_backup;
        trace!("Reverted {} latent values", self.stochastic_nodes.len());
        Ok(())
    }

    pub fn revert_grads(&mut self) -> Result<()> {
        for (&id, backup) in izip!(&self.stochastic_nodes, &self.grads_backup) {
            self.graph.stochastic_mut(id)?.grad_mut().clone_from(backup);
        }
        trace!("Reverted {} latent gradients", self.stochastic_nodes.len());
        Ok(())
    }

    /// Write the unconstrained values of all latent nodes into `out`.
    pub fn write_flattened_values(&self, out: &mut [f64]) -> Result<()> {
        self.check_size(out.len())?;
        let mut offset = 0;
        for &id in &self.stochastic_nodes {
            let value = self.graph.stochastic(id)?.unconstrained_value();
            let len = value.len();
            value.write_to_slice(&mut out[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    pub fn flattened_values(&self) -> Result<Box<[f64]>> {
        let mut out = vec![0f64; self.flat_size];
        self.write_flattened_values(&mut out)?;
        Ok(out.into())
    }

    /// Overwrite the unconstrained values of all latent nodes from `values`
    /// and re-derive their constrained values.
    ///
    /// Fails without touching any node if `values` has the wrong length.
    pub fn set_flattened_values(&mut self, values: &[f64]) -> Result<()> {
        self.check_size(values.len())?;
        let mut offset = 0;
        for &id in &self.stochastic_nodes {
            let node = self.graph.stochastic_mut(id)?;
            let value = node.unconstrained_value_mut();
            let len = value.len();
            value.read_from_slice(&values[offset..offset + len])?;
            offset += len;
            if !node.transform().is_identity() {
                node.sync_constrained();
            }
        }
        Ok(())
    }

    /// Add `delta` to the flattened unconstrained values.
    pub fn add_increment(&mut self, delta: &[f64]) -> Result<()> {
        self.check_size(delta.len())?;
        let mut values = vec![0f64; self.flat_size];
        self.write_flattened_values(&mut values)?;
        axpy(self.arch, delta, &mut values, 1f64);
        self.set_flattened_values(&values)
    }

    /// Write the gradients with respect to the unconstrained values into `out`.
    pub fn write_flattened_grads(&self, out: &mut [f64]) -> Result<()> {
        self.check_size(out.len())?;
        let mut offset = 0;
        for &id in &self.stochastic_nodes {
            let grad = self.graph.stochastic(id)?.grad();
            let len = grad.len();
            grad.write_to_slice(&mut out[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    pub fn flattened_grads(&self) -> Result<Box<[f64]>> {
        let mut out = vec![0f64; self.flat_size];
        self.write_flattened_grads(&mut out)?;
        Ok(out.into())
    }

    /// Recompute all gradients with one reverse-mode pass.
    pub fn update_backgrad(&mut self) -> Result<()> {
        self.graph.update_backgrad(&self.ordered_support)?;
        Ok(())
    }

    /// Recompute the cached joint log density.
    pub fn update_log_prob(&mut self) -> Result<()> {
        self.log_prob = self.graph.full_log_prob(&self.ordered_support)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{distribution::Distribution, node::Operator, transform::Transform, value::ValueType};
    use pretty_assertions::assert_eq;

    fn model() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let zero = g.add_constant(0.);
        let one = g.add_constant(1.);
        let mu = g.add_stochastic(Distribution::Normal, &[zero, one]).unwrap();
        let sigma = g.add_stochastic(Distribution::HalfNormal, &[one]).unwrap();
        let theta = g
            .add_iid_stochastic(Distribution::Normal, &[mu, sigma], 2, 2)
            .unwrap();
        let total = g.add_operator(Operator::Sum, &[theta]).unwrap();
        let y = g.add_stochastic(Distribution::Normal, &[total, one]).unwrap();
        g.observe(y, 0.7).unwrap();
        g.query(sigma).unwrap();
        (g, mu, sigma, theta)
    }

    #[test]
    fn partitions_support() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (g, mu, sigma, theta) = model();
        let state = InferenceState::new(g, 1).unwrap();
        assert_eq!(state.stochastic_nodes(), &[mu, sigma, theta]);
        // constants, the sum and the query
        assert_eq!(state.deterministic_nodes().len(), 4);
        assert_eq!(state.ordered_support().len(), 8);
        assert_eq!(state.flat_size(), 6);
        assert!(state.log_prob().is_finite());
    }

    #[test]
    fn unconstrained_shapes_match_backups() {
        let (g, ..) = model();
        let state = InferenceState::new(g, 5).unwrap();
        for (&id, val, grad) in izip!(state.stochastic_nodes(), &state.vals_backup, &state.grads_backup) {
            let node = state.graph().stochastic(id).unwrap();
            assert_eq!(node.unconstrained_value().value_type(), val.value_type());
            assert_eq!(node.grad().value_type(), grad.value_type());
        }
        let theta = state.graph().stochastic(state.stochastic_nodes()[2]).unwrap();
        assert_eq!(theta.value_type(), ValueType::Matrix { rows: 2, cols: 2 });
    }

    #[test]
    fn set_keeps_constrained_in_sync() {
        let (g, _, sigma, _) = model();
        let mut state = InferenceState::new(g, 2).unwrap();
        let mut values = state.flattened_values().unwrap();
        values[1] = 0.5;
        state.set_flattened_values(&values).unwrap();
        let node = state.graph().stochastic(sigma).unwrap();
        assert_eq!(node.transform(), Transform::Log);
        assert_eq!(node.value(), &NodeValue::Scalar(0.5f64.exp()));
    }

    #[test]
    fn init_strategies() {
        let (g, ..) = model();
        let settings = StateSettings {
            seed: 3,
            init: InitStrategy::Zero,
        };
        let state = InferenceState::with_settings(g.clone(), settings).unwrap();
        assert!(state.flattened_values().unwrap().iter().all(|&x| x == 0.));

        let settings = StateSettings {
            seed: 3,
            init: InitStrategy::Random,
        };
        let state = InferenceState::with_settings(g, settings).unwrap();
        let values = state.flattened_values().unwrap();
        assert!(values.iter().all(|&x| x.abs() <= 2. + 1e-12));
        assert!(values.iter().any(|&x| x != 0.));
    }

    #[test]
    fn size_mismatch_leaves_state_unchanged() {
        let (g, ..) = model();
        let mut state = InferenceState::new(g, 4).unwrap();
        let before = state.flattened_values().unwrap();
        let err = state.set_flattened_values(&[1.; 5]).unwrap_err();
        assert_eq!(
            err,
            StateError::SizeMismatch(SizeMismatch {
                expected: 6,
                found: 5
            })
        );
        assert!(state.add_increment(&[1.; 7]).is_err());
        let mut short = [0f64; 2];
        assert!(state.write_flattened_grads(&mut short).is_err());
        assert_eq!(state.flattened_values().unwrap(), before);
    }

    #[test]
    fn revert_restores_cached_log_prob() {
        let (g, ..) = model();
        let mut state = InferenceState::new(g, 9).unwrap();
        let committed = state.log_prob();
        state.backup_values().unwrap();
        state.add_increment(&[0.25; 6]).unwrap();
        state.update_log_prob().unwrap();
        assert_ne!(state.log_prob(), committed);
        state.revert_values().unwrap();
        assert_eq!(state.log_prob(), committed);
        state.update_log_prob().unwrap();
        assert_eq!(state.log_prob(), committed);
    }
}
