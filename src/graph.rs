use std::{
    collections::BTreeSet,
    sync::atomic::{AtomicU64, Ordering},
};

use itertools::izip;
use log::{debug, trace};
use rand::Rng;
use thiserror::Error;

use crate::{
    distribution::Distribution,
    node::{
        scalar_input, ConstantNode, DeterministicNode, Node, NodeId, Operator, QueryNode,
        StochasticNode, VariableNode,
    },
    transform::Transform,
    value::{NodeValue, ValueType},
};

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// The handle was issued by another graph or is out of range. This is
    /// always a bug in the caller.
    #[error("node {0} is not in the graph")]
    NodeNotFound(NodeId),
    #[error("{name} does not accept {found} inputs")]
    Arity { name: &'static str, found: usize },
    #[error("input {input} of {name} must be a scalar")]
    TypeMismatch { name: &'static str, input: NodeId },
    #[error("node {0} is not stochastic")]
    NotStochastic(NodeId),
    #[error("node {0} is not a variable")]
    NotVariable(NodeId),
    #[error("value for node {node} has type {found:?}, expected {expected:?}")]
    ShapeMismatch {
        node: NodeId,
        expected: ValueType,
        found: ValueType,
    },
    #[error("constant node {0} cannot be queried")]
    InvalidQuery(NodeId),
}

pub type Result<T> = std::result::Result<T, GraphError>;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a graph, unique for every graph and every clone of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(u64);

impl GraphId {
    pub(crate) fn next() -> Self {
        GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An arena of computation nodes.
///
/// Inputs of a new node must already be in the arena, so insertion order is
/// a topological order and the graph can never contain a cycle.
///
/// Every structural change (new node, observation, query, transform change)
/// bumps [`Graph::version`]. Structural analyses use the pair of
/// [`Graph::id`] and version to decide whether cached results are stale.
///
/// Node handles are stamped with the id of the graph that created them. A
/// clone keeps accepting the handles of the graph it was cloned from, and
/// every other graph rejects them with [`GraphError::NodeNotFound`].
#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    origin: GraphId,
    version: u64,
    nodes: Vec<Node>,
    queries: Vec<NodeId>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Graph {
            id: GraphId::next(),
            origin: self.origin,
            version: self.version,
            nodes: self.nodes.clone(),
            queries: self.queries.clone(),
        }
    }
}

fn accumulate(slot: &mut Option<NodeValue>, grad: NodeValue) {
    match slot {
        Some(total) => *total = total.zip_map(&grad, |a, b| a + b),
        None => *slot = Some(grad),
    }
}

impl Graph {
    pub fn new() -> Self {
        let id = GraphId::next();
        Graph {
            id,
            origin: id,
            version: 0,
            nodes: Vec::new(),
            queries: Vec::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The id stamped into every handle this graph accepts.
    pub(crate) fn origin(&self) -> GraphId {
        self.origin
    }

    pub(crate) fn handle(&self, index: usize) -> NodeId {
        NodeId {
            graph: self.origin,
            index,
        }
    }

    /// Whether `id` was issued by this graph (or the graph it was cloned
    /// from) and refers to an existing node.
    pub fn contains(&self, id: NodeId) -> bool {
        id.graph == self.origin && id.index < self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        if id.graph != self.origin {
            return Err(GraphError::NodeNotFound(id));
        }
        self.nodes.get(id.index).ok_or(GraphError::NodeNotFound(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        if id.graph != self.origin {
            return Err(GraphError::NodeNotFound(id));
        }
        self.nodes.get_mut(id.index).ok_or(GraphError::NodeNotFound(id))
    }

    pub fn stochastic(&self, id: NodeId) -> Result<&StochasticNode> {
        self.node(id)?
            .as_stochastic()
            .ok_or(GraphError::NotStochastic(id))
    }

    pub(crate) fn stochastic_mut(&mut self, id: NodeId) -> Result<&mut StochasticNode> {
        self.node_mut(id)?
            .as_stochastic_mut()
            .ok_or(GraphError::NotStochastic(id))
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl ExactSizeIterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (self.handle(i), node))
    }

    /// The query nodes, in the order they were added.
    pub fn queries(&self) -> &[NodeId] {
        &self.queries
    }

    pub fn observations(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes()
            .filter(|(_, node)| node.is_observed())
            .map(|(id, _)| id)
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = self.handle(self.nodes.len());
        trace!("Adding {:?} node {id}", node.kind());
        self.nodes.push(node);
        self.version += 1;
        id
    }

    fn check_inputs(
        &self,
        name: &'static str,
        inputs: &[NodeId],
        (min, max): (usize, Option<usize>),
        allow_matrix: bool,
    ) -> Result<()> {
        if inputs.len() < min || max.is_some_and(|max| inputs.len() > max) {
            return Err(GraphError::Arity {
                name,
                found: inputs.len(),
            });
        }
        for &input in inputs {
            let node = self.node(input)?;
            if !allow_matrix && node.value_type() != ValueType::Scalar {
                return Err(GraphError::TypeMismatch { name, input });
            }
        }
        Ok(())
    }

    pub fn add_constant(&mut self, value: impl Into<NodeValue>) -> NodeId {
        self.push(Node::Constant(ConstantNode {
            value: value.into(),
        }))
    }

    pub fn add_variable(&mut self, name: impl Into<String>, value: impl Into<NodeValue>) -> NodeId {
        self.push(Node::Variable(VariableNode {
            name: name.into(),
            value: value.into(),
        }))
    }

    /// Bind a new value to a variable node. The shape must not change.
    pub fn set_variable(&mut self, id: NodeId, value: impl Into<NodeValue>) -> Result<()> {
        let value = value.into();
        let Node::Variable(node) = self.node_mut(id)? else {
            return Err(GraphError::NotVariable(id));
        };
        if node.value.value_type() != value.value_type() {
            return Err(GraphError::ShapeMismatch {
                node: id,
                expected: node.value.value_type(),
                found: value.value_type(),
            });
        }
        node.value = value;
        Ok(())
    }

    /// Add a scalar sample from `distribution` with parameters `inputs`.
    pub fn add_stochastic(&mut self, distribution: Distribution, inputs: &[NodeId]) -> Result<NodeId> {
        self.add_sample(distribution, inputs, ValueType::Scalar)
    }

    /// Add a `rows x cols` matrix of independent samples from `distribution`.
    pub fn add_iid_stochastic(
        &mut self,
        distribution: Distribution,
        inputs: &[NodeId],
        rows: usize,
        cols: usize,
    ) -> Result<NodeId> {
        self.add_sample(distribution, inputs, ValueType::Matrix { rows, cols })
    }

    fn add_sample(
        &mut self,
        distribution: Distribution,
        inputs: &[NodeId],
        value_type: ValueType,
    ) -> Result<NodeId> {
        let arity = distribution.arity();
        self.check_inputs(distribution.name(), inputs, (arity, Some(arity)), false)?;
        Ok(self.push(Node::Stochastic(StochasticNode::new(
            distribution,
            inputs.to_vec(),
            value_type,
        ))))
    }

    pub fn add_operator(&mut self, op: Operator, inputs: &[NodeId]) -> Result<NodeId> {
        self.check_inputs(op.name(), inputs, op.arity(), op.accepts_matrix())?;
        let value = op.apply(&self.input_values(inputs)?);
        Ok(self.push(Node::Deterministic(DeterministicNode {
            op,
            inputs: inputs.to_vec(),
            value,
        })))
    }

    /// Fix the value of a stochastic node. Observed nodes are never sampled
    /// and are not part of the latent vector.
    pub fn observe(&mut self, id: NodeId, value: impl Into<NodeValue>) -> Result<()> {
        let value = value.into();
        let node = self.stochastic_mut(id)?;
        if node.value_type != value.value_type() {
            return Err(GraphError::ShapeMismatch {
                node: id,
                expected: node.value_type,
                found: value.value_type(),
            });
        }
        node.value = value;
        node.observed = true;
        node.materialize_unconstrained();
        self.version += 1;
        Ok(())
    }

    /// Mark `id` as a quantity of interest. Returns the new query node.
    pub fn query(&mut self, id: NodeId) -> Result<NodeId> {
        let node = self.node(id)?;
        if let Node::Constant(_) = node {
            return Err(GraphError::InvalidQuery(id));
        }
        let value = node.value().clone();
        let query = self.push(Node::Query(QueryNode { input: id, value }));
        self.queries.push(query);
        Ok(query)
    }

    /// Replace the default transform of a stochastic node.
    pub fn customize_transform(&mut self, id: NodeId, transform: Transform) -> Result<()> {
        let node = self.stochastic_mut(id)?;
        node.transform = transform;
        node.materialize_unconstrained();
        self.version += 1;
        Ok(())
    }

    /// The queried and observed nodes together with all of their ancestors.
    pub fn compute_support(&self) -> BTreeSet<NodeId> {
        let mut support = BTreeSet::new();
        let mut stack: Vec<NodeId> = self
            .queries
            .iter()
            .copied()
            .chain(self.observations())
            .collect();
        let roots = stack.len();
        while let Some(id) = stack.pop() {
            if !support.insert(id) {
                continue;
            }
            stack.extend(self.nodes[id.index].inputs().iter().copied());
        }
        debug!(
            "Support of graph {:?} has {} of {} nodes ({} roots)",
            self.id,
            support.len(),
            self.nodes.len(),
            roots
        );
        support
    }

    fn input_values(&self, inputs: &[NodeId]) -> Result<Vec<&NodeValue>> {
        inputs
            .iter()
            .map(|&input| self.node(input).map(Node::value))
            .collect()
    }

    fn scalar_params(&self, inputs: &[NodeId]) -> Result<Vec<f64>> {
        inputs
            .iter()
            .map(|&input| self.node(input).map(|node| scalar_input(node.value())))
            .collect()
    }

    /// Recompute a deterministic or query node from its inputs.
    fn recompute(&mut self, id: NodeId) -> Result<()> {
        let value = match self.node(id)? {
            Node::Deterministic(node) => node.op.apply(&self.input_values(&node.inputs)?),
            Node::Query(node) => self.node(node.input)?.value().clone(),
            _ => return Ok(()),
        };
        match self.node_mut(id)? {
            Node::Deterministic(node) => node.value = value,
            Node::Query(node) => node.value = value,
            _ => (),
        }
        Ok(())
    }

    /// Assign a fresh value to a node: stochastic nodes draw from their
    /// distribution, deterministic and query nodes are recomputed, constants
    /// and variables are left alone.
    pub fn eval<R: Rng + ?Sized>(&mut self, id: NodeId, rng: &mut R) -> Result<()> {
        let (distribution, value_type, params) = match self.node(id)? {
            Node::Stochastic(node) => (
                node.distribution,
                node.value_type,
                self.scalar_params(&node.inputs)?,
            ),
            _ => return self.recompute(id),
        };
        let value = NodeValue::from_fn(value_type, || distribution.sample(&params, rng));
        let node = self.stochastic_mut(id)?;
        node.value = value;
        node.materialize_unconstrained();
        Ok(())
    }

    /// Recompute every deterministic and query node in `ordered`.
    pub fn eval_deterministic(&mut self, ordered: &[NodeId]) -> Result<()> {
        for &id in ordered {
            self.recompute(id)?;
        }
        Ok(())
    }

    /// Joint log density of the stochastic nodes in `ordered`, including the
    /// log Jacobian of the transform of every latent node.
    ///
    /// Deterministic nodes are recomputed first, so the result reflects the
    /// current values of the latent nodes.
    pub fn full_log_prob(&mut self, ordered: &[NodeId]) -> Result<f64> {
        self.eval_deterministic(ordered)?;
        let mut log_prob = 0f64;
        for &id in ordered {
            if let Node::Stochastic(node) = self.node(id)? {
                let params = self.scalar_params(&node.inputs)?;
                log_prob += node.log_prob(&params);
            }
        }
        Ok(log_prob)
    }

    /// One reverse-mode pass over `ordered`, leaving in every latent
    /// stochastic node the gradient of the joint log density with respect to
    /// its unconstrained value.
    pub fn update_backgrad(&mut self, ordered: &[NodeId]) -> Result<()> {
        self.eval_deterministic(ordered)?;
        let mut adjoints: Vec<Option<NodeValue>> = vec![None; self.nodes.len()];

        // Seed with the partials of every local density term.
        for &id in ordered {
            let Node::Stochastic(node) = self.node(id)? else {
                continue;
            };
            let params = self.scalar_params(&node.inputs)?;
            let mut dparams = vec![0f64; params.len()];
            let dx = node
                .value
                .map(|x| node.distribution.grad(x, &params, &mut dparams));
            if !node.observed {
                accumulate(&mut adjoints[id.index], dx);
            }
            for (input, dparam) in izip!(&node.inputs, dparams) {
                accumulate(&mut adjoints[input.index], NodeValue::Scalar(dparam));
            }
        }

        // Every consumer of a deterministic or query node comes later in
        // `ordered`, so its adjoint is complete once we reach it.
        for &id in ordered.iter().rev() {
            match self.node(id)? {
                Node::Deterministic(node) => {
                    let Some(adj) = adjoints[id.index].take() else {
                        continue;
                    };
                    let output = scalar_input(&node.value);
                    let adj = scalar_input(&adj);
                    let args = self.input_values(&node.inputs)?;
                    let grads = node.op.backward(&args, output, adj);
                    for (input, grad) in izip!(&node.inputs, grads) {
                        accumulate(&mut adjoints[input.index], grad);
                    }
                }
                // A query passes its input through unchanged.
                Node::Query(node) => {
                    if let Some(adj) = adjoints[id.index].take() {
                        accumulate(&mut adjoints[node.input.index], adj);
                    }
                }
                _ => (),
            }
        }

        for &id in ordered {
            let adj = adjoints[id.index].take();
            let Some(node) = self.node_mut(id)?.as_stochastic_mut() else {
                continue;
            };
            if node.observed {
                continue;
            }
            let adj = adj.unwrap_or_else(|| NodeValue::zeros(node.value_type));
            node.grad = node.transform.unconstrained_grad(&node.value, &adj);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ids(g: &Graph, items: &[usize]) -> BTreeSet<NodeId> {
        items.iter().map(|&i| g.handle(i)).collect()
    }

    #[test]
    fn support_is_ancestor_closure() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let zero = g.add_constant(0.);
        let one = g.add_constant(1.);
        let mu = g.add_stochastic(Distribution::Normal, &[zero, one])?;
        let y = g.add_stochastic(Distribution::Normal, &[mu, one])?;
        // unrelated to any query or observation
        let _other = g.add_stochastic(Distribution::Normal, &[zero, one])?;
        g.observe(y, 0.5)?;
        assert_eq!(g.compute_support(), ids(&g, &[0, 1, 2, 3]));

        let q = g.query(mu)?;
        assert_eq!(g.compute_support(), ids(&g, &[0, 1, 2, 3, q.index()]));
        Ok(())
    }

    #[test]
    fn builder_validation() {
        let mut g = Graph::new();
        let one = g.add_constant(1.);
        let mat = g.add_constant(faer::Mat::<f64>::zeros(2, 2));

        assert_eq!(
            g.add_stochastic(Distribution::Normal, &[one]),
            Err(GraphError::Arity {
                name: "Normal",
                found: 1
            })
        );
        let missing = g.handle(42);
        assert_eq!(
            g.add_stochastic(Distribution::Normal, &[one, missing]),
            Err(GraphError::NodeNotFound(missing))
        );
        assert_eq!(
            g.add_operator(Operator::Exp, &[mat]),
            Err(GraphError::TypeMismatch {
                name: "Exp",
                input: mat
            })
        );
        assert!(g.add_operator(Operator::Sum, &[mat]).is_ok());
        assert_eq!(g.query(one), Err(GraphError::InvalidQuery(one)));
        assert_eq!(g.observe(one, 2.), Err(GraphError::NotStochastic(one)));

        let x = g.add_stochastic(Distribution::Normal, &[one, one]).unwrap();
        assert!(matches!(
            g.observe(x, faer::Mat::<f64>::zeros(1, 1)),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn structural_changes_bump_version() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let v0 = g.version();
        let one = g.add_constant(1.);
        let x = g.add_stochastic(Distribution::Gamma, &[one, one])?;
        let v1 = g.version();
        assert!(v1 > v0);
        g.customize_transform(x, Transform::Identity)?;
        assert!(g.version() > v1);

        let clone = g.clone();
        assert_ne!(clone.id(), g.id());
        assert_eq!(clone.version(), g.version());
        Ok(())
    }

    #[test]
    fn eval_follows_inputs() -> anyhow::Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut g = Graph::new();
        let a = g.add_variable("a", 2.);
        let b = g.add_constant(3.);
        let sum = g.add_operator(Operator::Add, &[a, b])?;
        let exp = g.add_operator(Operator::Exp, &[sum])?;
        assert_abs_diff_eq!(g.node(exp)?.value().as_scalar().unwrap(), 5f64.exp());

        g.set_variable(a, -1.)?;
        g.eval_deterministic(&[sum, exp])?;
        assert_abs_diff_eq!(g.node(exp)?.value().as_scalar().unwrap(), 2f64.exp());

        let scale = g.add_constant(1.);
        let x = g.add_iid_stochastic(Distribution::HalfNormal, &[scale], 3, 2)?;
        g.eval(x, &mut rng)?;
        let node = g.node(x)?.as_stochastic().unwrap();
        assert_eq!(node.value().len(), 6);
        assert!(node.value().fold(true, |ok, v| ok && v >= 0.));
        Ok(())
    }

    #[test]
    fn log_prob_sums_local_terms() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let zero = g.add_constant(0.);
        let one = g.add_constant(1.);
        let mu = g.add_stochastic(Distribution::Normal, &[zero, one])?;
        let y = g.add_stochastic(Distribution::Normal, &[mu, one])?;
        g.observe(y, 1.0)?;
        let q = g.query(mu)?;
        let ordered: Vec<_> = g.compute_support().into_iter().collect();
        let expected = Distribution::Normal.log_prob(0., &[0., 1.])
            + Distribution::Normal.log_prob(1., &[0., 1.]);
        assert_abs_diff_eq!(g.full_log_prob(&ordered)?, expected);
        assert_eq!(g.node(q)?.value(), &NodeValue::Scalar(0.));
        Ok(())
    }

    #[test]
    fn backgrad_through_deterministic_chain() -> anyhow::Result<()> {
        // x ~ N(0, 1); y ~ N(exp(2x), 1) observed at 1
        let mut g = Graph::new();
        let zero = g.add_constant(0.);
        let one = g.add_constant(1.);
        let two = g.add_constant(2.);
        let x = g.add_stochastic(Distribution::Normal, &[zero, one])?;
        let scaled = g.add_operator(Operator::Multiply, &[two, x])?;
        let loc = g.add_operator(Operator::Exp, &[scaled])?;
        let y = g.add_stochastic(Distribution::Normal, &[loc, one])?;
        g.observe(y, 1.)?;
        g.stochastic_mut(x)?.value = NodeValue::Scalar(0.3);

        let ordered: Vec<_> = g.compute_support().into_iter().collect();
        g.update_backgrad(&ordered)?;
        let grad = g.node(x)?.as_stochastic().unwrap().grad().as_scalar().unwrap();

        let e = (0.6f64).exp();
        let expected = -0.3 + (1. - e) * 2. * e;
        assert_abs_diff_eq!(grad, expected, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn backgrad_passes_through_queries() -> anyhow::Result<()> {
        // x ~ N(0, 1); y ~ N(q, 1) observed at 3, where q queries x
        let mut g = Graph::new();
        let zero = g.add_constant(0.);
        let one = g.add_constant(1.);
        let x = g.add_stochastic(Distribution::Normal, &[zero, one])?;
        let q = g.query(x)?;
        let y = g.add_stochastic(Distribution::Normal, &[q, one])?;
        g.observe(y, 3.)?;
        g.stochastic_mut(x)?.value = NodeValue::Scalar(0.4);

        let ordered: Vec<_> = g.compute_support().into_iter().collect();
        g.update_backgrad(&ordered)?;
        let grad = g.stochastic(x)?.grad().as_scalar().unwrap();

        let h = 1e-6;
        let mut log_prob_at = |v: f64| -> anyhow::Result<f64> {
            g.stochastic_mut(x)?.value = NodeValue::Scalar(v);
            Ok(g.full_log_prob(&ordered)?)
        };
        let numeric = (log_prob_at(0.4 + h)? - log_prob_at(0.4 - h)?) / (2. * h);
        assert_abs_diff_eq!(grad, numeric, epsilon = 1e-6);
        assert_abs_diff_eq!(grad, -0.4 + (3. - 0.4), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn foreign_handles_are_rejected() -> anyhow::Result<()> {
        let mut small = Graph::new();
        let foreign = small.add_constant(1.);

        let mut g = Graph::new();
        let a = g.add_variable("a", 2.);
        g.add_operator(Operator::Exp, &[a])?;
        assert_eq!(foreign.index(), a.index());
        assert!(!g.contains(foreign));
        assert_eq!(g.node(foreign).err(), Some(GraphError::NodeNotFound(foreign)));
        assert_eq!(
            g.add_operator(Operator::Negate, &[foreign]),
            Err(GraphError::NodeNotFound(foreign))
        );
        assert_eq!(g.query(foreign), Err(GraphError::NodeNotFound(foreign)));
        Ok(())
    }

    #[test]
    fn clones_accept_original_handles() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let a = g.add_variable("a", 2.);
        let mut clone = g.clone();
        assert!(clone.contains(a));
        let b = clone.add_operator(Operator::Exp, &[a])?;
        assert!(clone.node(b).is_ok());
        assert!(!g.contains(b));
        Ok(())
    }
}
