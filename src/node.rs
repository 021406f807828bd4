use crate::{
    distribution::Distribution,
    graph::GraphId,
    transform::Transform,
    value::{NodeValue, ValueType},
};

/// Stable handle of a node inside its graph's arena.
///
/// A handle remembers the graph that issued it and is only accepted by that
/// graph and its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) graph: GraphId,
    pub(crate) index: usize,
}

impl NodeId {
    /// Position of the node in insertion order.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.index)
    }
}

/// Discriminator of the `Node` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Variable,
    Stochastic,
    Deterministic,
    Query,
}

/// Read a value the builder has checked to be scalar.
pub(crate) fn scalar_input(value: &NodeValue) -> f64 {
    debug_assert!(
        value.as_scalar().is_some(),
        "builder admitted a matrix where a scalar is required"
    );
    value.as_scalar().unwrap_or(f64::NAN)
}

/// Deterministic operations on node values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Sum of two or more scalars.
    Add,
    /// Product of two or more scalars.
    Multiply,
    Negate,
    Exp,
    Log,
    /// Sum of all elements of a scalar or matrix input.
    Sum,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Add => "Add",
            Operator::Multiply => "Multiply",
            Operator::Negate => "Negate",
            Operator::Exp => "Exp",
            Operator::Log => "Log",
            Operator::Sum => "Sum",
        }
    }

    /// Inclusive bounds on the number of inputs.
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Operator::Add | Operator::Multiply => (2, None),
            Operator::Negate | Operator::Exp | Operator::Log | Operator::Sum => (1, Some(1)),
        }
    }

    /// Whether the operator accepts matrix inputs.
    pub(crate) fn accepts_matrix(&self) -> bool {
        matches!(self, Operator::Sum)
    }

    pub(crate) fn apply(&self, args: &[&NodeValue]) -> NodeValue {
        let scalar = |k: usize| scalar_input(args[k]);
        let val = match self {
            Operator::Add => (0..args.len()).map(scalar).sum(),
            Operator::Multiply => (0..args.len()).map(scalar).product(),
            Operator::Negate => -scalar(0),
            Operator::Exp => scalar(0).exp(),
            Operator::Log => scalar(0).ln(),
            Operator::Sum => args[0].sum(),
        };
        NodeValue::Scalar(val)
    }

    /// Propagate the adjoint `adj` of the output to the adjoints of the inputs.
    pub(crate) fn backward(&self, args: &[&NodeValue], output: f64, adj: f64) -> Vec<NodeValue> {
        let scalar = |k: usize| scalar_input(args[k]);
        match self {
            Operator::Add => args.iter().map(|_| NodeValue::Scalar(adj)).collect(),
            Operator::Multiply => (0..args.len())
                .map(|k| {
                    let others: f64 = (0..args.len()).filter(|&m| m != k).map(scalar).product();
                    NodeValue::Scalar(adj * others)
                })
                .collect(),
            Operator::Negate => vec![NodeValue::Scalar(-adj)],
            Operator::Exp => vec![NodeValue::Scalar(adj * output)],
            Operator::Log => vec![NodeValue::Scalar(adj / scalar(0))],
            Operator::Sum => vec![args[0].map(|_| adj)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConstantNode {
    pub(crate) value: NodeValue,
}

/// A named input whose value is bound from outside the model.
#[derive(Debug, Clone)]
pub struct VariableNode {
    pub(crate) name: String,
    pub(crate) value: NodeValue,
}

impl VariableNode {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct DeterministicNode {
    pub(crate) op: Operator,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) value: NodeValue,
}

impl DeterministicNode {
    pub fn op(&self) -> Operator {
        self.op
    }
}

#[derive(Debug, Clone)]
pub struct QueryNode {
    pub(crate) input: NodeId,
    pub(crate) value: NodeValue,
}

impl QueryNode {
    pub fn input(&self) -> NodeId {
        self.input
    }
}

/// A node whose value is drawn from a distribution.
///
/// The unconstrained representation is only stored separately for
/// non-identity transforms; otherwise it is the constrained value itself.
#[derive(Debug, Clone)]
pub struct StochasticNode {
    pub(crate) distribution: Distribution,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) value_type: ValueType,
    pub(crate) transform: Transform,
    pub(crate) value: NodeValue,
    pub(crate) unconstrained: Option<NodeValue>,
    pub(crate) grad: NodeValue,
    pub(crate) observed: bool,
}

impl StochasticNode {
    pub(crate) fn new(distribution: Distribution, inputs: Vec<NodeId>, value_type: ValueType) -> Self {
        StochasticNode {
            distribution,
            inputs,
            value_type,
            transform: distribution.default_transform(),
            value: NodeValue::zeros(value_type),
            unconstrained: None,
            grad: NodeValue::zeros(value_type),
            observed: false,
        }
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    pub fn unconstrained_value(&self) -> &NodeValue {
        self.unconstrained.as_ref().unwrap_or(&self.value)
    }

    pub(crate) fn unconstrained_value_mut(&mut self) -> &mut NodeValue {
        match &mut self.unconstrained {
            Some(unconstrained) => unconstrained,
            None => &mut self.value,
        }
    }

    /// Gradient of the joint log density with respect to the unconstrained value.
    pub fn grad(&self) -> &NodeValue {
        &self.grad
    }

    pub(crate) fn grad_mut(&mut self) -> &mut NodeValue {
        &mut self.grad
    }

    /// Derive the unconstrained value from the constrained one.
    ///
    /// For latent nodes the constrained value is then re-derived from it, so
    /// that every later inverse transform of the same unconstrained value is
    /// bit-identical. Observed values are never touched.
    pub(crate) fn materialize_unconstrained(&mut self) {
        if self.transform.is_identity() {
            self.unconstrained = None;
            return;
        }
        let unconstrained = self.transform.to_unconstrained(&self.value);
        if !self.observed {
            self.value = self.transform.to_constrained(&unconstrained);
        }
        self.unconstrained = Some(unconstrained);
    }

    /// Replace the unconstrained value and derive the constrained one from it.
    pub(crate) fn set_unconstrained(&mut self, unconstrained: NodeValue) {
        if self.transform.is_identity() {
            self.unconstrained = None;
            self.value = unconstrained;
        } else {
            self.value = self.transform.to_constrained(&unconstrained);
            self.unconstrained = Some(unconstrained);
        }
    }

    /// Recompute the constrained value from the unconstrained one.
    pub(crate) fn sync_constrained(&mut self) {
        if let Some(unconstrained) = &self.unconstrained {
            self.value = self.transform.to_constrained(unconstrained);
        }
    }

    /// Log density of the current value given scalar parameters, plus the
    /// log Jacobian of the transform for latent nodes.
    pub(crate) fn log_prob(&self, params: &[f64]) -> f64 {
        let density = self
            .value
            .fold(0f64, |acc, x| acc + self.distribution.log_prob(x, params));
        if self.observed {
            return density;
        }
        density
            + self
                .transform
                .log_abs_det_jacobian(&self.value, self.unconstrained_value())
    }
}

/// A node of the computation graph.
#[derive(Debug, Clone)]
pub enum Node {
    Constant(ConstantNode),
    Variable(VariableNode),
    Stochastic(StochasticNode),
    Deterministic(DeterministicNode),
    Query(QueryNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Constant(_) => NodeKind::Constant,
            Node::Variable(_) => NodeKind::Variable,
            Node::Stochastic(_) => NodeKind::Stochastic,
            Node::Deterministic(_) => NodeKind::Deterministic,
            Node::Query(_) => NodeKind::Query,
        }
    }

    /// The nodes this node reads from, in order.
    pub fn inputs(&self) -> &[NodeId] {
        match self {
            Node::Constant(_) | Node::Variable(_) => &[],
            Node::Stochastic(node) => &node.inputs,
            Node::Deterministic(node) => &node.inputs,
            Node::Query(node) => std::slice::from_ref(&node.input),
        }
    }

    /// The current constrained value.
    pub fn value(&self) -> &NodeValue {
        match self {
            Node::Constant(node) => &node.value,
            Node::Variable(node) => &node.value,
            Node::Stochastic(node) => &node.value,
            Node::Deterministic(node) => &node.value,
            Node::Query(node) => &node.value,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Node::Stochastic(node) => node.value_type,
            _ => self.value().value_type(),
        }
    }

    pub fn is_stochastic(&self) -> bool {
        matches!(self, Node::Stochastic(_))
    }

    pub fn is_observed(&self) -> bool {
        matches!(self, Node::Stochastic(node) if node.observed)
    }

    pub fn as_stochastic(&self) -> Option<&StochasticNode> {
        match self {
            Node::Stochastic(node) => Some(node),
            _ => None,
        }
    }

    pub(crate) fn as_stochastic_mut(&mut self) -> Option<&mut StochasticNode> {
        match self {
            Node::Stochastic(node) => Some(node),
            _ => None,
        }
    }
}
