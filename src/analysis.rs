//! Memoized structural analyses over a graph.
//!
//! An [`AnalysisCache`] lives beside the graph it analyses. Results are
//! computed on first request with one pass over all nodes and handed out by
//! reference afterwards. The cache remembers the id and version of the graph
//! it was filled from and drops everything as soon as it sees a different
//! graph or a structural change, so stale results are never returned.
//!
//! The cache is not synchronized. [`AnalysisCache::get`] takes `&mut self`,
//! which rules out two concurrent first computations within one thread;
//! sharing a cache between threads requires external locking.

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
};

use log::{debug, trace};

use crate::{
    graph::{Graph, GraphError, GraphId},
    node::{Node, NodeId},
};

/// A derived, order-independent property of a whole graph.
pub trait Analysis: 'static {
    type Output: 'static;

    fn compute(graph: &Graph) -> Self::Output;
}

#[derive(Default)]
pub struct AnalysisCache {
    stamp: Option<(GraphId, u64)>,
    entries: HashMap<TypeId, Box<dyn Any>>,
}

impl std::fmt::Debug for AnalysisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisCache")
            .field("stamp", &self.stamp)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sync_with(&mut self, graph: &Graph) {
        let stamp = (graph.id(), graph.version());
        if self.stamp == Some(stamp) {
            return;
        }
        if !self.entries.is_empty() {
            debug!(
                "Graph {:?} changed since last analysis, dropping {} cached results",
                graph.id(),
                self.entries.len()
            );
        }
        self.entries.clear();
        self.stamp = Some(stamp);
    }

    /// The result of analysis `A` for `graph`, computed on first use.
    pub fn get<A: Analysis>(&mut self, graph: &Graph) -> &A::Output {
        self.sync_with(graph);
        let entry = self.entries.entry(TypeId::of::<A>()).or_insert_with(|| {
            debug!("Computing {} for graph {:?}", type_name::<A>(), graph.id());
            Box::new(A::compute(graph))
        });
        trace!("Serving {} from cache", type_name::<A>());
        entry
            .downcast_ref::<A::Output>()
            .expect("analysis results are stored under their own type id")
    }

    /// Whether a current result of `A` for `graph` is available.
    pub fn is_cached<A: Analysis>(&self, graph: &Graph) -> bool {
        self.stamp == Some((graph.id(), graph.version()))
            && self.entries.contains_key(&TypeId::of::<A>())
    }

    /// Drop every cached result.
    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.stamp = None;
    }
}

/// For every node, the nodes that read it as an input, in the order they
/// appear in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Successors {
    origin: GraphId,
    out_nodes: Vec<Vec<NodeId>>,
}

impl Successors {
    /// Fails with [`GraphError::NodeNotFound`] for handles of other graphs.
    pub fn of(&self, node: NodeId) -> Result<&[NodeId], GraphError> {
        if node.graph != self.origin {
            return Err(GraphError::NodeNotFound(node));
        }
        self.out_nodes
            .get(node.index)
            .map(Vec::as_slice)
            .ok_or(GraphError::NodeNotFound(node))
    }
}

impl Analysis for Successors {
    type Output = Successors;

    fn compute(graph: &Graph) -> Successors {
        let mut out_nodes = vec![Vec::new(); graph.len()];
        for (id, node) in graph.nodes() {
            match node {
                Node::Constant(_) | Node::Variable(_) => (),
                Node::Query(query) => out_nodes[query.input().index].push(id),
                Node::Stochastic(_) | Node::Deterministic(_) => {
                    for input in node.inputs() {
                        out_nodes[input.index].push(id);
                    }
                }
            }
        }
        Successors {
            origin: graph.origin(),
            out_nodes,
        }
    }
}

/// The direct consumers of `node`.
pub fn out_nodes<'c>(
    cache: &'c mut AnalysisCache,
    graph: &Graph,
    node: NodeId,
) -> Result<&'c [NodeId], GraphError> {
    cache.get::<Successors>(graph).of(node)
}
