//! # Expression Graph
//!
//! [`ExprGraph`] is an arena of [`ExprNode`]s wired by operand edges. Nodes
//! are referred to through copyable [`ExprId`] handles; handle equality is
//! node identity.
//!
//! ## Key Properties
//!
//! - **Acyclic by construction**: a node can only name operands that already
//!   exist, so node index order is a topological order
//! - **Sharing**: one node may feed many consumers
//! - **Hash-consing**: building the same variant over the same operands twice
//!   returns the existing handle (see [`GraphConfig`])
//! - **Validation up front**: every builder checks shapes and returns a
//!   [`CoreError`] instead of a node that could not be evaluated
//!
//! ## Example
//!
//! ```rust
//! use exprgraph_core::{ExprGraph, SparsityPattern};
//!
//! let mut g = ExprGraph::new();
//! let x = g.input("x", SparsityPattern::dense(1, 2));
//! let y = g.horzrepmat(x, 3).unwrap();
//! assert_eq!(g.sparsity(y).unwrap().dims(), "1x6");
//! assert_eq!(g.describe(y).unwrap(), "repmat(x, 3)");
//! ```

use std::collections::HashMap;
use std::fmt;

use log::trace;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::CoreError;
use crate::ops::{ConstValues, ExprNode, ExprOp, Reduction};
use crate::sparsity::SparsityPattern;

/// Handle to a node of an [`ExprGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(NodeIndex);

impl ExprId {
    /// Position in the arena. Operands always have smaller positions than
    /// their consumers.
    pub fn index(self) -> usize {
        self.0.index()
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.index())
    }
}

/// An operand edge: output `from_port` of the source feeds operand
/// `to_port` of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from_port: usize,
    pub to_port: usize,
}

/// Construction options for an [`ExprGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConfig {
    /// Reuse an existing node for an identical construction.
    pub hash_consing: bool,
    /// Route output sparsity patterns through the process-wide intern pool.
    pub intern_sparsity: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            hash_consing: true,
            intern_sparsity: true,
        }
    }
}

/// Arena DAG of expression nodes.
#[derive(Debug, Clone, Default)]
pub struct ExprGraph {
    graph: DiGraph<ExprNode, Edge>,
    cache: HashMap<(ExprOp, Vec<ExprId>), ExprId>,
    config: GraphConfig,
    n_inputs: usize,
}

impl ExprGraph {
    /// Create an empty graph with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            graph: DiGraph::new(),
            cache: HashMap::new(),
            config,
            n_inputs: 0,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Handles of all nodes in arena (topological) order.
    pub fn ids(&self) -> impl Iterator<Item = ExprId> + '_ {
        self.graph.node_indices().map(ExprId)
    }

    // ========================================================================
    // Construction
    // ========================================================================

    fn check(&self, id: ExprId) -> Result<(), CoreError> {
        if id.index() >= self.graph.node_count() {
            return Err(CoreError::UnknownNode { id: id.index() });
        }
        Ok(())
    }

    /// Insert a node after validating it against its operands.
    fn insert(&mut self, op: ExprOp, operands: &[ExprId]) -> Result<ExprId, CoreError> {
        for &id in operands {
            self.check(id)?;
        }

        let key = (op, operands.to_vec());
        if self.config.hash_consing {
            if let Some(&existing) = self.cache.get(&key) {
                trace!("hash-cons hit: {} -> {existing}", key.0);
                return Ok(existing);
            }
        }

        let inputs = operands
            .iter()
            .map(|&id| self.graph[id.0].sparsity().clone())
            .collect();
        let mut node = ExprNode::new(key.0.clone(), inputs)?;
        if self.config.intern_sparsity {
            node.outputs = node.outputs.into_iter().map(SparsityPattern::interned).collect();
        }

        let id = ExprId(self.graph.add_node(node));
        for (to_port, operand) in operands.iter().enumerate() {
            self.graph.add_edge(
                operand.0,
                id.0,
                Edge {
                    from_port: 0,
                    to_port,
                },
            );
        }
        trace!(
            "created {id} = {} ({})",
            key.0,
            self.graph[id.0].sparsity()
        );
        if self.config.hash_consing {
            self.cache.insert(key, id);
        }
        Ok(id)
    }

    /// Add a free symbolic input. Every call creates a distinct input.
    pub fn input(&mut self, name: impl Into<String>, sparsity: SparsityPattern) -> ExprId {
        let index = self.n_inputs;
        self.n_inputs += 1;
        let op = ExprOp::Input {
            index,
            name: name.into(),
            sparsity: sparsity.clone(),
        };
        let node = ExprNode {
            op,
            inputs: Vec::new(),
            outputs: vec![sparsity],
        };
        let id = ExprId(self.graph.add_node(node));
        trace!("created input {id}");
        id
    }

    /// Add a constant with one value per structural nonzero.
    pub fn constant(&mut self, sparsity: SparsityPattern, values: Vec<f64>) -> Result<ExprId, CoreError> {
        self.insert(
            ExprOp::Constant {
                sparsity,
                values: ConstValues::new(values),
            },
            &[],
        )
    }

    /// A dense constant matrix from column-major values.
    pub fn dense_constant(&mut self, nrow: usize, ncol: usize, values: Vec<f64>) -> Result<ExprId, CoreError> {
        self.constant(SparsityPattern::dense(nrow, ncol), values)
    }

    pub fn scalar(&mut self, value: f64) -> Result<ExprId, CoreError> {
        self.constant(SparsityPattern::scalar(), vec![value])
    }

    /// A structurally zero `nrow x ncol` matrix.
    pub fn zeros(&mut self, nrow: usize, ncol: usize) -> Result<ExprId, CoreError> {
        self.constant(SparsityPattern::empty(nrow, ncol), Vec::new())
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Add, &[a, b])
    }

    /// `alpha * x` with `alpha` 1x1.
    pub fn times(&mut self, alpha: ExprId, x: ExprId) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Times, &[alpha, x])
    }

    pub fn transpose(&mut self, x: ExprId) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Transpose, &[x])
    }

    pub fn mtimes(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Mtimes, &[a, b])
    }

    pub fn dot(&mut self, a: ExprId, b: ExprId) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Dot, &[a, b])
    }

    /// `xᵀ A y` with `x` an `m x 1` and `y` an `n x 1` column.
    pub fn bilin(&mut self, a: ExprId, x: ExprId, y: ExprId) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Bilin, &[a, x, y])
    }

    /// Restrict `x` onto `target` (entries outside are dropped, entries
    /// missing from `x` become zero).
    pub fn project(&mut self, x: ExprId, target: SparsityPattern) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Project { target }, &[x])
    }

    /// Tile `x` horizontally `n` times.
    pub fn horzrepmat(&mut self, x: ExprId, n: usize) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::HorzRepmat { n }, &[x])
    }

    /// Sum the `n` equal-width horizontal blocks of `x`.
    pub fn horzrepsum(&mut self, x: ExprId, n: usize) -> Result<ExprId, CoreError> {
        self.horzrepsum_with(x, n, Reduction::Sum)
    }

    pub fn horzrepsum_with(&mut self, x: ExprId, n: usize, reduction: Reduction) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::HorzRepsum { n, reduction }, &[x])
    }

    /// `A + alpha * x * yᵀ`.
    pub fn rank1(&mut self, a: ExprId, alpha: ExprId, x: ExprId, y: ExprId) -> Result<ExprId, CoreError> {
        self.insert(ExprOp::Rank1, &[a, alpha, x, y])
    }

    /// Rebuild a node of the given variant over new operands.
    pub fn apply(&mut self, op: &ExprOp, operands: &[ExprId]) -> Result<ExprId, CoreError> {
        match op {
            ExprOp::Input { .. } => Err(CoreError::UnsupportedProtocol {
                op: op.name(),
                protocol: "reconstruction",
            }),
            _ => self.insert(op.clone(), operands),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn node(&self, id: ExprId) -> Result<&ExprNode, CoreError> {
        self.graph
            .node_weight(id.0)
            .ok_or(CoreError::UnknownNode { id: id.index() })
    }

    pub fn sparsity(&self, id: ExprId) -> Result<&SparsityPattern, CoreError> {
        Ok(self.node(id)?.sparsity())
    }

    /// The input position of an `Input` node, `None` for anything else.
    pub fn input_index(&self, id: ExprId) -> Result<Option<usize>, CoreError> {
        Ok(match self.node(id)?.op {
            ExprOp::Input { index, .. } => Some(index),
            _ => None,
        })
    }

    /// Operands of a node, in operand order.
    pub fn operands(&self, id: ExprId) -> Result<Vec<ExprId>, CoreError> {
        let node = self.node(id)?;
        let mut slots = vec![None; node.num_inputs()];
        for edge in self.graph.edges_directed(id.0, Direction::Incoming) {
            slots[edge.weight().to_port] = Some(ExprId(edge.source()));
        }
        slots
            .into_iter()
            .map(|s| s.ok_or(CoreError::UnknownNode { id: id.index() }))
            .collect()
    }

    /// Nodes that use `id` as an operand, in arena order, without duplicates.
    pub fn consumers(&self, id: ExprId) -> Result<Vec<ExprId>, CoreError> {
        self.check(id)?;
        let mut out: Vec<ExprId> = self
            .graph
            .edges_directed(id.0, Direction::Outgoing)
            .map(|e| ExprId(e.target()))
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// All nodes `outputs` depend on (including themselves), in topological
    /// order.
    pub fn reachable(&self, outputs: &[ExprId]) -> Result<Vec<ExprId>, CoreError> {
        let mut seen = vec![false; self.graph.node_count()];
        let mut stack = Vec::new();
        for &id in outputs {
            self.check(id)?;
            stack.push(id);
        }
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            for edge in self.graph.edges_directed(id.0, Direction::Incoming) {
                stack.push(ExprId(edge.source()));
            }
        }
        Ok(seen
            .iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(i, _)| ExprId(NodeIndex::new(i)))
            .collect())
    }

    /// Full textual form of the expression rooted at `id`.
    ///
    /// Shared subexpressions are printed at every use.
    pub fn describe(&self, id: ExprId) -> Result<String, CoreError> {
        let mut text: HashMap<ExprId, String> = HashMap::new();
        for node_id in self.reachable(&[id])? {
            let args = self
                .operands(node_id)?
                .iter()
                .map(|op| text.get(op).cloned().unwrap_or_default())
                .collect::<Vec<_>>();
            text.insert(node_id, self.graph[node_id.0].describe(&args));
        }
        text.remove(&id).ok_or(CoreError::UnknownNode { id: id.index() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_consing_returns_same_handle() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(1, 2));
        let a = g.horzrepmat(x, 3).unwrap();
        let b = g.horzrepmat(x, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(g.len(), 2);

        let c = g.horzrepmat(x, 2).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_apply_rebuilds_nodes() {
        let mut g = ExprGraph::new();
        let alpha = g.input("alpha", SparsityPattern::scalar());
        let x = g.input("x", SparsityPattern::dense_column(2));
        let y = g.input("y", SparsityPattern::dense_column(3));
        let ax = g.times(alpha, x).unwrap();
        let yt = g.transpose(y).unwrap();
        let outer = g.mtimes(ax, yt).unwrap();
        let n = g.len();

        for id in [ax, yt, outer] {
            let op = g.node(id).unwrap().op.clone();
            let operands = g.operands(id).unwrap();
            assert_eq!(g.apply(&op, &operands).unwrap(), id);
        }
        assert_eq!(g.len(), n);

        let op = g.node(ax).unwrap().op.clone();
        let ay = g.apply(&op, &[alpha, y]).unwrap();
        assert_ne!(ay, ax);
        assert_eq!(g.sparsity(ay).unwrap(), &SparsityPattern::dense_column(3));
        assert!(g.apply(&op, &[x, alpha]).is_err());

        let input = g.node(x).unwrap().op.clone();
        let err = g.apply(&input, &[]).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedProtocol { .. }));
    }

    #[test]
    fn test_hash_consing_disabled() {
        let mut g = ExprGraph::with_config(GraphConfig {
            hash_consing: false,
            ..GraphConfig::default()
        });
        let x = g.input("x", SparsityPattern::scalar());
        let a = g.transpose(x).unwrap();
        let b = g.transpose(x).unwrap();
        assert_ne!(a, b);
        assert_eq!(g.sparsity(a).unwrap(), g.sparsity(b).unwrap());
    }

    #[test]
    fn test_inputs_are_distinct() {
        let mut g = ExprGraph::new();
        let a = g.input("x", SparsityPattern::scalar());
        let b = g.input("x", SparsityPattern::scalar());
        assert_ne!(a, b);
        assert_eq!(g.input_index(b).unwrap(), Some(1));
    }

    #[test]
    fn test_failed_construction_adds_nothing() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(1, 5));
        let err = g.horzrepsum(x, 2).unwrap_err();
        assert_eq!(err, CoreError::IndivisibleColumns { ncol: 5, n: 2 });
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_unknown_node() {
        let mut g = ExprGraph::new();
        let mut other = ExprGraph::new();
        other.input("a", SparsityPattern::scalar());
        let foreign = other.input("b", SparsityPattern::scalar());
        assert_eq!(
            g.transpose(foreign).unwrap_err(),
            CoreError::UnknownNode { id: 1 }
        );
    }

    #[test]
    fn test_operands_and_consumers() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense_column(2));
        let a = g.input("a", SparsityPattern::dense(2, 2));
        let alpha = g.scalar(2.0).unwrap();
        let r = g.rank1(a, alpha, x, x).unwrap();
        assert_eq!(g.operands(r).unwrap(), vec![a, alpha, x, x]);
        assert_eq!(g.consumers(x).unwrap(), vec![r]);
        assert_eq!(g.describe(r).unwrap(), "rank1(a, 2, x, x)");
    }

    #[test]
    fn test_reachable_is_topological() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(1, 2));
        let unused = g.input("u", SparsityPattern::scalar());
        let r = g.horzrepmat(x, 2).unwrap();
        let s = g.horzrepsum(r, 2).unwrap();
        let order = g.reachable(&[s]).unwrap();
        assert_eq!(order, vec![x, r, s]);
        assert!(!order.contains(&unused));
        assert_eq!(g.describe(s).unwrap(), "repsum(repmat(x, 2), 2)");
    }

    #[test]
    fn test_interned_outputs_share_storage() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(3, 3));
        let y = g.input("y", SparsityPattern::dense(3, 3));
        let a = g.transpose(x).unwrap();
        let b = g.transpose(y).unwrap();
        assert!(g.sparsity(a).unwrap().ptr_eq(g.sparsity(b).unwrap()));
    }
}
