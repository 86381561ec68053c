//! # Core - Sparse Expression Graphs
//!
//! This crate provides the expression DAG every other layer builds on:
//!
//! - **Sparsity**: compressed-column patterns and their structural algebra
//! - **Elements**: numeric (`f64`) and symbolic ([`SxElem`]) buffer elements
//! - **Operations**: the closed node catalog with evaluation and dependency
//!   propagation rules
//! - **Graph**: the arena DAG with hash-consed construction
//! - **Functions**: compiled evaluation over caller-owned buffers
//! - **Propagation**: bit-vector sweeps and Jacobian sparsity detection
//!
//! ## Design Philosophy
//!
//! Every node is validated when it is built. Once a node exists, all of its
//! protocols (numeric, symbolic, dependency bits) are total over buffers of
//! the right size, and they agree: a structurally zero element is zero in
//! every protocol.

pub mod element;
pub mod error;
pub mod function;
pub mod graph;
pub mod ops;
pub mod propagate;
pub mod sparsity;

// Re-export key types at crate root for convenience
pub use element::{Scalar, SxElem, SxNode};
pub use error::CoreError;
pub use function::{Function, Instruction, Src};
pub use graph::{ExprGraph, ExprId, GraphConfig};
pub use ops::{ConstValues, ExprNode, ExprOp, Reduction};
pub use propagate::{Bvec, BVEC_BITS};
pub use sparsity::{CompressedSparsity, SparsityPattern};
