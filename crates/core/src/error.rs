//! # Error Types
//!
//! Errors in the expression graph are raised when a node is *built*, never
//! when it is evaluated. A node with incompatible operands is not a runtime
//! failure waiting to happen: it is an expression that does not exist.
//!
//! Evaluation is a total function of well-shaped buffers. The only errors
//! reachable after construction are calling-convention misuse at the
//! [`Function`](crate::function::Function) boundary and requests for a
//! protocol a variant does not implement.

use thiserror::Error;

/// Core errors for the expression graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Replication count must be at least one.
    #[error("Invalid replication count {n} (must be >= 1)")]
    InvalidReplication { n: usize },

    /// Operand dimensions do not fit the operation.
    #[error("Dimension mismatch in {op}: expected {expected}, got {got}")]
    DimensionMismatch {
        op: &'static str,
        expected: String,
        got: String,
    },

    /// An operand that must be 1x1 is not.
    #[error("{op} requires a scalar operand, got {got}")]
    NotScalar { op: &'static str, got: String },

    /// Column count cannot be split into equal-width blocks.
    #[error("Cannot split {ncol} columns into {n} equal blocks")]
    IndivisibleColumns { ncol: usize, n: usize },

    /// Malformed compressed-column description.
    #[error("Invalid sparsity pattern: {reason}")]
    InvalidSparsity { reason: String },

    /// Wrong number of operands for a variant.
    #[error("{op} expects {expected} operands, got {got}")]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// The variant has no rule for the requested protocol.
    #[error("{op} does not support {protocol}")]
    UnsupportedProtocol {
        op: &'static str,
        protocol: &'static str,
    },

    /// A handle that does not refer to a node of this graph.
    #[error("Unknown expression node {id}")]
    UnknownNode { id: usize },

    /// A function input that is not a free `Input` node.
    #[error("Function input {index} is not a symbolic input node")]
    NotAnInput { index: usize },

    /// An output depends on an input node not listed as a function input.
    #[error("Output depends on free input '{name}' not listed as a function input")]
    FreeInput { name: String },

    /// An input or output index beyond the function's arity.
    #[error("{what} index {index} out of range (have {len})")]
    InvalidIndex {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// Buffer count or length does not match the calling convention.
    #[error("Buffer size mismatch for {what}[{index}]: expected {expected}, got {got}")]
    BufferSize {
        what: &'static str,
        index: usize,
        expected: usize,
        got: usize,
    },
}

impl CoreError {
    /// True for errors of the configuration family (invalid construction
    /// parameters), as opposed to protocol or calling-convention errors.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidReplication { .. }
                | CoreError::DimensionMismatch { .. }
                | CoreError::NotScalar { .. }
                | CoreError::IndivisibleColumns { .. }
                | CoreError::InvalidSparsity { .. }
                | CoreError::Arity { .. }
        )
    }
}
