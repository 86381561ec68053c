//! # Diff - Automatic Differentiation over Expression Graphs
//!
//! This crate builds derivatives of an [`ExprGraph`] *as more graph*: the
//! forward and reverse sensitivities of a node are new nodes in the same
//! arena, so derivatives can be evaluated, differentiated again, sparsity
//! analyzed or compiled to C exactly like the original expression.
//!
//! ## Modules
//!
//! - [`forward`] - Per-variant tangent rules and the forward sweep
//! - [`backward`] - Per-variant adjoint rules and the reverse sweep
//! - [`check`] - Finite-difference and forward/reverse consistency checks
//!
//! ## Seeds
//!
//! Seeds and sensitivities are indexed `[direction][slot]`. A `None` entry
//! is a structurally zero seed: rules skip it instead of building zero
//! nodes.
//!
//! ## Example
//!
//! ```rust
//! use exprgraph_core::{ExprGraph, Function, SparsityPattern};
//! use exprgraph_diff::gradient;
//!
//! // f(x) = dot(repmat(x, 2), repmat(x, 2)) = 2 * |x|^2
//! let mut g = ExprGraph::new();
//! let x = g.input("x", SparsityPattern::dense(1, 2));
//! let r = g.horzrepmat(x, 2).unwrap();
//! let f = g.dot(r, r).unwrap();
//!
//! let grad = gradient(&mut g, &[x], f).unwrap();
//! let df = Function::new(&g, "df", &[x], &grad).unwrap();
//! let out = df.call(&[vec![1.0, 3.0]]).unwrap();
//! assert_eq!(out[0], vec![4.0, 12.0]);
//! ```

pub mod backward;
pub mod check;
pub mod error;
pub mod forward;

use exprgraph_core::{CoreError, ExprGraph, ExprId};

// Re-export key types
pub use backward::{gradient, reverse_mode, vjp};
pub use check::{dot_product_test, finite_difference_jvp, grad_check, jvp_function, vjp_function};
pub use error::{DiffError, GradCheckError};
pub use forward::{forward_mode, jacobian_vector, jvp};

/// Seeds or sensitivities, indexed `[direction][slot]`.
pub type Seeds = Vec<Vec<Option<ExprId>>>;

/// Sum two optional terms, building a node only when both are present.
pub(crate) fn accumulate(
    graph: &mut ExprGraph,
    acc: Option<ExprId>,
    term: Option<ExprId>,
) -> Result<Option<ExprId>, DiffError> {
    Ok(match (acc, term) {
        (Some(a), Some(b)) => Some(graph.add(a, b)?),
        (a, None) => a,
        (None, b) => b,
    })
}

/// Project `sens` onto the sparsity of `target` unless it already fits.
pub(crate) fn fit_to(graph: &mut ExprGraph, sens: ExprId, target: ExprId) -> Result<ExprId, CoreError> {
    let want = graph.sparsity(target)?.clone();
    if graph.sparsity(sens)?.is_subset(&want) {
        return Ok(sens);
    }
    graph.project(sens, want)
}

/// Every direction must carry one entry per slot.
pub(crate) fn check_seeds(seeds: &[Vec<Option<ExprId>>], expected: usize) -> Result<(), DiffError> {
    for (direction, dir) in seeds.iter().enumerate() {
        if dir.len() != expected {
            return Err(DiffError::SeedArity {
                direction,
                expected,
                got: dir.len(),
            });
        }
    }
    Ok(())
}
