//! Derivatives of a Rank-1 Update
//!
//! Run with: cargo run -p exprgraph-diff --example rank1_derivatives
//!
//! This example demonstrates:
//! - Forward sensitivities built as graph nodes
//! - Reverse sensitivities, projected onto the input sparsity
//! - Checking both against finite differences and against each other
//!
//! The update is A + alpha * x * yᵀ with a diagonal A, so the adjoint of A
//! keeps only the diagonal even though the result is dense.

use exprgraph_core::{ExprGraph, Function, SparsityPattern};
use exprgraph_diff::{dot_product_test, grad_check, jvp_function, reverse_mode, vjp_function, DiffError};

fn main() -> Result<(), DiffError> {
    println!("=== Rank-1 Derivatives ===\n");

    let mut g = ExprGraph::new();
    let a = g.input("A", SparsityPattern::diagonal(2));
    let alpha = g.input("alpha", SparsityPattern::scalar());
    let x = g.input("x", SparsityPattern::dense_column(2));
    let y = g.input("y", SparsityPattern::dense_column(2));
    let r = g.rank1(a, alpha, x, y)?;
    let inputs = [a, alpha, x, y];
    println!("r = {}", g.describe(r)?);
    println!("sparsity of r: {}\n", g.sparsity(r)?);

    // -------------------------------------------------------------------------
    // 1. Reverse mode: one adjoint expression per input
    // -------------------------------------------------------------------------
    let seed = g.input("S", SparsityPattern::dense(2, 2));
    let asens = reverse_mode(&mut g, &inputs, &[r], &[vec![Some(seed)]])?;
    for (input, adj) in inputs.iter().zip(&asens[0]) {
        println!("adj({}) = {}", g.describe(*input)?, g.describe(*adj)?);
    }
    println!();

    // -------------------------------------------------------------------------
    // 2. Numerical checks
    // -------------------------------------------------------------------------
    let f = Function::new(&g, "f", &inputs, &[r])?;
    let jvp = jvp_function(&mut g, "jvp", &inputs, &[r])?;
    let vjp = vjp_function(&mut g, "vjp", &inputs, &[r])?;

    let point = vec![vec![1.0, 2.0], vec![0.5], vec![1.0, -1.0], vec![2.0, 3.0]];
    let direction = vec![vec![0.1, 0.0], vec![1.0], vec![0.0, 1.0], vec![-1.0, 0.5]];
    let adjoint = vec![vec![1.0, 2.0, 3.0, 4.0]];

    grad_check(&f, &jvp, &point, &direction, 1e-6, 1e-6)?;
    println!("forward derivative matches finite differences");
    dot_product_test(&jvp, &vjp, &point, &direction, &adjoint, 1e-12)?;
    println!("forward and reverse derivatives are consistent");
    Ok(())
}
