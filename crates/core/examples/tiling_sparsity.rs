//! Tiling, Block Sums and Jacobian Sparsity
//!
//! Run with: cargo run -p exprgraph-core --example tiling_sparsity
//!
//! This example demonstrates:
//! - Building an expression graph with replication and block summation
//! - Compiling it into a Function and evaluating with caller-owned buffers
//! - Symbolic evaluation of the same instruction list
//! - Jacobian sparsity detection with bit-vector sweeps

use exprgraph_core::{CoreError, ExprGraph, Function, SparsityPattern};

fn main() -> Result<(), CoreError> {
    println!("=== Tiling and Sparsity ===\n");

    // -------------------------------------------------------------------------
    // 1. Build: y = repsum(repmat(x, 3) + B, 3) for a 2x2 x
    // -------------------------------------------------------------------------
    let mut g = ExprGraph::new();
    let x = g.input("x", SparsityPattern::dense(2, 2));
    let b = g.input("B", SparsityPattern::diagonal(2).horzrep(3));
    let tiled = g.horzrepmat(x, 3)?;
    let shifted = g.add(tiled, b)?;
    let y = g.horzrepsum(shifted, 3)?;
    println!("y = {}", g.describe(y)?);
    println!("sparsity of y: {}\n", g.sparsity(y)?);

    // -------------------------------------------------------------------------
    // 2. Compile and evaluate
    // -------------------------------------------------------------------------
    let f = Function::new(&g, "f", &[x, b], &[y])?;
    println!("{} instructions, sz_w = {}", f.instructions().len(), f.sz_w());

    let x_val = [1.0, 2.0, 3.0, 4.0];
    let b_val = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0];
    let mut out = vec![0.0; f.nnz_out(0)];
    let mut w = vec![0.0; f.sz_w()];
    f.eval(&[&x_val[..], &b_val[..]], &mut [out.as_mut_slice()], &mut w)?;
    println!("f(x, B) nonzeros = {out:?}\n");

    // -------------------------------------------------------------------------
    // 3. Symbolic evaluation
    // -------------------------------------------------------------------------
    let sym = f.call_sx(&f.sx_inputs())?;
    for (k, e) in sym[0].iter().enumerate() {
        println!("y[{k}] = {e}");
    }
    println!();

    // -------------------------------------------------------------------------
    // 4. Jacobian sparsity with respect to x
    // -------------------------------------------------------------------------
    let forward = f.jac_sparsity(0, 0)?;
    let reverse = f.jac_sparsity_reverse(0, 0)?;
    println!("d y / d x: {forward}");
    println!("forward and reverse agree: {}", forward == reverse);
    Ok(())
}
