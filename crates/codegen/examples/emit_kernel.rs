//! Emitting a C Kernel
//!
//! Run with: cargo run -p exprgraph-codegen --example emit_kernel
//!
//! Compiles a block-sum followed by a rank-1 update and prints the C99
//! translation unit, including the gradient kernel of a scalar objective.

use exprgraph_codegen::CodeGenerator;
use exprgraph_core::{ExprGraph, Function, SparsityPattern};
use exprgraph_diff::gradient;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut g = ExprGraph::new();
    let x = g.input("x", SparsityPattern::dense(2, 4));
    let alpha = g.input("alpha", SparsityPattern::scalar());
    let v = g.input("v", SparsityPattern::dense_column(2));
    let s = g.horzrepsum(x, 2)?;
    let r = g.rank1(s, alpha, v, v)?;
    let phi = g.bilin(r, v, v)?;
    let grad = gradient(&mut g, &[x, alpha, v], phi)?;

    let f = Function::new(&g, "update", &[x, alpha, v], &[r])?;
    let df = Function::new(&g, "objective_grad", &[x, alpha, v], &grad)?;

    let mut cg = CodeGenerator::default();
    cg.add(&f)?;
    cg.add(&df)?;
    println!("{}", cg.generate());
    Ok(())
}
