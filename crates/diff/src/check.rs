//! # Derivative Checking
//!
//! Utilities for validating derivative rules numerically:
//!
//! - [`finite_difference_jvp`]: central differences along a direction
//! - [`grad_check`]: compiled forward derivative against finite differences
//! - [`dot_product_test`]: `⟨w, J v⟩ = ⟨Jᵀ w, v⟩` between the forward and
//!   reverse derivatives
//!
//! The derivative functions under test are compiled with [`jvp_function`]
//! and [`vjp_function`], which append one seed input per input (or output)
//! to the original inputs.

use exprgraph_core::{CoreError, ExprGraph, ExprId, ExprOp, Function};

use crate::backward::reverse_mode;
use crate::error::{DiffError, GradCheckError};
use crate::forward::forward_mode;

fn seed_input(graph: &mut ExprGraph, of: ExprId, prefix: &str, index: usize) -> Result<ExprId, CoreError> {
    let node = graph.node(of)?;
    let label = match &node.op {
        ExprOp::Input { name, .. } => format!("{prefix}{name}"),
        _ => format!("{prefix}{index}"),
    };
    let sp = node.sparsity().clone();
    Ok(graph.input(label, sp))
}

/// Compile the forward derivative of `outputs`.
///
/// The function takes `[inputs.., seeds..]` (one seed per input, same
/// sparsity) and returns one tangent per output.
pub fn jvp_function(
    graph: &mut ExprGraph,
    name: &str,
    inputs: &[ExprId],
    outputs: &[ExprId],
) -> Result<Function, DiffError> {
    let mut seeds = Vec::with_capacity(inputs.len());
    for (i, &x) in inputs.iter().enumerate() {
        seeds.push(seed_input(graph, x, "d", i)?);
    }
    let fsens = forward_mode(graph, inputs, outputs, &[seeds.iter().copied().map(Some).collect()])?;
    let all: Vec<ExprId> = inputs.iter().chain(&seeds).copied().collect();
    Ok(Function::new(graph, name, &all, &fsens[0])?)
}

/// Compile the reverse derivative of `outputs`.
///
/// The function takes `[inputs.., seeds..]` (one seed per output, same
/// sparsity) and returns one adjoint per input.
pub fn vjp_function(
    graph: &mut ExprGraph,
    name: &str,
    inputs: &[ExprId],
    outputs: &[ExprId],
) -> Result<Function, DiffError> {
    let mut seeds = Vec::with_capacity(outputs.len());
    for (o, &y) in outputs.iter().enumerate() {
        seeds.push(seed_input(graph, y, "adj_", o)?);
    }
    let asens = reverse_mode(graph, inputs, outputs, &[seeds.iter().copied().map(Some).collect()])?;
    let all: Vec<ExprId> = inputs.iter().chain(&seeds).copied().collect();
    Ok(Function::new(graph, name, &all, &asens[0])?)
}

/// Central-difference directional derivative of `f` at `x` along `v`.
///
/// Uses `(f(x + h v) - f(x - h v)) / 2h`, one vector per output.
pub fn finite_difference_jvp(
    f: &Function,
    x: &[Vec<f64>],
    v: &[Vec<f64>],
    h: f64,
) -> Result<Vec<Vec<f64>>, CoreError> {
    let step = |sign: f64| -> Vec<Vec<f64>> {
        x.iter()
            .zip(v)
            .map(|(xi, vi)| xi.iter().zip(vi).map(|(a, b)| a + sign * h * b).collect())
            .collect()
    };
    let plus = f.call(&step(1.0))?;
    let minus = f.call(&step(-1.0))?;
    Ok(plus
        .iter()
        .zip(&minus)
        .map(|(p, m)| p.iter().zip(m).map(|(a, b)| (a - b) / (2.0 * h)).collect())
        .collect())
}

fn close(analytical: f64, reference: f64, tolerance: f64) -> bool {
    let diff = (analytical - reference).abs();
    let scale = analytical.abs().max(reference.abs()).max(1.0);
    diff / scale <= tolerance
}

fn dense_dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Check a compiled forward derivative against finite differences of `f`.
///
/// `jvp` must be laid out as [`jvp_function`] builds it. Outputs are
/// compared densely, so tangents with a smaller pattern than the output
/// still line up.
pub fn grad_check(
    f: &Function,
    jvp: &Function,
    x: &[Vec<f64>],
    v: &[Vec<f64>],
    h: f64,
    tolerance: f64,
) -> Result<(), DiffError> {
    let reference = finite_difference_jvp(f, x, v, h)?;
    let args: Vec<Vec<f64>> = x.iter().chain(v).cloned().collect();
    let analytical = jvp.call(&args)?;

    for (index, (got, want)) in analytical.iter().zip(&reference).enumerate() {
        let got = jvp.sparsity_out(index).dense_values(got);
        let want = f.sparsity_out(index).dense_values(want);
        for (elem, (&a, &r)) in got.iter().zip(&want).enumerate() {
            if !close(a, r, tolerance) {
                return Err(GradCheckError {
                    what: "jvp",
                    index,
                    elem,
                    analytical: a,
                    reference: r,
                    diff: (a - r).abs(),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Forward/reverse consistency: `⟨w, J v⟩` must equal `⟨Jᵀ w, v⟩`.
///
/// `jvp` and `vjp` must be laid out as [`jvp_function`] and
/// [`vjp_function`] build them for the same inputs and outputs.
pub fn dot_product_test(
    jvp: &Function,
    vjp: &Function,
    x: &[Vec<f64>],
    v: &[Vec<f64>],
    w: &[Vec<f64>],
    tolerance: f64,
) -> Result<(), DiffError> {
    let n_x = x.len();
    let jv = jvp.call(&x.iter().chain(v).cloned().collect::<Vec<_>>())?;
    let jtw = vjp.call(&x.iter().chain(w).cloned().collect::<Vec<_>>())?;

    let mut forward = 0.0;
    for (o, (jv_o, w_o)) in jv.iter().zip(w).enumerate() {
        let a = jvp.sparsity_out(o).dense_values(jv_o);
        let b = vjp.sparsity_in(n_x + o).dense_values(w_o);
        forward += dense_dot(&a, &b);
    }
    let mut reverse = 0.0;
    for (i, (jtw_i, v_i)) in jtw.iter().zip(v).enumerate() {
        let a = vjp.sparsity_out(i).dense_values(jtw_i);
        let b = jvp.sparsity_in(n_x + i).dense_values(v_i);
        reverse += dense_dot(&a, &b);
    }

    if !close(forward, reverse, tolerance) {
        return Err(GradCheckError {
            what: "dot product",
            index: 0,
            elem: 0,
            analytical: forward,
            reference: reverse,
            diff: (forward - reverse).abs(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use exprgraph_core::SparsityPattern;

    #[test]
    fn test_finite_difference_of_linear_map() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(1, 2));
        let r = g.horzrepmat(x, 2).unwrap();
        let f = Function::new(&g, "f", &[x], &[r]).unwrap();

        let fd = finite_difference_jvp(&f, &[vec![1.0, 2.0]], &[vec![0.5, -1.0]], 1e-3).unwrap();
        for (got, want) in fd[0].iter().zip([0.5, -1.0, 0.5, -1.0]) {
            approx::assert_relative_eq!(*got, want, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_grad_check_reports_mismatch() {
        // Compare f against the jvp of a different function.
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(1, 2));
        let r = g.horzrepmat(x, 2).unwrap();
        let doubled = g.add(x, x).unwrap();
        let f = Function::new(&g, "f", &[x], &[doubled]).unwrap();
        let r_sum = g.horzrepsum(r, 2).unwrap();
        let jvp = jvp_function(&mut g, "jvp", &[x], &[r_sum]).unwrap();
        assert!(grad_check(&f, &jvp, &[vec![1.0, 2.0]], &[vec![1.0, 0.0]], 1e-6, 1e-6).is_ok());

        let wrong = jvp_function(&mut g, "wrong", &[x], &[x]).unwrap();
        let err = grad_check(&f, &wrong, &[vec![1.0, 2.0]], &[vec![1.0, 0.0]], 1e-6, 1e-6).unwrap_err();
        match err {
            DiffError::Mismatch(e) => {
                assert_eq!((e.what, e.index, e.elem), ("jvp", 0, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
