//! # Forward Mode (JVP)
//!
//! Forward sensitivities are built as new graph nodes: for every node the
//! tangent of its output is an expression in its operands and their
//! tangents. Seeds are indexed `[direction][slot]`; `None` is a structurally
//! zero tangent and never materializes a node.
//!
//! ## Rules
//!
//! | Op | Tangent |
//! |----|---------|
//! | Add | da + db |
//! | Times(α, X) | dα·X + α·dX |
//! | Mtimes(A, B) | dA·B + A·dB |
//! | Dot(A, B) | ⟨dA, B⟩ + ⟨A, dB⟩ |
//! | Bilin(A, x, y) | bilin(dA, x, y) + bilin(A, dx, y) + bilin(A, x, dy) |
//! | Repmat(x, n) | repmat(dx, n) |
//! | Repsum(x, n) | repsum(dx, n), sum reduction only |
//! | Rank1(A, α, x, y) | rank1 chain seeded with dA (or zeros) |
//!
//! ## Example
//!
//! ```rust
//! use exprgraph_core::{ExprGraph, Function, SparsityPattern};
//! use exprgraph_diff::forward::forward_mode;
//!
//! let mut g = ExprGraph::new();
//! let x = g.input("x", SparsityPattern::dense(1, 2));
//! let y = g.horzrepmat(x, 3).unwrap();
//! let dx = g.input("dx", SparsityPattern::dense(1, 2));
//!
//! let fsens = forward_mode(&mut g, &[x], &[y], &[vec![Some(dx)]]).unwrap();
//! assert_eq!(g.describe(fsens[0][0]).unwrap(), "repmat(dx, 3)");
//! ```

use std::collections::HashMap;

use exprgraph_core::{CoreError, ExprGraph, ExprId, ExprOp, Reduction};
use log::debug;

use crate::error::DiffError;
use crate::{accumulate, check_seeds, fit_to, Seeds};

/// Forward rule for one node.
///
/// `fseed[d][i]` is the tangent of operand `i` in direction `d`. Returns
/// `fsens[d][0]`, the tangent of the node's output.
pub fn jvp(graph: &mut ExprGraph, node: ExprId, fseed: &[Vec<Option<ExprId>>]) -> Result<Seeds, DiffError> {
    let op = graph.node(node)?.op.clone();
    let args = graph.operands(node)?;
    check_seeds(fseed, args.len())?;

    let mut fsens = Vec::with_capacity(fseed.len());
    for seed in fseed {
        let t = match &op {
            ExprOp::Input { .. } | ExprOp::Constant { .. } => None,
            ExprOp::Add => accumulate(graph, seed[0], seed[1])?,
            ExprOp::Times => {
                let a = match seed[0] {
                    Some(da) => Some(graph.times(da, args[1])?),
                    None => None,
                };
                let b = match seed[1] {
                    Some(dx) => Some(graph.times(args[0], dx)?),
                    None => None,
                };
                accumulate(graph, a, b)?
            }
            ExprOp::Transpose => match seed[0] {
                Some(dx) => Some(graph.transpose(dx)?),
                None => None,
            },
            ExprOp::Mtimes => {
                let a = match seed[0] {
                    Some(da) => Some(graph.mtimes(da, args[1])?),
                    None => None,
                };
                let b = match seed[1] {
                    Some(db) => Some(graph.mtimes(args[0], db)?),
                    None => None,
                };
                accumulate(graph, a, b)?
            }
            ExprOp::Dot => {
                let a = match seed[0] {
                    Some(da) => Some(graph.dot(da, args[1])?),
                    None => None,
                };
                let b = match seed[1] {
                    Some(db) => Some(graph.dot(args[0], db)?),
                    None => None,
                };
                accumulate(graph, a, b)?
            }
            ExprOp::Bilin => {
                let mut t = None;
                for k in 0..3 {
                    if let Some(d) = seed[k] {
                        let mut ops = [args[0], args[1], args[2]];
                        ops[k] = d;
                        let term = graph.bilin(ops[0], ops[1], ops[2])?;
                        t = accumulate(graph, t, Some(term))?;
                    }
                }
                t
            }
            ExprOp::Project { target } => match seed[0] {
                Some(dx) => Some(graph.project(dx, target.clone())?),
                None => None,
            },
            ExprOp::HorzRepmat { n } => match seed[0] {
                Some(dx) => Some(graph.horzrepmat(dx, *n)?),
                None => None,
            },
            ExprOp::HorzRepsum { n, reduction } => {
                if *reduction != Reduction::Sum {
                    return Err(CoreError::UnsupportedProtocol {
                        op: op.name(),
                        protocol: "forward derivative of a non-sum reduction",
                    }
                    .into());
                }
                match seed[0] {
                    Some(dx) => Some(graph.horzrepsum(dx, *n)?),
                    None => None,
                }
            }
            ExprOp::Rank1 => {
                if seed.iter().all(Option::is_none) {
                    None
                } else {
                    let mut r = match seed[0] {
                        Some(da) => da,
                        None => {
                            let a = graph.sparsity(args[0])?;
                            let (m, n) = (a.nrow(), a.ncol());
                            graph.zeros(m, n)?
                        }
                    };
                    if let Some(dalpha) = seed[1] {
                        r = graph.rank1(r, dalpha, args[2], args[3])?;
                    }
                    if let Some(dx) = seed[2] {
                        r = graph.rank1(r, args[1], dx, args[3])?;
                    }
                    if let Some(dy) = seed[3] {
                        r = graph.rank1(r, args[1], args[2], dy)?;
                    }
                    Some(r)
                }
            }
        };
        fsens.push(vec![t]);
    }
    Ok(fsens)
}

/// Forward sweep over everything `outputs` depend on.
///
/// `fseed[d][i]` seeds input `i` in direction `d`; seeds are projected onto
/// that input's sparsity first. Returns `fsens[d][o]`,
/// the tangent of output `o`; outputs the seeds do not reach get a
/// structurally zero constant.
pub fn forward_mode(
    graph: &mut ExprGraph,
    inputs: &[ExprId],
    outputs: &[ExprId],
    fseed: &[Vec<Option<ExprId>>],
) -> Result<Vec<Vec<ExprId>>, DiffError> {
    check_seeds(fseed, inputs.len())?;
    let ndir = fseed.len();
    for dir in fseed {
        for (&x, dx) in inputs.iter().zip(dir) {
            if let Some(dx) = dx {
                let (want, got) = (graph.sparsity(x)?, graph.sparsity(*dx)?);
                if !want.same_dims(got) {
                    return Err(CoreError::DimensionMismatch {
                        op: "forward seed",
                        expected: want.dims(),
                        got: got.dims(),
                    }
                    .into());
                }
            }
        }
    }

    let order = graph.reachable(outputs)?;
    debug!(
        "forward sweep: {} nodes, {} inputs, {ndir} directions",
        order.len(),
        inputs.len()
    );

    let mut tangent: HashMap<ExprId, Vec<Option<ExprId>>> = HashMap::new();
    for (i, &x) in inputs.iter().enumerate() {
        let seeds: Vec<Option<ExprId>> = fseed.iter().map(|dir| dir[i]).collect();
        let entry = tangent.entry(x).or_insert_with(|| vec![None; ndir]);
        for (d, s) in seeds.into_iter().enumerate() {
            let s = match s {
                Some(dx) => Some(fit_to(graph, dx, x)?),
                None => None,
            };
            entry[d] = accumulate(graph, entry[d], s)?;
        }
    }

    for &id in &order {
        if graph.input_index(id)?.is_some() {
            continue;
        }
        let operands = graph.operands(id)?;
        let seed: Seeds = (0..ndir)
            .map(|d| {
                operands
                    .iter()
                    .map(|op| tangent.get(op).and_then(|t| t[d]))
                    .collect()
            })
            .collect();
        if seed.iter().flatten().all(Option::is_none) {
            continue;
        }
        let fsens = jvp(graph, id, &seed)?;
        tangent.insert(id, fsens.into_iter().map(|s| s[0]).collect());
    }

    let mut result = Vec::with_capacity(ndir);
    for d in 0..ndir {
        let mut row = Vec::with_capacity(outputs.len());
        for &o in outputs {
            let t = match tangent.get(&o).and_then(|t| t[d]) {
                Some(t) => t,
                None => {
                    let sp = graph.sparsity(o)?;
                    let (m, n) = (sp.nrow(), sp.ncol());
                    graph.zeros(m, n)?
                }
            };
            row.push(t);
        }
        result.push(row);
    }
    Ok(result)
}

/// Single-direction tangent of `outputs` along `direction` (one expression
/// per input).
pub fn jacobian_vector(
    graph: &mut ExprGraph,
    inputs: &[ExprId],
    outputs: &[ExprId],
    direction: &[ExprId],
) -> Result<Vec<ExprId>, DiffError> {
    let seed = vec![direction.iter().copied().map(Some).collect()];
    let mut fsens = forward_mode(graph, inputs, outputs, &seed)?;
    Ok(fsens.pop().unwrap_or_default())
}
