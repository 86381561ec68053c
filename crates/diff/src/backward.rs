//! # Reverse Mode (VJP)
//!
//! The adjoint sweep visits nodes in reverse topological order. Each node
//! hands the adjoint of its output to its operands through a transposed rule,
//! and operands with several consumers accumulate by addition.
//!
//! - Forward: morphisms go A → B
//! - Reverse: adjoints go B → A
//! - For a composition f;g the adjoint is vjp(g);vjp(f)
//!
//! Replication and block summation are each other's adjoints:
//!
//! ```text
//! repmat(x, n)  --reverse-->  repsum(S, n)
//! repsum(x, n)  --reverse-->  repmat(S, n)
//! ```
//!
//! A node's adjoint is projected onto the node's own sparsity before its
//! rule runs, so entries that are structural zeros never leak into
//! operands. Input sensitivities are projected onto the input sparsity.

use std::collections::HashMap;

use exprgraph_core::{CoreError, ExprGraph, ExprId, ExprOp, Reduction};
use log::{debug, trace};

use crate::error::DiffError;
use crate::{accumulate, check_seeds, fit_to, Seeds};

/// Reverse rule for one node.
///
/// `aseed[d][0]` is the adjoint of the node's output in direction `d`.
/// Returns `asens[d][i]`, the contribution to operand `i`'s adjoint.
pub fn vjp(graph: &mut ExprGraph, node: ExprId, aseed: &[Vec<Option<ExprId>>]) -> Result<Seeds, DiffError> {
    let op = graph.node(node)?.op.clone();
    let args = graph.operands(node)?;
    check_seeds(aseed, 1)?;

    let mut asens = Vec::with_capacity(aseed.len());
    for seed in aseed {
        let Some(s) = seed[0] else {
            asens.push(vec![None; args.len()]);
            continue;
        };
        let sens = match &op {
            ExprOp::Input { .. } | ExprOp::Constant { .. } => Vec::new(),
            ExprOp::Add => vec![Some(s), Some(s)],
            ExprOp::Times => {
                let dalpha = graph.dot(s, args[1])?;
                let dx = graph.times(args[0], s)?;
                vec![Some(dalpha), Some(dx)]
            }
            ExprOp::Transpose => vec![Some(graph.transpose(s)?)],
            ExprOp::Mtimes => {
                let bt = graph.transpose(args[1])?;
                let da = graph.mtimes(s, bt)?;
                let at = graph.transpose(args[0])?;
                let db = graph.mtimes(at, s)?;
                vec![Some(da), Some(db)]
            }
            ExprOp::Dot => {
                let da = graph.times(s, args[1])?;
                let db = graph.times(s, args[0])?;
                vec![Some(da), Some(db)]
            }
            ExprOp::Bilin => {
                let a = graph.sparsity(args[0])?;
                let (m, n) = (a.nrow(), a.ncol());
                let zeros = graph.zeros(m, n)?;
                let da = graph.rank1(zeros, s, args[1], args[2])?;
                let ay = graph.mtimes(args[0], args[2])?;
                let dx = graph.times(s, ay)?;
                let at = graph.transpose(args[0])?;
                let atx = graph.mtimes(at, args[1])?;
                let dy = graph.times(s, atx)?;
                vec![Some(da), Some(dx), Some(dy)]
            }
            ExprOp::Project { .. } => {
                let sp = graph.sparsity(args[0])?.clone();
                vec![Some(graph.project(s, sp)?)]
            }
            ExprOp::HorzRepmat { n } => vec![Some(graph.horzrepsum(s, *n)?)],
            ExprOp::HorzRepsum { n, reduction } => {
                if *reduction != Reduction::Sum {
                    return Err(CoreError::UnsupportedProtocol {
                        op: op.name(),
                        protocol: "reverse derivative of a non-sum reduction",
                    }
                    .into());
                }
                vec![Some(graph.horzrepmat(s, *n)?)]
            }
            ExprOp::Rank1 => {
                let dalpha = graph.bilin(s, args[2], args[3])?;
                let sy = graph.mtimes(s, args[3])?;
                let dx = graph.times(args[1], sy)?;
                let st = graph.transpose(s)?;
                let stx = graph.mtimes(st, args[2])?;
                let dy = graph.times(args[1], stx)?;
                vec![Some(s), Some(dalpha), Some(dx), Some(dy)]
            }
        };
        asens.push(sens);
    }
    Ok(asens)
}

/// Reverse sweep over everything `outputs` depend on.
///
/// `aseed[d][o]` seeds output `o` in direction `d`. Returns `asens[d][i]`,
/// the adjoint of input `i`, projected onto that input's sparsity. Inputs
/// the seeds do not reach get a structurally zero constant.
pub fn reverse_mode(
    graph: &mut ExprGraph,
    inputs: &[ExprId],
    outputs: &[ExprId],
    aseed: &[Vec<Option<ExprId>>],
) -> Result<Vec<Vec<ExprId>>, DiffError> {
    check_seeds(aseed, outputs.len())?;
    let ndir = aseed.len();
    for dir in aseed {
        for (&y, s) in outputs.iter().zip(dir) {
            if let Some(s) = s {
                let (want, got) = (graph.sparsity(y)?, graph.sparsity(*s)?);
                if !want.same_dims(got) {
                    return Err(CoreError::DimensionMismatch {
                        op: "reverse seed",
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
        "reverse sweep: {} nodes, {} outputs, {ndir} directions",
        order.len(),
        outputs.len()
    );

    let mut adjoint: HashMap<ExprId, Vec<Option<ExprId>>> = HashMap::new();
    for (o, &y) in outputs.iter().enumerate() {
        let entry = adjoint.entry(y).or_insert_with(|| vec![None; ndir]);
        for (d, dir) in aseed.iter().enumerate() {
            entry[d] = accumulate(graph, entry[d], dir[o])?;
        }
    }

    for &id in order.iter().rev() {
        if graph.input_index(id)?.is_some() {
            continue;
        }
        let Some(adj) = adjoint.remove(&id) else {
            continue;
        };
        if adj.iter().all(Option::is_none) {
            continue;
        }
        let mut seed: Seeds = Vec::with_capacity(ndir);
        for a in adj {
            seed.push(vec![match a {
                Some(a) => Some(fit_to(graph, a, id)?),
                None => None,
            }]);
        }

        let asens = vjp(graph, id, &seed)?;
        let operands = graph.operands(id)?;
        trace!("adjoint of {id} reaches {} operands", operands.len());
        for (d, sens) in asens.into_iter().enumerate() {
            for (op, term) in operands.iter().zip(sens) {
                let entry = adjoint.entry(*op).or_insert_with(|| vec![None; ndir]);
                entry[d] = accumulate(graph, entry[d], term)?;
            }
        }
    }

    let mut result = Vec::with_capacity(ndir);
    for d in 0..ndir {
        let mut row = Vec::with_capacity(inputs.len());
        for &x in inputs {
            let sens = match adjoint.get(&x).and_then(|a| a[d]) {
                Some(a) => {
                    let want = graph.sparsity(x)?.clone();
                    if graph.sparsity(a)? == &want {
                        a
                    } else {
                        graph.project(a, want)?
                    }
                }
                None => {
                    let sp = graph.sparsity(x)?;
                    let (m, n) = (sp.nrow(), sp.ncol());
                    graph.zeros(m, n)?
                }
            };
            row.push(sens);
        }
        result.push(row);
    }
    Ok(result)
}

/// Gradient of a 1x1 `output` with respect to each input.
pub fn gradient(graph: &mut ExprGraph, inputs: &[ExprId], output: ExprId) -> Result<Vec<ExprId>, DiffError> {
    let sp = graph.sparsity(output)?;
    if !sp.is_scalar() {
        return Err(CoreError::NotScalar {
            op: "gradient",
            got: sp.dims(),
        }
        .into());
    }
    let one = graph.scalar(1.0)?;
    let mut asens = reverse_mode(graph, inputs, &[output], &[vec![Some(one)]])?;
    Ok(asens.pop().unwrap_or_default())
}
