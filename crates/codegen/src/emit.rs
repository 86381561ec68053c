//! # Per-Node Emission
//!
//! [`emit_node`] writes the statements that reproduce
//! [`ExprNode::eval`] for one node, given where its operands and result
//! live. Statements are unrolled over the nonzeros of the fixed sparsity
//! patterns; replication is the one loop.
//!
//! Every output nonzero is assigned from the sum of its contributions in
//! the order evaluation accumulates them, so a generated kernel and the
//! interpreter agree term by term.
//!
//! A result reference equal to the first operand reference requests
//! in-place emission. Only variants with [`ExprNode::can_eval_in_place`]
//! accept it; the caller guarantees the operand has no other live
//! consumer.

use exprgraph_core::ops::{for_each_bilin, for_each_common, for_each_outer, for_each_product};
use exprgraph_core::{CoreError, ExprNode, ExprOp, Reduction, SparsityPattern};
use log::trace;

use crate::context::{literal, BufRef, CodegenContext, INT};
use crate::error::CodegenError;

fn sum(terms: &[String]) -> String {
    if terms.is_empty() {
        literal(0.0)
    } else {
        terms.join(" + ")
    }
}

/// The scalar operand value, or zero for a structurally zero scalar.
fn scalar_ref(sp: &SparsityPattern, buf: &BufRef) -> String {
    if sp.nnz() > 0 {
        buf.at(0)
    } else {
        literal(0.0)
    }
}

/// Contributions of `src` to `dst` positions, as in scatter-add.
fn scatter(terms: &mut [Vec<String>], dst: &SparsityPattern, src: &SparsityPattern, buf: &BufRef) {
    for (r, c, k) in src.nonzeros() {
        if let Some(p) = dst.get_nz(r, c) {
            terms[p].push(buf.at(k));
        }
    }
}

fn assign_all(ctx: &mut CodegenContext, res: &BufRef, terms: &[Vec<String>]) {
    for (p, t) in terms.iter().enumerate() {
        ctx.line(format!("{} = {};", res.at(p), sum(t)));
    }
}

/// Emit the statements evaluating `node`.
///
/// `arg[i]` locates operand `i`, `res[0]` the result.
pub fn emit_node(
    ctx: &mut CodegenContext,
    node: &ExprNode,
    arg: &[BufRef],
    res: &[BufRef],
) -> Result<(), CodegenError> {
    let name = node.op.name();
    if arg.len() != node.num_inputs() {
        return Err(CoreError::Arity {
            op: name,
            expected: node.num_inputs(),
            got: arg.len(),
        }
        .into());
    }
    let Some(out) = res.first() else {
        return Err(CoreError::Arity {
            op: name,
            expected: node.num_outputs(),
            got: 0,
        }
        .into());
    };
    // An operand without nonzeros has no storage to alias.
    let in_place = node.inputs.first().map_or(false, |sp| sp.nnz() > 0) && arg.first() == Some(out);
    if in_place && !node.can_eval_in_place() {
        return Err(CoreError::UnsupportedProtocol {
            op: name,
            protocol: "in-place code emission",
        }
        .into());
    }
    trace!("emitting {} into {}{}", node.op, out.ptr(), if in_place { " (in place)" } else { "" });

    let out_sp = node.sparsity();
    let nnz = out_sp.nnz();
    match &node.op {
        ExprOp::Input { .. } => {
            for k in 0..nnz {
                ctx.line(format!("{} = {};", out.at(k), arg[0].at(k)));
            }
        }
        ExprOp::Constant { values, .. } => {
            for (k, &v) in values.as_slice().iter().enumerate() {
                ctx.line(format!("{} = {};", out.at(k), literal(v)));
            }
        }
        ExprOp::Add => {
            let mut terms = vec![Vec::new(); nnz];
            scatter(&mut terms, out_sp, &node.inputs[0], &arg[0]);
            scatter(&mut terms, out_sp, &node.inputs[1], &arg[1]);
            assign_all(ctx, out, &terms);
        }
        ExprOp::Times => {
            let alpha = scalar_ref(&node.inputs[0], &arg[0]);
            for k in 0..nnz {
                ctx.line(format!("{} = {alpha}*{};", out.at(k), arg[1].at(k)));
            }
        }
        ExprOp::Transpose => {
            for (r, c, k) in node.inputs[0].nonzeros() {
                if let Some(p) = out_sp.get_nz(c, r) {
                    ctx.line(format!("{} = {};", out.at(p), arg[0].at(k)));
                }
            }
        }
        ExprOp::Mtimes => {
            let mut terms = vec![Vec::new(); nnz];
            for_each_product(&node.inputs[0], &node.inputs[1], out_sp, |ka, kb, p| {
                terms[p].push(format!("{}*{}", arg[0].at(ka), arg[1].at(kb)));
            });
            assign_all(ctx, out, &terms);
        }
        ExprOp::Dot => {
            let mut terms = Vec::new();
            for_each_common(&node.inputs[0], &node.inputs[1], |ka, kb| {
                terms.push(format!("{}*{}", arg[0].at(ka), arg[1].at(kb)));
            });
            ctx.line(format!("{} = {};", out.at(0), sum(&terms)));
        }
        ExprOp::Bilin => {
            let mut terms = Vec::new();
            for_each_bilin(&node.inputs[0], &node.inputs[1], &node.inputs[2], |k, kx, ky| {
                terms.push(format!("{}*{}*{}", arg[1].at(kx), arg[0].at(k), arg[2].at(ky)));
            });
            ctx.line(format!("{} = {};", out.at(0), sum(&terms)));
        }
        ExprOp::Project { .. } => {
            for (r, c, k) in out_sp.nonzeros() {
                let value = match node.inputs[0].get_nz(r, c) {
                    Some(src) => arg[0].at(src),
                    None => literal(0.0),
                };
                ctx.line(format!("{} = {value};", out.at(k)));
            }
        }
        ExprOp::HorzRepmat { n } => {
            let block = node.inputs[0].nnz();
            if block > 0 {
                ctx.line(format!("for ({INT} i = 0; i < {n}; ++i) {{"));
                ctx.indent();
                for k in 0..block {
                    ctx.line(format!("{} = {};", out.at_strided(k, block, "i"), arg[0].at(k)));
                }
                ctx.dedent();
                ctx.line("}");
            }
        }
        ExprOp::HorzRepsum { n, reduction } => {
            let in_sp = &node.inputs[0];
            let width = in_sp.ncol() / n;
            match reduction {
                Reduction::Sum => {
                    let mut terms = vec![Vec::new(); nnz];
                    for (r, c, k) in in_sp.nonzeros() {
                        if let Some(p) = out_sp.get_nz(r, c % width) {
                            terms[p].push(arg[0].at(k));
                        }
                    }
                    assign_all(ctx, out, &terms);
                }
                Reduction::Max => {
                    // Missing entries of a block count as zero.
                    let mut blocks = vec![vec![literal(0.0); nnz]; *n];
                    for (b, values) in blocks.iter_mut().enumerate() {
                        for c in 0..width {
                            for k in in_sp.col_range(b * width + c) {
                                if let Some(p) = out_sp.get_nz(in_sp.row()[k], c) {
                                    values[p] = arg[0].at(k);
                                }
                            }
                        }
                    }
                    for p in 0..nnz {
                        let mut expr = blocks[0][p].clone();
                        for values in &blocks[1..] {
                            expr = format!("fmax({expr}, {})", values[p]);
                        }
                        ctx.line(format!("{} = {expr};", out.at(p)));
                    }
                }
            }
        }
        ExprOp::Rank1 => {
            let alpha = scalar_ref(&node.inputs[1], &arg[1]);
            let mut terms = vec![Vec::new(); nnz];
            if !in_place {
                scatter(&mut terms, out_sp, &node.inputs[0], &arg[0]);
            }
            let base: Vec<usize> = terms.iter().map(Vec::len).collect();
            for_each_outer(&node.inputs[2], &node.inputs[3], out_sp, |kx, ky, p| {
                terms[p].push(format!("{alpha}*{}*{}", arg[2].at(kx), arg[3].at(ky)));
            });
            if in_place {
                for (p, t) in terms.iter().enumerate() {
                    for term in &t[base[p]..] {
                        ctx.line(format!("{} += {term};", out.at(p)));
                    }
                }
            } else {
                assign_all(ctx, out, &terms);
            }
        }
    }
    Ok(())
}
