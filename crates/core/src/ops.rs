//! # Expression Operations
//!
//! This module defines [`ExprOp`], the closed catalog of node variants, and
//! [`ExprNode`], one built node: a variant plus the sparsity of its operands
//! and outputs. Each node knows how to:
//!
//! - Derive its output sparsity from its operands (at construction)
//! - Evaluate over any [`Scalar`] element type (numeric or symbolic)
//! - Propagate dependency bits forward and backward
//! - Describe itself for diagnostics
//!
//! Derivative rules live in the `exprgraph-diff` crate and code emission in
//! `exprgraph-codegen`; both dispatch on the same enum.
//!
//! ## Operations
//!
//! | Op | Value | Output sparsity |
//! |----|-------|-----------------|
//! | Add | a + b | union |
//! | Times | alpha · X | X |
//! | Transpose | Xᵀ | Xᵀ |
//! | Mtimes | A · B | structural product |
//! | Dot | ⟨A, B⟩ | dense 1x1 |
//! | Bilin | xᵀ A y | dense 1x1 |
//! | Project | X restricted to a target | target |
//! | HorzRepmat | [x, x, …, x] | x tiled n times |
//! | HorzRepsum | reduce n horizontal blocks | union of blocks |
//! | Rank1 | A + alpha · x · yᵀ | A ∪ supp(x yᵀ) |
//!
//! Buffers hold one element per structural nonzero, column-major. A
//! structurally absent element is an exact zero.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::element::Scalar;
use crate::error::CoreError;
use crate::propagate::Bvec;
use crate::sparsity::SparsityPattern;

/// Associative, commutative reduction used by [`ExprOp::HorzRepsum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Reduction {
    /// Elementwise sum. The only reduction with derivative rules.
    #[default]
    Sum,
    /// Elementwise maximum (structural zeros take part as `0`).
    Max,
}

impl Reduction {
    pub fn apply<T: Scalar>(self, a: T, b: T) -> T {
        match self {
            Reduction::Sum => a + b,
            Reduction::Max => a.fmax(b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Reduction::Sum => "sum",
            Reduction::Max => "max",
        }
    }
}

/// Nonzero values of a constant, compared and hashed bitwise.
#[derive(Clone)]
pub struct ConstValues(Arc<[f64]>);

impl ConstValues {
    pub fn new(values: Vec<f64>) -> Self {
        ConstValues(values.into())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl PartialEq for ConstValues {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for ConstValues {}

impl Hash for ConstValues {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in self.0.iter() {
            v.to_bits().hash(state);
        }
    }
}

impl fmt::Debug for ConstValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// The closed set of node variants.
///
/// Leaf variants carry their declared sparsity; every other variant derives
/// it from its operands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprOp {
    /// Free symbolic input. `index` is unique within a graph.
    Input {
        index: usize,
        name: String,
        sparsity: SparsityPattern,
    },

    /// Constant matrix with one value per nonzero.
    Constant {
        sparsity: SparsityPattern,
        values: ConstValues,
    },

    /// Elementwise sum of two equally sized matrices.
    Add,

    /// Scalar times matrix: operands `(alpha, X)`.
    Times,

    /// Matrix transpose.
    Transpose,

    /// Matrix product: operands `(A, B)`.
    Mtimes,

    /// Inner product of two equally sized matrices.
    Dot,

    /// Bilinear form `xᵀ A y`: operands `(A, x, y)`.
    Bilin,

    /// Restrict (or zero-extend) an operand onto `target`.
    Project { target: SparsityPattern },

    /// Horizontal tiling `n` times.
    HorzRepmat { n: usize },

    /// Reduce `n` equal-width horizontal blocks into one.
    HorzRepsum { n: usize, reduction: Reduction },

    /// `A + alpha * x * yᵀ`: operands `(A, alpha, x, y)`.
    Rank1,
}

fn arity(op: &'static str, inputs: &[SparsityPattern], expected: usize) -> Result<(), CoreError> {
    if inputs.len() != expected {
        return Err(CoreError::Arity {
            op,
            expected,
            got: inputs.len(),
        });
    }
    Ok(())
}

fn same_dims(op: &'static str, a: &SparsityPattern, b: &SparsityPattern) -> Result<(), CoreError> {
    if !a.same_dims(b) {
        return Err(CoreError::DimensionMismatch {
            op,
            expected: a.dims(),
            got: b.dims(),
        });
    }
    Ok(())
}

fn scalar_operand(op: &'static str, sp: &SparsityPattern) -> Result<(), CoreError> {
    if !sp.is_scalar() {
        return Err(CoreError::NotScalar { op, got: sp.dims() });
    }
    Ok(())
}

fn column_of(op: &'static str, sp: &SparsityPattern, len: usize) -> Result<(), CoreError> {
    if sp.nrow() != len || !sp.is_column() {
        return Err(CoreError::DimensionMismatch {
            op,
            expected: format!("{len}x1"),
            got: sp.dims(),
        });
    }
    Ok(())
}

impl ExprOp {
    /// Short lowercase name, used in errors and generated code comments.
    pub fn name(&self) -> &'static str {
        match self {
            ExprOp::Input { .. } => "input",
            ExprOp::Constant { .. } => "constant",
            ExprOp::Add => "add",
            ExprOp::Times => "times",
            ExprOp::Transpose => "transpose",
            ExprOp::Mtimes => "mtimes",
            ExprOp::Dot => "dot",
            ExprOp::Bilin => "bilin",
            ExprOp::Project { .. } => "project",
            ExprOp::HorzRepmat { .. } => "repmat",
            ExprOp::HorzRepsum { .. } => "repsum",
            ExprOp::Rank1 => "rank1",
        }
    }

    /// Validate operand shapes and derive the output sparsity.
    ///
    /// Pure and value-independent: the same variant and operand patterns
    /// always give structurally equal outputs.
    pub fn infer(&self, inputs: &[SparsityPattern]) -> Result<Vec<SparsityPattern>, CoreError> {
        let name = self.name();
        let out = match self {
            ExprOp::Input { sparsity, .. } => {
                arity(name, inputs, 0)?;
                sparsity.clone()
            }
            ExprOp::Constant { sparsity, values } => {
                arity(name, inputs, 0)?;
                if values.as_slice().len() != sparsity.nnz() {
                    return Err(CoreError::InvalidSparsity {
                        reason: format!(
                            "constant has {} values for {} nonzeros",
                            values.as_slice().len(),
                            sparsity.nnz()
                        ),
                    });
                }
                sparsity.clone()
            }
            ExprOp::Add => {
                arity(name, inputs, 2)?;
                same_dims(name, &inputs[0], &inputs[1])?;
                inputs[0].union(&inputs[1])
            }
            ExprOp::Times => {
                arity(name, inputs, 2)?;
                scalar_operand(name, &inputs[0])?;
                inputs[1].clone()
            }
            ExprOp::Transpose => {
                arity(name, inputs, 1)?;
                inputs[0].transpose()
            }
            ExprOp::Mtimes => {
                arity(name, inputs, 2)?;
                if inputs[0].ncol() != inputs[1].nrow() {
                    return Err(CoreError::DimensionMismatch {
                        op: name,
                        expected: format!("{}xN", inputs[0].ncol()),
                        got: inputs[1].dims(),
                    });
                }
                inputs[0].mtimes(&inputs[1])
            }
            ExprOp::Dot => {
                arity(name, inputs, 2)?;
                same_dims(name, &inputs[0], &inputs[1])?;
                SparsityPattern::scalar()
            }
            ExprOp::Bilin => {
                arity(name, inputs, 3)?;
                column_of(name, &inputs[1], inputs[0].nrow())?;
                column_of(name, &inputs[2], inputs[0].ncol())?;
                SparsityPattern::scalar()
            }
            ExprOp::Project { target } => {
                arity(name, inputs, 1)?;
                same_dims(name, target, &inputs[0])?;
                target.clone()
            }
            ExprOp::HorzRepmat { n } => {
                arity(name, inputs, 1)?;
                if *n == 0 {
                    return Err(CoreError::InvalidReplication { n: *n });
                }
                inputs[0].horzrep(*n)
            }
            ExprOp::HorzRepsum { n, .. } => {
                arity(name, inputs, 1)?;
                inputs[0].horzsplit_union(*n)?.0
            }
            ExprOp::Rank1 => {
                arity(name, inputs, 4)?;
                let a = &inputs[0];
                scalar_operand(name, &inputs[1])?;
                column_of(name, &inputs[2], a.nrow())?;
                column_of(name, &inputs[3], a.ncol())?;
                a.union(&SparsityPattern::outer(&inputs[2], &inputs[3]))
            }
        };
        Ok(vec![out])
    }
}

impl fmt::Display for ExprOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprOp::Input { name, .. } => write!(f, "Input({name})"),
            ExprOp::HorzRepmat { n } => write!(f, "HorzRepmat({n})"),
            ExprOp::HorzRepsum { n, reduction } => {
                write!(f, "HorzRepsum({n}, {})", reduction.name())
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

// ============================================================================
// Buffer helpers
// ============================================================================

/// `dst[pos(src)] += src` for `src_sp ⊆ dst_sp`.
fn scatter_add<T: Scalar>(
    dst_sp: &SparsityPattern,
    dst: &mut [T],
    src_sp: &SparsityPattern,
    src: &[T],
) {
    if dst_sp == src_sp {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = d.clone() + s.clone();
        }
        return;
    }
    for (r, c, k) in src_sp.nonzeros() {
        if let Some(p) = dst_sp.get_nz(r, c) {
            dst[p] = dst[p].clone() + src[k].clone();
        }
    }
}

fn scatter_or(dst_sp: &SparsityPattern, dst: &mut [Bvec], src_sp: &SparsityPattern, src: &[Bvec]) {
    for (r, c, k) in src_sp.nonzeros() {
        if let Some(p) = dst_sp.get_nz(r, c) {
            dst[p] |= src[k];
        }
    }
}

/// `src[k] |= dst[pos(src_k)]`, the reverse of [`scatter_or`].
fn gather_or(dst_sp: &SparsityPattern, dst: &[Bvec], src_sp: &SparsityPattern, src: &mut [Bvec]) {
    for (r, c, k) in src_sp.nonzeros() {
        if let Some(p) = dst_sp.get_nz(r, c) {
            src[k] |= dst[p];
        }
    }
}

fn first_or_zero<T: Scalar>(buf: &[T]) -> T {
    buf.first().cloned().unwrap_or_else(T::zero)
}

/// Visit `(nz in A, nz in B, nz in result)` for every scalar product of `A * B`.
pub fn for_each_product(
    a: &SparsityPattern,
    b: &SparsityPattern,
    out: &SparsityPattern,
    mut f: impl FnMut(usize, usize, usize),
) {
    for j in 0..b.ncol() {
        for kb in b.col_range(j) {
            let kk = b.row()[kb];
            for ka in a.col_range(kk) {
                if let Some(p) = out.get_nz(a.row()[ka], j) {
                    f(ka, kb, p);
                }
            }
        }
    }
}

/// Visit `(nz in x, nz in y, nz in result)` for every entry of `x yᵀ`.
pub fn for_each_outer(
    x: &SparsityPattern,
    y: &SparsityPattern,
    out: &SparsityPattern,
    mut f: impl FnMut(usize, usize, usize),
) {
    for ky in 0..y.nnz() {
        let j = y.row()[ky];
        for kx in 0..x.nnz() {
            if let Some(p) = out.get_nz(x.row()[kx], j) {
                f(kx, ky, p);
            }
        }
    }
}

/// Visit `(nz in A, nz in x, nz in y)` for every term of `xᵀ A y`.
pub fn for_each_bilin(
    a: &SparsityPattern,
    x: &SparsityPattern,
    y: &SparsityPattern,
    mut f: impl FnMut(usize, usize, usize),
) {
    for (i, j, k) in a.nonzeros() {
        if let (Some(kx), Some(ky)) = (x.get_nz(i, 0), y.get_nz(j, 0)) {
            f(k, kx, ky);
        }
    }
}

/// Visit `(nz in A, nz in B)` for positions present in both.
pub fn for_each_common(a: &SparsityPattern, b: &SparsityPattern, mut f: impl FnMut(usize, usize)) {
    for (r, c, k) in a.nonzeros() {
        if let Some(kb) = b.get_nz(r, c) {
            f(k, kb);
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// One node of the expression DAG: a variant with the sparsity of its
/// operands and outputs. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ExprNode {
    /// The operation this node performs
    pub op: ExprOp,
    /// Operand sparsity patterns, in operand order
    pub inputs: Vec<SparsityPattern>,
    /// Output sparsity patterns
    pub outputs: Vec<SparsityPattern>,
}

impl ExprNode {
    /// Validate and build a node. No node exists if this fails.
    pub fn new(op: ExprOp, inputs: Vec<SparsityPattern>) -> Result<Self, CoreError> {
        let outputs = op.infer(&inputs)?;
        Ok(Self {
            op,
            inputs,
            outputs,
        })
    }

    /// Sparsity of the (first) output.
    pub fn sparsity(&self) -> &SparsityPattern {
        &self.outputs[0]
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Scratch elements needed by [`ExprNode::eval`].
    pub fn sz_w(&self) -> usize {
        match self.op {
            ExprOp::HorzRepsum {
                reduction: Reduction::Max,
                ..
            } => self.sparsity().nnz(),
            _ => 0,
        }
    }

    /// Number of leading operands whose buffer the result may overwrite.
    pub fn n_inplace(&self) -> usize {
        match self.op {
            ExprOp::Rank1 => 1,
            _ => 0,
        }
    }

    /// True if the result may be computed in the first operand's buffer:
    /// the variant is in-place eligible and no fill-in is introduced.
    pub fn can_eval_in_place(&self) -> bool {
        self.n_inplace() > 0 && self.inputs[0] == self.outputs[0]
    }

    /// Evaluate over one buffer per operand and output.
    ///
    /// `arg[i]` holds `inputs[i].nnz()` elements, `res[0]` holds
    /// `sparsity().nnz()` elements, `w` at least [`ExprNode::sz_w`].
    /// For `Input`, `arg[0]` is the boundary value.
    pub fn eval<T: Scalar>(&self, arg: &[&[T]], res: &mut [&mut [T]], w: &mut [T]) {
        let out_sp = &self.outputs[0];
        let out = &mut *res[0];
        match &self.op {
            ExprOp::Input { .. } => out.clone_from_slice(arg[0]),
            ExprOp::Constant { values, .. } => {
                for (o, &v) in out.iter_mut().zip(values.as_slice()) {
                    *o = T::from(v);
                }
            }
            ExprOp::Add => {
                out.fill(T::zero());
                scatter_add(out_sp, out, &self.inputs[0], arg[0]);
                scatter_add(out_sp, out, &self.inputs[1], arg[1]);
            }
            ExprOp::Times => {
                let alpha = first_or_zero(arg[0]);
                for (o, x) in out.iter_mut().zip(arg[1]) {
                    *o = alpha.clone() * x.clone();
                }
            }
            ExprOp::Transpose => {
                for (r, c, k) in self.inputs[0].nonzeros() {
                    if let Some(p) = out_sp.get_nz(c, r) {
                        out[p] = arg[0][k].clone();
                    }
                }
            }
            ExprOp::Mtimes => {
                out.fill(T::zero());
                for_each_product(&self.inputs[0], &self.inputs[1], out_sp, |ka, kb, p| {
                    out[p] = out[p].clone() + arg[0][ka].clone() * arg[1][kb].clone();
                });
            }
            ExprOp::Dot => {
                let mut acc = T::zero();
                for_each_common(&self.inputs[0], &self.inputs[1], |ka, kb| {
                    acc = acc.clone() + arg[0][ka].clone() * arg[1][kb].clone();
                });
                out[0] = acc;
            }
            ExprOp::Bilin => {
                let mut acc = T::zero();
                for_each_bilin(&self.inputs[0], &self.inputs[1], &self.inputs[2], |k, kx, ky| {
                    acc = acc.clone() + arg[1][kx].clone() * arg[0][k].clone() * arg[2][ky].clone();
                });
                out[0] = acc;
            }
            ExprOp::Project { .. } => {
                let in_sp = &self.inputs[0];
                for (r, c, k) in out_sp.nonzeros() {
                    out[k] = match in_sp.get_nz(r, c) {
                        Some(src) => arg[0][src].clone(),
                        None => T::zero(),
                    };
                }
            }
            ExprOp::HorzRepmat { .. } => {
                let nnz = arg[0].len();
                if nnz > 0 {
                    for block in out.chunks_mut(nnz) {
                        block.clone_from_slice(arg[0]);
                    }
                }
            }
            ExprOp::HorzRepsum { n, reduction } => {
                self.eval_repsum(*n, *reduction, arg[0], out, w);
            }
            ExprOp::Rank1 => {
                out.fill(T::zero());
                scatter_add(out_sp, out, &self.inputs[0], arg[0]);
                self.rank1_update(arg, out);
            }
        }
    }

    /// Evaluate with `res[0]` already holding the first operand's values.
    ///
    /// `arg[0]` is not read. The caller guarantees the first operand has no
    /// other live consumer.
    pub fn eval_in_place<T: Scalar>(
        &self,
        arg: &[&[T]],
        res: &mut [&mut [T]],
        _w: &mut [T],
    ) -> Result<(), CoreError> {
        if self.n_inplace() == 0 {
            return Err(CoreError::UnsupportedProtocol {
                op: self.op.name(),
                protocol: "in-place evaluation",
            });
        }
        debug_assert!(
            self.can_eval_in_place(),
            "in-place {} would introduce fill-in",
            self.op.name()
        );
        self.rank1_update(arg, &mut *res[0]);
        Ok(())
    }

    fn rank1_update<T: Scalar>(&self, arg: &[&[T]], out: &mut [T]) {
        let alpha = first_or_zero(arg[1]);
        for_each_outer(&self.inputs[2], &self.inputs[3], &self.outputs[0], |kx, ky, p| {
            out[p] = out[p].clone() + alpha.clone() * arg[2][kx].clone() * arg[3][ky].clone();
        });
    }

    fn eval_repsum<T: Scalar>(&self, n: usize, reduction: Reduction, x: &[T], out: &mut [T], w: &mut [T]) {
        let in_sp = &self.inputs[0];
        let out_sp = &self.outputs[0];
        let width = in_sp.ncol() / n;
        out.fill(T::zero());
        match reduction {
            Reduction::Sum => {
                for (r, c, k) in in_sp.nonzeros() {
                    if let Some(p) = out_sp.get_nz(r, c % width) {
                        out[p] = out[p].clone() + x[k].clone();
                    }
                }
            }
            Reduction::Max => {
                let tmp = &mut w[..out.len()];
                for b in 0..n {
                    tmp.fill(T::zero());
                    for c in 0..width {
                        for k in in_sp.col_range(b * width + c) {
                            if let Some(p) = out_sp.get_nz(in_sp.row()[k], c) {
                                tmp[p] = x[k].clone();
                            }
                        }
                    }
                    for (o, t) in out.iter_mut().zip(tmp.iter()) {
                        *o = if b == 0 {
                            t.clone()
                        } else {
                            reduction.apply(o.clone(), t.clone())
                        };
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Sparsity propagation
    // ------------------------------------------------------------------------

    /// Forward dependency propagation: every output bit is the OR of the
    /// bits of the operand elements that can influence it.
    pub fn sp_forward(&self, arg: &[&[Bvec]], res: &mut [&mut [Bvec]]) {
        let out_sp = &self.outputs[0];
        let out = &mut *res[0];
        match &self.op {
            ExprOp::Input { .. } => out.copy_from_slice(arg[0]),
            ExprOp::Constant { .. } => out.fill(0),
            ExprOp::Add => {
                out.fill(0);
                scatter_or(out_sp, out, &self.inputs[0], arg[0]);
                scatter_or(out_sp, out, &self.inputs[1], arg[1]);
            }
            ExprOp::Times => {
                let alpha = arg[0].first().copied().unwrap_or(0);
                for (o, &x) in out.iter_mut().zip(arg[1]) {
                    *o = alpha | x;
                }
            }
            ExprOp::Transpose => {
                for (r, c, k) in self.inputs[0].nonzeros() {
                    if let Some(p) = out_sp.get_nz(c, r) {
                        out[p] = arg[0][k];
                    }
                }
            }
            ExprOp::Mtimes => {
                out.fill(0);
                for_each_product(&self.inputs[0], &self.inputs[1], out_sp, |ka, kb, p| {
                    out[p] |= arg[0][ka] | arg[1][kb];
                });
            }
            ExprOp::Dot => {
                let mut acc = 0;
                for_each_common(&self.inputs[0], &self.inputs[1], |ka, kb| {
                    acc |= arg[0][ka] | arg[1][kb];
                });
                out[0] = acc;
            }
            ExprOp::Bilin => {
                let mut acc = 0;
                for_each_bilin(&self.inputs[0], &self.inputs[1], &self.inputs[2], |k, kx, ky| {
                    acc |= arg[0][k] | arg[1][kx] | arg[2][ky];
                });
                out[0] = acc;
            }
            ExprOp::Project { .. } => {
                let in_sp = &self.inputs[0];
                for (r, c, k) in out_sp.nonzeros() {
                    out[k] = in_sp.get_nz(r, c).map_or(0, |src| arg[0][src]);
                }
            }
            ExprOp::HorzRepmat { .. } => {
                let nnz = arg[0].len();
                if nnz > 0 {
                    for block in out.chunks_mut(nnz) {
                        block.copy_from_slice(arg[0]);
                    }
                }
            }
            ExprOp::HorzRepsum { n, .. } => {
                let in_sp = &self.inputs[0];
                let width = in_sp.ncol() / n;
                out.fill(0);
                for (r, c, k) in in_sp.nonzeros() {
                    if let Some(p) = out_sp.get_nz(r, c % width) {
                        out[p] |= arg[0][k];
                    }
                }
            }
            ExprOp::Rank1 => {
                out.fill(0);
                scatter_or(out_sp, out, &self.inputs[0], arg[0]);
                self.rank1_sp_forward(arg, out);
            }
        }
    }

    /// Forward propagation with `res[0]` already holding the first operand's bits.
    pub fn sp_forward_in_place(&self, arg: &[&[Bvec]], res: &mut [&mut [Bvec]]) -> Result<(), CoreError> {
        if self.n_inplace() == 0 {
            return Err(CoreError::UnsupportedProtocol {
                op: self.op.name(),
                protocol: "in-place sparsity propagation",
            });
        }
        self.rank1_sp_forward(arg, &mut *res[0]);
        Ok(())
    }

    fn rank1_sp_forward(&self, arg: &[&[Bvec]], out: &mut [Bvec]) {
        let alpha = arg[1].first().copied().unwrap_or(0);
        for_each_outer(&self.inputs[2], &self.inputs[3], &self.outputs[0], |kx, ky, p| {
            out[p] |= alpha | arg[2][kx] | arg[3][ky];
        });
    }

    /// Reverse dependency propagation: OR each output bit into every operand
    /// element that can influence it, then clear the consumed output bits.
    ///
    /// `arg` buffers are accumulated into, never overwritten.
    pub fn sp_reverse(&self, arg: &mut [&mut [Bvec]], res: &mut [&mut [Bvec]]) {
        let out_sp = &self.outputs[0];
        let out = &mut *res[0];
        match &self.op {
            ExprOp::Input { .. } => {
                for (a, &o) in arg[0].iter_mut().zip(out.iter()) {
                    *a |= o;
                }
            }
            ExprOp::Constant { .. } => {}
            ExprOp::Add => {
                gather_or(out_sp, out, &self.inputs[0], arg[0]);
                gather_or(out_sp, out, &self.inputs[1], arg[1]);
            }
            ExprOp::Times => {
                let all = out.iter().fold(0, |acc, &o| acc | o);
                if let Some(alpha) = arg[0].first_mut() {
                    *alpha |= all;
                }
                for (x, &o) in arg[1].iter_mut().zip(out.iter()) {
                    *x |= o;
                }
            }
            ExprOp::Transpose => {
                for (r, c, k) in self.inputs[0].nonzeros() {
                    if let Some(p) = out_sp.get_nz(c, r) {
                        arg[0][k] |= out[p];
                    }
                }
            }
            ExprOp::Mtimes => {
                for_each_product(&self.inputs[0], &self.inputs[1], out_sp, |ka, kb, p| {
                    arg[0][ka] |= out[p];
                    arg[1][kb] |= out[p];
                });
            }
            ExprOp::Dot => {
                let seed = out[0];
                for_each_common(&self.inputs[0], &self.inputs[1], |ka, kb| {
                    arg[0][ka] |= seed;
                    arg[1][kb] |= seed;
                });
            }
            ExprOp::Bilin => {
                let seed = out[0];
                for_each_bilin(&self.inputs[0], &self.inputs[1], &self.inputs[2], |k, kx, ky| {
                    arg[0][k] |= seed;
                    arg[1][kx] |= seed;
                    arg[2][ky] |= seed;
                });
            }
            ExprOp::Project { .. } => gather_or(out_sp, out, &self.inputs[0], arg[0]),
            ExprOp::HorzRepmat { .. } => {
                let nnz = arg[0].len();
                if nnz > 0 {
                    for block in out.chunks(nnz) {
                        for (a, &o) in arg[0].iter_mut().zip(block) {
                            *a |= o;
                        }
                    }
                }
            }
            ExprOp::HorzRepsum { n, .. } => {
                let in_sp = &self.inputs[0];
                let width = in_sp.ncol() / n;
                for (r, c, k) in in_sp.nonzeros() {
                    if let Some(p) = out_sp.get_nz(r, c % width) {
                        arg[0][k] |= out[p];
                    }
                }
            }
            ExprOp::Rank1 => {
                gather_or(out_sp, out, &self.inputs[0], arg[0]);
                self.rank1_sp_reverse(arg, out);
            }
        }
        out.fill(0);
    }

    /// Reverse propagation when `res[0]` is also the first operand's buffer.
    /// The shared bits pass through unchanged and are not cleared.
    pub fn sp_reverse_in_place(
        &self,
        arg: &mut [&mut [Bvec]],
        res: &mut [&mut [Bvec]],
    ) -> Result<(), CoreError> {
        if self.n_inplace() == 0 {
            return Err(CoreError::UnsupportedProtocol {
                op: self.op.name(),
                protocol: "in-place sparsity propagation",
            });
        }
        self.rank1_sp_reverse(arg, &mut *res[0]);
        Ok(())
    }

    fn rank1_sp_reverse(&self, arg: &mut [&mut [Bvec]], out: &[Bvec]) {
        let (head, tail) = arg.split_at_mut(2);
        let alpha = &mut head[1];
        let (x, y) = tail.split_at_mut(1);
        for_each_outer(&self.inputs[2], &self.inputs[3], &self.outputs[0], |kx, ky, p| {
            if let Some(a) = alpha.first_mut() {
                *a |= out[p];
            }
            x[0][kx] |= out[p];
            y[0][ky] |= out[p];
        });
    }

    // ------------------------------------------------------------------------
    // Printing
    // ------------------------------------------------------------------------

    /// Textual form given the textual forms of the operands.
    pub fn describe(&self, args: &[String]) -> String {
        match &self.op {
            ExprOp::Input { name, .. } => name.clone(),
            ExprOp::Constant { sparsity, values } => {
                let values = values.as_slice();
                if values.is_empty() {
                    format!("zeros({})", sparsity.dims())
                } else if sparsity.is_scalar() {
                    format!("{}", values[0])
                } else {
                    format!("const({})", sparsity.dims())
                }
            }
            ExprOp::Add => format!("({}+{})", args[0], args[1]),
            ExprOp::Times => format!("({}*{})", args[0], args[1]),
            ExprOp::Transpose => format!("{}'", args[0]),
            ExprOp::Mtimes => format!("mtimes({}, {})", args[0], args[1]),
            ExprOp::Dot => format!("dot({}, {})", args[0], args[1]),
            ExprOp::Bilin => format!("bilin({}, {}, {})", args[0], args[1], args[2]),
            ExprOp::Project { .. } => format!("project({})", args[0]),
            ExprOp::HorzRepmat { n } => format!("repmat({}, {n})", args[0]),
            ExprOp::HorzRepsum {
                n,
                reduction: Reduction::Sum,
            } => format!("repsum({}, {n})", args[0]),
            ExprOp::HorzRepsum { n, reduction } => {
                format!("repsum({}, {n}, {})", args[0], reduction.name())
            }
            ExprOp::Rank1 => format!("rank1({}, {}, {}, {})", args[0], args[1], args[2], args[3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_node(node: &ExprNode, args: &[Vec<f64>]) -> Vec<f64> {
        let arg: Vec<&[f64]> = args.iter().map(|a| a.as_slice()).collect();
        let mut out = vec![0.0; node.sparsity().nnz()];
        let mut w = vec![0.0; node.sz_w()];
        node.eval(&arg, &mut [out.as_mut_slice()], &mut w);
        out
    }

    #[test]
    fn test_repmat_values() {
        let x = SparsityPattern::dense(1, 2);
        let node = ExprNode::new(ExprOp::HorzRepmat { n: 3 }, vec![x]).unwrap();
        assert_eq!(node.sparsity().dims(), "1x6");
        let out = eval_node(&node, &[vec![1.0, 2.0]]);
        assert_eq!(out, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_repsum_values() {
        let x = SparsityPattern::dense(1, 6);
        let node = ExprNode::new(
            ExprOp::HorzRepsum {
                n: 3,
                reduction: Reduction::Sum,
            },
            vec![x],
        )
        .unwrap();
        let out = eval_node(&node, &[vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]]);
        assert_eq!(out, vec![9.0, 12.0]);
    }

    #[test]
    fn test_repsum_max_counts_structural_zeros() {
        // Blocks: [-1, .], [-3, -2]; column 1 of block 0 is a structural zero.
        let x = SparsityPattern::from_triplets(1, 4, &[(0, 0), (0, 2), (0, 3)]).unwrap();
        let node = ExprNode::new(
            ExprOp::HorzRepsum {
                n: 2,
                reduction: Reduction::Max,
            },
            vec![x],
        )
        .unwrap();
        let out = eval_node(&node, &[vec![-1.0, -3.0, -2.0]]);
        assert_eq!(out, vec![-1.0, 0.0]);
    }

    #[test]
    fn test_rank1_values() {
        let a = SparsityPattern::diagonal(2);
        let s = SparsityPattern::scalar();
        let v = SparsityPattern::dense_column(2);
        let node = ExprNode::new(ExprOp::Rank1, vec![a, s, v.clone(), v]).unwrap();
        assert!(node.sparsity().is_dense());
        let out = eval_node(&node, &[vec![1.0, 1.0], vec![2.0], vec![1.0, 1.0], vec![1.0, 1.0]]);
        assert_eq!(out, vec![3.0, 2.0, 2.0, 3.0]);
    }

    #[test]
    fn test_rank1_in_place_requires_no_fill_in() {
        let d = SparsityPattern::dense(2, 2);
        let s = SparsityPattern::scalar();
        let v = SparsityPattern::dense_column(2);
        let node = ExprNode::new(ExprOp::Rank1, vec![d, s.clone(), v.clone(), v.clone()]).unwrap();
        assert!(node.can_eval_in_place());

        let mut buf = vec![1.0, 0.0, 0.0, 1.0];
        let alpha = [2.0];
        let x = [1.0, 1.0];
        let args: [&[f64]; 4] = [&[], &alpha, &x, &x];
        node.eval_in_place(&args, &mut [buf.as_mut_slice()], &mut []).unwrap();
        assert_eq!(buf, vec![3.0, 2.0, 2.0, 3.0]);

        let fill = ExprNode::new(ExprOp::Rank1, vec![SparsityPattern::diagonal(2), s, v.clone(), v])
            .unwrap();
        assert!(!fill.can_eval_in_place());
    }

    #[test]
    fn test_rank1_rejects_bad_shapes() {
        let a = SparsityPattern::dense(2, 3);
        let s = SparsityPattern::scalar();
        let err = ExprNode::new(
            ExprOp::Rank1,
            vec![
                a.clone(),
                s.clone(),
                SparsityPattern::dense_column(2),
                SparsityPattern::dense_column(2),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { op: "rank1", .. }));

        // x has the right row count but is not a column
        let err = ExprNode::new(
            ExprOp::Rank1,
            vec![
                a.clone(),
                s.clone(),
                SparsityPattern::dense(2, 2),
                SparsityPattern::dense_column(3),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { op: "rank1", .. }));

        let err = ExprNode::new(
            ExprOp::Rank1,
            vec![
                a,
                SparsityPattern::dense_column(2),
                SparsityPattern::dense_column(2),
                SparsityPattern::dense_column(3),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::NotScalar { .. }));
    }

    #[test]
    fn test_repmat_rejects_zero() {
        let err = ExprNode::new(ExprOp::HorzRepmat { n: 0 }, vec![SparsityPattern::scalar()]).unwrap_err();
        assert_eq!(err, CoreError::InvalidReplication { n: 0 });
        assert!(err.is_configuration());
    }

    #[test]
    fn test_in_place_rejected_for_other_ops() {
        let node = ExprNode::new(ExprOp::Transpose, vec![SparsityPattern::scalar()]).unwrap();
        let mut out = [0.0];
        let err = node.eval_in_place::<f64>(&[&[1.0]], &mut [&mut out], &mut []).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedProtocol { op: "transpose", .. }));
    }

    #[test]
    fn test_mtimes_and_transpose() {
        // A = [[1, 2], [3, 4]] column-major.
        let a = SparsityPattern::dense(2, 2);
        let x = SparsityPattern::dense_column(2);
        let node = ExprNode::new(ExprOp::Mtimes, vec![a.clone(), x]).unwrap();
        let out = eval_node(&node, &[vec![1.0, 3.0, 2.0, 4.0], vec![1.0, 1.0]]);
        assert_eq!(out, vec![3.0, 7.0]);

        let t = ExprNode::new(ExprOp::Transpose, vec![a]).unwrap();
        assert_eq!(eval_node(&t, &[vec![1.0, 3.0, 2.0, 4.0]]), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_sp_forward_and_reverse_repmat() {
        let x = SparsityPattern::dense(1, 2);
        let node = ExprNode::new(ExprOp::HorzRepmat { n: 2 }, vec![x]).unwrap();
        let mut out = [0 as Bvec; 4];
        node.sp_forward(&[&[0b01, 0b10]], &mut [&mut out]);
        assert_eq!(out, [0b01, 0b10, 0b01, 0b10]);

        let mut seeds = [0b100, 0, 0, 0b1000];
        let mut adj = [0 as Bvec; 2];
        node.sp_reverse(&mut [&mut adj], &mut [&mut seeds]);
        assert_eq!(adj, [0b100, 0b1000]);
        assert_eq!(seeds, [0; 4]);
    }

    #[test]
    fn test_sp_forward_rank1() {
        let a = SparsityPattern::diagonal(2);
        let s = SparsityPattern::scalar();
        let x = SparsityPattern::from_triplets(2, 1, &[(0, 0)]).unwrap();
        let y = SparsityPattern::dense_column(2);
        let node = ExprNode::new(ExprOp::Rank1, vec![a, s, x, y]).unwrap();
        // Result pattern: diag ∪ row 0 = (0,0), (0,1), (1,1).
        assert_eq!(node.sparsity().nnz(), 3);
        let mut out = [0 as Bvec; 3];
        node.sp_forward(&[&[1, 2], &[4], &[8], &[16, 32]], &mut [&mut out]);
        assert_eq!(out, [1 | 4 | 8 | 16, 4 | 8 | 32, 2]);
    }

    #[test]
    fn test_describe() {
        let node = ExprNode::new(ExprOp::HorzRepmat { n: 3 }, vec![SparsityPattern::scalar()]).unwrap();
        assert_eq!(node.describe(&["x".to_string()]), "repmat(x, 3)");
        let node = ExprNode::new(
            ExprOp::HorzRepsum {
                n: 1,
                reduction: Reduction::Max,
            },
            vec![SparsityPattern::scalar()],
        )
        .unwrap();
        assert_eq!(node.describe(&["x".to_string()]), "repsum(x, 1, max)");
    }
}
