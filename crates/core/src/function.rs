//! # Compiled Functions
//!
//! A [`Function`] freezes the part of an [`ExprGraph`] that a set of outputs
//! depends on into a flat instruction list over one workspace buffer. It is
//! the evaluation boundary consumers (solvers, generated kernels) see:
//!
//! ```text
//! eval(arg, res, w)
//!   arg[i]  nnz_in(i) values of input i, column-major nonzeros
//!   res[i]  nnz_out(i) values of output i, written
//!   w       sz_w() elements of scratch, contents unspecified
//! ```
//!
//! ## Workspace layout
//!
//! Every non-input node gets a *slot* in `w`. Slots are recycled once their
//! value has no remaining consumer (best-fit from a free list). Node scratch
//! (e.g. for max reductions) sits after the last slot:
//!
//! ```text
//! w = [ slot 0 | slot 1 | ... | slot k-1 | node scratch ]
//! ```
//!
//! A rank-1 update whose matrix operand dies at that instruction and gains
//! no fill-in is marked in place: it writes into its operand's slot.

use std::collections::HashMap;

use log::{debug, trace};

use crate::element::{Scalar, SxElem};
use crate::error::CoreError;
use crate::graph::{ExprGraph, ExprId};
use crate::ops::{ExprNode, ExprOp};
use crate::sparsity::SparsityPattern;

/// Where an instruction operand or a function output is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Src {
    /// Function input buffer `arg[i]`.
    Arg(usize),
    /// Workspace slot.
    Slot(usize),
}

/// One step of a compiled function.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// The graph node this instruction evaluates
    pub expr: ExprId,
    /// Copy of the node (variant and sparsity)
    pub node: ExprNode,
    /// Operand sources, in operand order
    pub args: Vec<Src>,
    /// Result slot
    pub res: usize,
    /// True if the result slot is also the first operand's slot
    pub in_place: bool,
}

/// Best-fit slot allocator with a free list. Slot sizes only grow.
#[derive(Debug, Default)]
struct SlotAllocator {
    size: Vec<usize>,
    free: Vec<usize>,
}

impl SlotAllocator {
    fn acquire(&mut self, len: usize) -> usize {
        let fitting = self
            .free
            .iter()
            .enumerate()
            .filter(|&(_, &s)| self.size[s] >= len)
            .min_by_key(|&(_, &s)| self.size[s])
            .map(|(i, _)| i);
        let pick = fitting.or_else(|| {
            self.free
                .iter()
                .enumerate()
                .max_by_key(|&(_, &s)| self.size[s])
                .map(|(i, _)| i)
        });
        match pick {
            Some(i) => {
                let slot = self.free.swap_remove(i);
                self.size[slot] = self.size[slot].max(len);
                slot
            }
            None => {
                self.size.push(len);
                self.size.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.free.push(slot);
    }

    /// Slot offsets and the total slot length.
    fn layout(&self) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(self.size.len());
        let mut total = 0;
        for &len in &self.size {
            offsets.push(total);
            total += len;
        }
        (offsets, total)
    }
}

/// A compiled, immutable mapping from input matrices to output matrices.
///
/// Holds no evaluation state; the caller owns every buffer. `Send + Sync`.
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) name: String,
    pub(crate) names_in: Vec<String>,
    pub(crate) sparsity_in: Vec<SparsityPattern>,
    pub(crate) sparsity_out: Vec<SparsityPattern>,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) slot_offset: Vec<usize>,
    pub(crate) slot_size: Vec<usize>,
    pub(crate) output_src: Vec<Src>,
    pub(crate) sz_slots: usize,
    pub(crate) sz_scratch: usize,
}

impl Function {
    /// Compile the subgraph `outputs` depend on.
    ///
    /// Every entry of `inputs` must be an `Input` node, and every `Input`
    /// node the outputs depend on must be listed.
    pub fn new(
        graph: &ExprGraph,
        name: impl Into<String>,
        inputs: &[ExprId],
        outputs: &[ExprId],
    ) -> Result<Self, CoreError> {
        let name = name.into();
        let mut location: HashMap<ExprId, Src> = HashMap::new();
        let mut names_in = Vec::with_capacity(inputs.len());
        let mut sparsity_in = Vec::with_capacity(inputs.len());
        for (i, &id) in inputs.iter().enumerate() {
            let node = graph.node(id)?;
            match &node.op {
                ExprOp::Input { name, .. } => {
                    names_in.push(name.clone());
                    sparsity_in.push(node.sparsity().clone());
                    location.insert(id, Src::Arg(i));
                }
                _ => return Err(CoreError::NotAnInput { index: i }),
            }
        }

        let order = graph.reachable(outputs)?;
        let mut operands: HashMap<ExprId, Vec<ExprId>> = HashMap::with_capacity(order.len());
        let mut last_use: HashMap<ExprId, usize> = HashMap::new();
        for (pos, &id) in order.iter().enumerate() {
            let ops = graph.operands(id)?;
            for &op in &ops {
                last_use.insert(op, pos);
            }
            operands.insert(id, ops);
        }
        for &id in outputs {
            last_use.insert(id, usize::MAX);
        }

        let mut alloc = SlotAllocator::default();
        let mut instructions = Vec::new();
        for (pos, &id) in order.iter().enumerate() {
            if location.contains_key(&id) {
                continue;
            }
            let node = graph.node(id)?;
            if let ExprOp::Input { name, .. } = &node.op {
                return Err(CoreError::FreeInput { name: name.clone() });
            }
            let ops = operands.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let args = ops
                .iter()
                .map(|op| {
                    location
                        .get(op)
                        .copied()
                        .ok_or(CoreError::UnknownNode { id: op.index() })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let dies = |op: &ExprId| last_use.get(op) == Some(&pos);

            let reuse = match args.first() {
                Some(&Src::Slot(s))
                    if node.can_eval_in_place() && dies(&ops[0]) && !ops[1..].contains(&ops[0]) =>
                {
                    Some(s)
                }
                _ => None,
            };
            let (res, in_place) = match reuse {
                Some(s) => {
                    trace!("{id} ({}) reuses operand slot {s} in place", node.op);
                    (s, true)
                }
                None => (alloc.acquire(node.sparsity().nnz()), false),
            };

            let mut released = Vec::new();
            for (op, src) in ops.iter().zip(&args) {
                if let Src::Slot(s) = *src {
                    if s != res && dies(op) && !released.contains(&s) {
                        alloc.release(s);
                        released.push(s);
                    }
                }
            }

            location.insert(id, Src::Slot(res));
            instructions.push(Instruction {
                expr: id,
                node: node.clone(),
                args,
                res,
                in_place,
            });
        }

        let mut output_src = Vec::with_capacity(outputs.len());
        let mut sparsity_out = Vec::with_capacity(outputs.len());
        for &id in outputs {
            let src = location
                .get(&id)
                .copied()
                .ok_or(CoreError::UnknownNode { id: id.index() })?;
            output_src.push(src);
            sparsity_out.push(graph.sparsity(id)?.clone());
        }

        let (slot_offset, sz_slots) = alloc.layout();
        let sz_scratch = instructions.iter().map(|i| i.node.sz_w()).max().unwrap_or(0);
        debug!(
            "compiled function '{name}': {} instructions, {} slots, sz_w = {}",
            instructions.len(),
            slot_offset.len(),
            sz_slots + sz_scratch
        );

        Ok(Self {
            name,
            names_in,
            sparsity_in,
            sparsity_out,
            instructions,
            slot_offset,
            slot_size: alloc.size,
            output_src,
            sz_slots,
            sz_scratch,
        })
    }

    // ========================================================================
    // Sizes and sparsity
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_in(&self) -> usize {
        self.sparsity_in.len()
    }

    pub fn n_out(&self) -> usize {
        self.sparsity_out.len()
    }

    /// Panics if `i >= n_in()`.
    pub fn sparsity_in(&self, i: usize) -> &SparsityPattern {
        &self.sparsity_in[i]
    }

    /// Panics if `i >= n_out()`.
    pub fn sparsity_out(&self, i: usize) -> &SparsityPattern {
        &self.sparsity_out[i]
    }

    pub fn nnz_in(&self, i: usize) -> usize {
        self.sparsity_in[i].nnz()
    }

    pub fn nnz_out(&self, i: usize) -> usize {
        self.sparsity_out[i].nnz()
    }

    /// Required workspace length.
    pub fn sz_w(&self) -> usize {
        self.sz_slots + self.sz_scratch
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Offset of a workspace slot within `w`.
    pub fn slot_offset(&self, slot: usize) -> usize {
        self.slot_offset[slot]
    }

    pub fn output_sources(&self) -> &[Src] {
        &self.output_src
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    pub(crate) fn check_buffers(&self, arg: &[usize], res: &[usize], w: usize) -> Result<(), CoreError> {
        let count = |what, expected: usize, got: usize| {
            if expected == got {
                Ok(())
            } else {
                Err(CoreError::BufferSize {
                    what,
                    index: 0,
                    expected,
                    got,
                })
            }
        };
        count("arg count", self.n_in(), arg.len())?;
        count("res count", self.n_out(), res.len())?;
        for (index, (sp, &got)) in self.sparsity_in.iter().zip(arg).enumerate() {
            if sp.nnz() != got {
                return Err(CoreError::BufferSize {
                    what: "arg",
                    index,
                    expected: sp.nnz(),
                    got,
                });
            }
        }
        for (index, (sp, &got)) in self.sparsity_out.iter().zip(res).enumerate() {
            if sp.nnz() != got {
                return Err(CoreError::BufferSize {
                    what: "res",
                    index,
                    expected: sp.nnz(),
                    got,
                });
            }
        }
        if w < self.sz_w() {
            return Err(CoreError::BufferSize {
                what: "w",
                index: 0,
                expected: self.sz_w(),
                got: w,
            });
        }
        Ok(())
    }

    /// Run `step` for every instruction in order, then copy the outputs.
    ///
    /// Buffers must already be validated.
    pub(crate) fn sweep<T: Clone>(
        &self,
        arg: &[&[T]],
        res: &mut [&mut [T]],
        w: &mut [T],
        mut step: impl FnMut(&Instruction, &[&[T]], &mut [T], &mut [T]) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let (slots, scratch) = w.split_at_mut(self.sz_slots);
        for ins in &self.instructions {
            let offset = self.slot_offset[ins.res];
            let after_offset = offset + self.slot_size[ins.res];
            let (before, rest) = slots.split_at_mut(offset);
            let (out, after) = rest.split_at_mut(self.slot_size[ins.res]);

            let mut args: Vec<&[T]> = Vec::with_capacity(ins.args.len());
            for (src, sp) in ins.args.iter().zip(&ins.node.inputs) {
                let nnz = sp.nnz();
                args.push(match *src {
                    Src::Arg(i) => arg[i],
                    _ if nnz == 0 => &[],
                    Src::Slot(s) if s == ins.res => &[],
                    Src::Slot(s) => {
                        let o = self.slot_offset[s];
                        if o < offset {
                            &before[o..o + nnz]
                        } else {
                            &after[o - after_offset..o - after_offset + nnz]
                        }
                    }
                });
            }
            step(ins, &args, &mut out[..ins.node.sparsity().nnz()], scratch)?;
        }

        for (r, src) in res.iter_mut().zip(&self.output_src) {
            match *src {
                Src::Arg(i) => r.clone_from_slice(arg[i]),
                Src::Slot(s) => {
                    let o = self.slot_offset[s];
                    let len = r.len();
                    r.clone_from_slice(&slots[o..o + len]);
                }
            }
        }
        Ok(())
    }

    /// Numeric evaluation with caller-provided buffers.
    pub fn eval(&self, arg: &[&[f64]], res: &mut [&mut [f64]], w: &mut [f64]) -> Result<(), CoreError> {
        self.eval_gen(arg, res, w)
    }

    /// Evaluation over any [`Scalar`] element type.
    pub fn eval_gen<T: Scalar>(&self, arg: &[&[T]], res: &mut [&mut [T]], w: &mut [T]) -> Result<(), CoreError> {
        let arg_len: Vec<usize> = arg.iter().map(|a| a.len()).collect();
        let res_len: Vec<usize> = res.iter().map(|r| r.len()).collect();
        self.check_buffers(&arg_len, &res_len, w.len())?;
        self.sweep(arg, res, w, |ins, args, out, scratch| {
            if ins.in_place {
                ins.node.eval_in_place(args, &mut [out], scratch)
            } else {
                ins.node.eval(args, &mut [out], scratch);
                Ok(())
            }
        })
    }

    fn call_gen<T: Scalar>(&self, args: &[Vec<T>]) -> Result<Vec<Vec<T>>, CoreError> {
        let arg: Vec<&[T]> = args.iter().map(Vec::as_slice).collect();
        let mut out: Vec<Vec<T>> = self
            .sparsity_out
            .iter()
            .map(|sp| vec![T::zero(); sp.nnz()])
            .collect();
        let mut w = vec![T::zero(); self.sz_w()];
        let mut res: Vec<&mut [T]> = out.iter_mut().map(Vec::as_mut_slice).collect();
        self.eval_gen(&arg, &mut res, &mut w)?;
        Ok(out)
    }

    /// Allocating numeric evaluation: one nonzero vector per input, one per
    /// output.
    pub fn call(&self, args: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, CoreError> {
        self.call_gen(args)
    }

    /// Symbolic evaluation: the same instruction list run over scalar
    /// expression trees.
    pub fn call_sx(&self, args: &[Vec<SxElem>]) -> Result<Vec<Vec<SxElem>>, CoreError> {
        self.call_gen(args)
    }

    /// One fresh symbol per input nonzero, named `name_k` (or `name` for a
    /// single nonzero).
    pub fn sx_inputs(&self) -> Vec<Vec<SxElem>> {
        self.names_in
            .iter()
            .zip(&self.sparsity_in)
            .map(|(name, sp)| {
                if sp.nnz() == 1 {
                    vec![SxElem::sym(name.clone())]
                } else {
                    (0..sp.nnz()).map(|k| SxElem::sym(format!("{name}_{k}"))).collect()
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_allocator_best_fit() {
        let mut alloc = SlotAllocator::default();
        let a = alloc.acquire(4);
        let b = alloc.acquire(2);
        alloc.release(a);
        alloc.release(b);
        assert_eq!(alloc.acquire(2), b);
        assert_eq!(alloc.acquire(3), a);
        let c = alloc.acquire(1);
        assert_eq!(c, 2);
        assert_eq!(alloc.layout(), (vec![0, 4, 6], 7));
    }

    #[test]
    fn test_slot_allocator_grows_largest() {
        let mut alloc = SlotAllocator::default();
        let a = alloc.acquire(2);
        alloc.release(a);
        assert_eq!(alloc.acquire(5), a);
        assert_eq!(alloc.layout(), (vec![0], 5));
    }

    #[test]
    fn test_function_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Function>();
    }

    #[test]
    fn test_chain_reuses_slots() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(2, 2));
        let a = g.transpose(x).unwrap();
        let b = g.transpose(a).unwrap();
        let c = g.transpose(b).unwrap();
        let f = Function::new(&g, "f", &[x], &[c]).unwrap();
        // a and c share a slot once a is dead.
        assert_eq!(f.instructions().len(), 3);
        assert_eq!(f.sz_w(), 8);
        let out = f.call(&[vec![1.0, 2.0, 3.0, 4.0]]).unwrap();
        assert_eq!(out[0], vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_free_input_rejected() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::scalar());
        let y = g.input("y", SparsityPattern::scalar());
        let s = g.add(x, y).unwrap();
        let err = Function::new(&g, "f", &[x], &[s]).unwrap_err();
        assert_eq!(err, CoreError::FreeInput { name: "y".into() });
    }

    #[test]
    fn test_non_input_rejected() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::scalar());
        let t = g.transpose(x).unwrap();
        let err = Function::new(&g, "f", &[t], &[t]).unwrap_err();
        assert_eq!(err, CoreError::NotAnInput { index: 0 });
    }
}
