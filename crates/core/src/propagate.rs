//! # Sparsity Propagation
//!
//! Dependency bits flow through a compiled [`Function`] using the same
//! instruction list and workspace layout as numeric evaluation. Each element
//! carries a [`Bvec`]: bit `b` set means "depends on seed direction `b`", so
//! one sweep tracks 64 directions at once.
//!
//! - **Forward**: seed input bits, read output bits
//! - **Reverse**: seed output bits, read input bits. Input buffers are
//!   accumulated into and the seeds are cleared
//!
//! Both directions give the same Jacobian pattern; the cheaper one depends on
//! whether the function has fewer input or output nonzeros.

use log::debug;

use crate::error::CoreError;
use crate::function::{Function, Src};
use crate::sparsity::SparsityPattern;

/// Bit-vector element for dependency propagation.
pub type Bvec = u64;

/// Directions tracked per sweep.
pub const BVEC_BITS: usize = Bvec::BITS as usize;

impl Function {
    /// Forward dependency sweep: `res` receives, for every output element,
    /// the OR of the bits of the input elements it depends on.
    pub fn sp_forward(&self, arg: &[&[Bvec]], res: &mut [&mut [Bvec]], w: &mut [Bvec]) -> Result<(), CoreError> {
        let arg_len: Vec<usize> = arg.iter().map(|a| a.len()).collect();
        let res_len: Vec<usize> = res.iter().map(|r| r.len()).collect();
        self.check_buffers(&arg_len, &res_len, w.len())?;
        self.sweep(arg, res, w, |ins, args, out, _| {
            if ins.in_place {
                ins.node.sp_forward_in_place(args, &mut [out])
            } else {
                ins.node.sp_forward(args, &mut [out]);
                Ok(())
            }
        })
    }

    /// Reverse dependency sweep: the bits of every output element are ORed
    /// into each input element it depends on, and `res` is cleared.
    pub fn sp_reverse(
        &self,
        arg: &mut [&mut [Bvec]],
        res: &mut [&mut [Bvec]],
        w: &mut [Bvec],
    ) -> Result<(), CoreError> {
        let arg_len: Vec<usize> = arg.iter().map(|a| a.len()).collect();
        let res_len: Vec<usize> = res.iter().map(|r| r.len()).collect();
        self.check_buffers(&arg_len, &res_len, w.len())?;

        let slots = &mut w[..self.sz_slots];
        slots.fill(0);

        for (r, src) in res.iter_mut().zip(&self.output_src) {
            let dst: &mut [Bvec] = match *src {
                Src::Arg(i) => &mut arg[i][..],
                Src::Slot(s) => {
                    let o = self.slot_offset[s];
                    &mut slots[o..o + r.len()]
                }
            };
            for (d, &v) in dst.iter_mut().zip(r.iter()) {
                *d |= v;
            }
            r.fill(0);
        }

        for ins in self.instructions.iter().rev() {
            let o = self.slot_offset[ins.res];
            let nnz = ins.node.sparsity().nnz();
            let mut seed = slots[o..o + nnz].to_vec();
            let mut sens: Vec<Vec<Bvec>> = ins.node.inputs.iter().map(|sp| vec![0; sp.nnz()]).collect();
            {
                let mut sens_refs: Vec<&mut [Bvec]> = sens.iter_mut().map(Vec::as_mut_slice).collect();
                if ins.in_place {
                    ins.node
                        .sp_reverse_in_place(&mut sens_refs, &mut [seed.as_mut_slice()])?;
                } else {
                    ins.node.sp_reverse(&mut sens_refs, &mut [seed.as_mut_slice()]);
                    slots[o..o + nnz].fill(0);
                }
            }

            for (j, (src, bits)) in ins.args.iter().zip(&sens).enumerate() {
                if ins.in_place && j == 0 {
                    continue;
                }
                let dst: &mut [Bvec] = match *src {
                    Src::Arg(i) => &mut arg[i][..],
                    Src::Slot(s) => {
                        let so = self.slot_offset[s];
                        &mut slots[so..so + bits.len()]
                    }
                };
                for (d, &b) in dst.iter_mut().zip(bits) {
                    *d |= b;
                }
            }
        }
        Ok(())
    }

    fn check_io(&self, iind: usize, oind: usize) -> Result<(), CoreError> {
        if iind >= self.n_in() {
            return Err(CoreError::InvalidIndex {
                what: "input",
                index: iind,
                len: self.n_in(),
            });
        }
        if oind >= self.n_out() {
            return Err(CoreError::InvalidIndex {
                what: "output",
                index: oind,
                len: self.n_out(),
            });
        }
        Ok(())
    }

    fn zero_buffers(patterns: &[SparsityPattern]) -> Vec<Vec<Bvec>> {
        patterns.iter().map(|sp| vec![0; sp.nnz()]).collect()
    }

    /// Jacobian pattern of output `oind` with respect to input `iind`,
    /// indexed by nonzeros (`nnz_out x nnz_in`), from forward sweeps.
    pub fn jac_sparsity(&self, iind: usize, oind: usize) -> Result<SparsityPattern, CoreError> {
        self.check_io(iind, oind)?;
        let (n_in, n_out) = (self.nnz_in(iind), self.nnz_out(oind));
        let mut arg_bufs = Self::zero_buffers(&self.sparsity_in);
        let mut res_bufs = Self::zero_buffers(&self.sparsity_out);
        let mut w = vec![0; self.sz_w()];
        let mut entries = Vec::new();
        let mut sweeps = 0;

        for start in (0..n_in).step_by(BVEC_BITS) {
            let width = (n_in - start).min(BVEC_BITS);
            for (k, seed) in arg_bufs[iind].iter_mut().enumerate() {
                *seed = if k >= start && k < start + width {
                    1 << (k - start)
                } else {
                    0
                };
            }
            let arg: Vec<&[Bvec]> = arg_bufs.iter().map(Vec::as_slice).collect();
            let mut res: Vec<&mut [Bvec]> = res_bufs.iter_mut().map(Vec::as_mut_slice).collect();
            self.sp_forward(&arg, &mut res, &mut w)?;
            sweeps += 1;

            for (r, &bits) in res[oind].iter().enumerate() {
                for b in 0..width {
                    if bits >> b & 1 == 1 {
                        entries.push((r, start + b));
                    }
                }
            }
        }

        debug!(
            "jac_sparsity '{}' ({iind} -> {oind}): {} nonzeros in {sweeps} forward sweeps",
            self.name,
            entries.len()
        );
        SparsityPattern::from_triplets(n_out, n_in, &entries)
    }

    /// Same pattern as [`Function::jac_sparsity`], from reverse sweeps.
    pub fn jac_sparsity_reverse(&self, iind: usize, oind: usize) -> Result<SparsityPattern, CoreError> {
        self.check_io(iind, oind)?;
        let (n_in, n_out) = (self.nnz_in(iind), self.nnz_out(oind));
        let mut arg_bufs = Self::zero_buffers(&self.sparsity_in);
        let mut res_bufs = Self::zero_buffers(&self.sparsity_out);
        let mut w = vec![0; self.sz_w()];
        let mut entries = Vec::new();
        let mut sweeps = 0;

        for start in (0..n_out).step_by(BVEC_BITS) {
            let width = (n_out - start).min(BVEC_BITS);
            for buf in arg_bufs.iter_mut() {
                buf.fill(0);
            }
            for buf in res_bufs.iter_mut() {
                buf.fill(0);
            }
            for b in 0..width {
                res_bufs[oind][start + b] = 1 << b;
            }
            let mut arg: Vec<&mut [Bvec]> = arg_bufs.iter_mut().map(Vec::as_mut_slice).collect();
            let mut res: Vec<&mut [Bvec]> = res_bufs.iter_mut().map(Vec::as_mut_slice).collect();
            self.sp_reverse(&mut arg, &mut res, &mut w)?;
            sweeps += 1;

            for (c, &bits) in arg[iind].iter().enumerate() {
                for b in 0..width {
                    if bits >> b & 1 == 1 {
                        entries.push((start + b, c));
                    }
                }
            }
        }

        debug!(
            "jac_sparsity_reverse '{}' ({iind} -> {oind}): {} nonzeros in {sweeps} reverse sweeps",
            self.name,
            entries.len()
        );
        SparsityPattern::from_triplets(n_out, n_in, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ExprGraph;

    #[test]
    fn test_repmat_jacobian_pattern() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(1, 2));
        let r = g.horzrepmat(x, 3).unwrap();
        let f = Function::new(&g, "f", &[x], &[r]).unwrap();

        let jac = f.jac_sparsity(0, 0).unwrap();
        assert_eq!(jac.dims(), "6x2");
        assert_eq!(jac.nnz(), 6);
        for r in 0..6 {
            assert!(jac.get_nz(r, r % 2).is_some());
        }
        assert_eq!(jac, f.jac_sparsity_reverse(0, 0).unwrap());
    }

    #[test]
    fn test_reverse_clears_seeds_and_accumulates() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(1, 4));
        let s = g.horzrepsum(x, 2).unwrap();
        let f = Function::new(&g, "f", &[x], &[s]).unwrap();

        let mut adj = vec![0b1000 as Bvec; 4];
        let mut seed = vec![0b01, 0b10];
        let mut w = vec![0; f.sz_w()];
        f.sp_reverse(&mut [adj.as_mut_slice()], &mut [seed.as_mut_slice()], &mut w)
            .unwrap();
        assert_eq!(adj, vec![0b1001, 0b1010, 0b1001, 0b1010]);
        assert_eq!(seed, vec![0, 0]);
    }

    #[test]
    fn test_invalid_index() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::scalar());
        let f = Function::new(&g, "f", &[x], &[x]).unwrap();
        assert_eq!(
            f.jac_sparsity(1, 0).unwrap_err(),
            CoreError::InvalidIndex {
                what: "input",
                index: 1,
                len: 1
            }
        );
        assert!(f.jac_sparsity(0, 0).unwrap().is_dense());
    }
}
