//! Property tests for structural sparsity.
//!
//! A Jacobian pattern is sound if every output element that actually moves
//! when one input element is perturbed is marked as depending on it. The
//! forward and reverse sweeps must also agree exactly.

use exprgraph_core::{ExprGraph, ExprId, Function, SparsityPattern};
use proptest::prelude::*;

fn pattern(nrow: usize, ncol: usize) -> impl Strategy<Value = SparsityPattern> {
    prop::collection::vec(any::<bool>(), nrow * ncol).prop_map(move |mask| {
        let entries: Vec<(usize, usize)> = mask
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(k, _)| (k % nrow, k / nrow))
            .collect();
        SparsityPattern::from_triplets(nrow, ncol, &entries).unwrap()
    })
}

fn values_for(f: &Function, seed: u64) -> Vec<Vec<f64>> {
    (0..f.n_in())
        .map(|i| {
            (0..f.nnz_in(i))
                .map(|k| 0.5 + ((seed as usize + 7 * i + 3 * k) % 11) as f64 / 8.0)
                .collect()
        })
        .collect()
}

/// Perturb every input nonzero and check the observed changes against the
/// detected pattern.
fn check_sound(f: &Function, seed: u64) -> Result<(), TestCaseError> {
    let base = values_for(f, seed);
    let out0 = f.call(&base).unwrap();
    for i in 0..f.n_in() {
        for o in 0..f.n_out() {
            let fwd = f.jac_sparsity(i, o).unwrap();
            let rev = f.jac_sparsity_reverse(i, o).unwrap();
            prop_assert_eq!(&fwd, &rev);

            for k in 0..f.nnz_in(i) {
                let mut probe = base.clone();
                probe[i][k] += 1.0;
                let out1 = f.call(&probe).unwrap();
                for (r, (a, b)) in out0[o].iter().zip(&out1[o]).enumerate() {
                    if a != b {
                        prop_assert!(
                            fwd.get_nz(r, k).is_some(),
                            "output nz {} moved with input {} nz {} but is not in the pattern",
                            r,
                            i,
                            k
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn rank1_case() -> impl Strategy<Value = (SparsityPattern, SparsityPattern, SparsityPattern)> {
    (1usize..4, 1usize..4).prop_flat_map(|(m, n)| (pattern(m, n), pattern(m, 1), pattern(n, 1)))
}

fn replicate_case() -> impl Strategy<Value = (SparsityPattern, usize)> {
    (1usize..3, 1usize..3, 1usize..4).prop_flat_map(|(m, w, n)| (pattern(m, w * n), Just(n)))
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

    #[test]
    fn rank1_pattern_is_sound((a_sp, x_sp, y_sp) in rank1_case(), seed in 0u64..100) {
        let mut g = ExprGraph::new();
        let a = g.input("A", a_sp.clone());
        let alpha = g.input("alpha", SparsityPattern::scalar());
        let x = g.input("x", x_sp.clone());
        let y = g.input("y", y_sp.clone());
        let r = g.rank1(a, alpha, x, y).unwrap();

        let expected = a_sp.union(&SparsityPattern::outer(&x_sp, &y_sp));
        prop_assert_eq!(g.sparsity(r).unwrap(), &expected);

        let f = Function::new(&g, "f", &[a, alpha, x, y], &[r]).unwrap();
        check_sound(&f, seed)?;
    }

    #[test]
    fn replication_chain_is_sound((x_sp, n) in replicate_case(), k in 1usize..3, seed in 0u64..100) {
        let mut g = ExprGraph::new();
        let x = g.input("x", x_sp.clone());
        let s = g.horzrepsum(x, n).unwrap();
        let r = g.horzrepmat(s, k).unwrap();
        let t = g.transpose(r).unwrap();
        let f = Function::new(&g, "f", &[x], &[s, t]).unwrap();

        prop_assert_eq!(g.sparsity(r).unwrap().nnz(), k * g.sparsity(s).unwrap().nnz());
        check_sound(&f, seed)?;
    }

    #[test]
    fn in_place_chain_is_sound((a_sp, x_sp, y_sp) in rank1_case(), seed in 0u64..100) {
        // The second update may run in the first one's buffer.
        let mut g = ExprGraph::new();
        let a = g.input("A", a_sp);
        let alpha = g.input("alpha", SparsityPattern::scalar());
        let x = g.input("x", x_sp);
        let y = g.input("y", y_sp);
        let r1 = g.rank1(a, alpha, x, y).unwrap();
        let r2 = g.rank1(r1, alpha, x, y).unwrap();
        let f = Function::new(&g, "f", &[a, alpha, x, y], &[r2]).unwrap();

        prop_assert!(f.instructions().iter().any(|i| i.in_place));
        check_sound(&f, seed)?;
    }

    #[test]
    fn construction_is_idempotent((x_sp, n) in replicate_case()) {
        let mut g = ExprGraph::new();
        let x = g.input("x", x_sp);
        let build = |g: &mut ExprGraph| -> ExprId {
            let s = g.horzrepsum(x, n).unwrap();
            g.horzrepmat(s, n).unwrap()
        };
        let first = build(&mut g);
        let len = g.len();
        let second = build(&mut g);
        prop_assert_eq!(first, second);
        prop_assert_eq!(g.len(), len);
    }
}
