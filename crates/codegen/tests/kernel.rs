//! Generated C source for compiled functions.

use approx::assert_relative_eq;
use exprgraph_codegen::{CodeGenerator, CodegenError, CodegenOptions};
use exprgraph_core::{ExprGraph, Function, Reduction, SparsityPattern};
use exprgraph_diff::gradient;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Statements of kernel `name`, without comments and the final return.
fn kernel_statements<'a>(code: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("int {name}(const eg_real** arg, eg_real** res, eg_real* w) {{");
    code.lines()
        .skip_while(|line| *line != open)
        .skip(1)
        .take_while(|line| *line != "}")
        .map(str::trim)
        .filter(|line| !line.starts_with("/*") && *line != "return 0;")
        .collect()
}

fn operand(text: &str, args: &[Vec<f64>], w: &[f64]) -> f64 {
    if let Some(rest) = text.strip_prefix("arg[") {
        let (i, k) = rest.strip_suffix(']').unwrap().split_once("][").unwrap();
        args[i.parse::<usize>().unwrap()][k.parse::<usize>().unwrap()]
    } else if let Some(k) = text.strip_prefix("w[") {
        w[k.strip_suffix(']').unwrap().parse::<usize>().unwrap()]
    } else {
        text.parse().unwrap()
    }
}

/// Run a kernel made of straight-line `=`, `+=` and `eg_copy` statements.
fn run_kernel(statements: &[&str], args: &[Vec<f64>], sz_w: usize, n_out: usize) -> Vec<Vec<f64>> {
    let mut w = vec![f64::NAN; sz_w];
    let mut res = vec![Vec::new(); n_out];
    for stmt in statements {
        let stmt = stmt.strip_suffix(';').unwrap();
        if let Some(call) = stmt.strip_prefix("eg_copy(") {
            let parts: Vec<&str> = call.strip_suffix(')').unwrap().split(", ").collect();
            let n: usize = parts[1].parse().unwrap();
            let src: Vec<f64> = match parts[0].strip_prefix("arg[") {
                Some(i) => args[i.strip_suffix(']').unwrap().parse::<usize>().unwrap()][..n].to_vec(),
                None => {
                    let offset = parts[0].strip_prefix("w+").map_or(0, |o| o.parse().unwrap());
                    w[offset..offset + n].to_vec()
                }
            };
            let i: usize = parts[2]
                .strip_prefix("res[")
                .and_then(|i| i.strip_suffix(']'))
                .unwrap()
                .parse()
                .unwrap();
            res[i] = src;
            continue;
        }
        let (lhs, op, rhs) = match stmt.split_once(" += ") {
            Some((lhs, rhs)) => (lhs, "+=", rhs),
            None => {
                let (lhs, rhs) = stmt.split_once(" = ").unwrap_or_else(|| panic!("unexpected statement: {stmt}"));
                (lhs, "=", rhs)
            }
        };
        let k: usize = lhs.strip_prefix("w[").unwrap().strip_suffix(']').unwrap().parse().unwrap();
        let value: f64 = rhs
            .split(" + ")
            .map(|term| term.split('*').map(|f| operand(f, args, &w)).product::<f64>())
            .sum();
        if op == "+=" {
            w[k] += value;
        } else {
            w[k] = value;
        }
    }
    res
}

fn tile() -> Function {
    let mut g = ExprGraph::new();
    let x = g.input("x", SparsityPattern::dense(1, 2));
    let y = g.horzrepmat(x, 3).unwrap();
    Function::new(&g, "tile", &[x], &[y]).unwrap()
}

// ============================================================================
// Kernels
// ============================================================================

#[test]
fn test_repmat_kernel() {
    init_logger();
    let mut cg = CodeGenerator::default();
    cg.add(&tile()).unwrap();
    let code = cg.generate();

    assert!(code.contains("int tile(const eg_real** arg, eg_real** res, eg_real* w) {"));
    assert!(code.contains("  for (eg_int i = 0; i < 3; ++i) {\n    w[0+2*i] = arg[0][0];\n    w[1+2*i] = arg[0][1];\n  }"));
    assert!(code.contains("  eg_copy(w, 6, res[0]);\n  return 0;\n}"));
    assert!(code.contains("#include <math.h>"));
}

#[test]
fn test_rank1_chain_updates_in_place() {
    let mut g = ExprGraph::new();
    let a = g.input("A", SparsityPattern::dense(2, 2));
    let alpha = g.input("alpha", SparsityPattern::scalar());
    let x = g.input("x", SparsityPattern::dense_column(2));
    let y = g.input("y", SparsityPattern::dense_column(2));
    let r1 = g.rank1(a, alpha, x, y).unwrap();
    let r2 = g.rank1(r1, alpha, x, y).unwrap();
    let f = Function::new(&g, "update", &[a, alpha, x, y], &[r2]).unwrap();
    assert!(f.instructions()[1].in_place);

    let mut cg = CodeGenerator::default();
    cg.add(&f).unwrap();
    let code = cg.generate();

    // First update copies A, the second accumulates into the same slot.
    assert!(code.contains("w[0] = arg[0][0] + arg[1][0]*arg[2][0]*arg[3][0];"));
    assert!(code.contains("w[0] += arg[1][0]*arg[2][0]*arg[3][0];"));
    assert!(code.contains("w[3] += arg[1][0]*arg[2][1]*arg[3][1];"));
    assert!(code.contains(", in place */"));
    assert!(code.contains("eg_int update_sz_w(void) { return 4; }"));
}

#[test]
fn test_rank1_chain_kernel_matches_call() {
    init_logger();
    let mut g = ExprGraph::new();
    let a = g.input("A", SparsityPattern::dense(2, 2));
    let alpha = g.input("alpha", SparsityPattern::scalar());
    let x = g.input("x", SparsityPattern::dense_column(2));
    let y = g.input("y", SparsityPattern::dense_column(2));
    let r1 = g.rank1(a, alpha, x, y).unwrap();
    let r2 = g.rank1(r1, alpha, x, y).unwrap();
    let f = Function::new(&g, "update", &[a, alpha, x, y], &[r2]).unwrap();

    let mut cg = CodeGenerator::default();
    cg.add(&f).unwrap();
    let code = cg.generate();
    let statements = kernel_statements(code.as_str(), "update");

    // Each slot entry is assigned once, then updated once by the second rank-1 term.
    for k in 0..4 {
        let set = format!("w[{k}] = ");
        let update = format!("w[{k}] += ");
        assert_eq!(statements.iter().filter(|s| s.starts_with(&set)).count(), 1, "{set}");
        assert_eq!(statements.iter().filter(|s| s.starts_with(&update)).count(), 1, "{update}");
    }
    assert_eq!(statements.iter().filter(|s| s.starts_with("eg_copy(")).count(), 1);
    assert_eq!(statements.last(), Some(&"eg_copy(w, 4, res[0]);"));

    let args = vec![vec![1.0, 2.0, 3.0, 4.0], vec![0.5], vec![1.0, -2.0], vec![3.0, 0.25]];
    let expected = f.call(&args).unwrap();
    let out = run_kernel(&statements, &args, f.sz_w(), f.n_out());
    assert_eq!(out[0].len(), expected[0].len());
    for (got, want) in out[0].iter().zip(&expected[0]) {
        assert_relative_eq!(*got, *want, epsilon = 1e-12);
    }
}

#[test]
fn test_max_repsum_kernel() {
    let mut g = ExprGraph::new();
    let x = g.input("x", SparsityPattern::dense(1, 4));
    let s = g.horzrepsum_with(x, 2, Reduction::Max).unwrap();
    let f = Function::new(&g, "peak", &[x], &[s]).unwrap();

    let mut cg = CodeGenerator::default();
    cg.add(&f).unwrap();
    let code = cg.generate();
    assert!(code.contains("w[0] = fmax(arg[0][0], arg[0][2]);"));
    assert!(code.contains("w[1] = fmax(arg[0][1], arg[0][3]);"));
}

#[test]
fn test_gradient_kernel() {
    let mut g = ExprGraph::new();
    let x = g.input("x", SparsityPattern::dense(1, 2));
    let r = g.horzrepmat(x, 2).unwrap();
    let phi = g.dot(r, r).unwrap();
    let grad = gradient(&mut g, &[x], phi).unwrap();
    let f = Function::new(&g, "phi", &[x], &[phi]).unwrap();
    let df = Function::new(&g, "phi_grad", &[x], &grad).unwrap();

    let mut cg = CodeGenerator::default();
    cg.add(&f).unwrap();
    cg.add(&df).unwrap();
    assert_eq!(cg.names(), ["phi".to_string(), "phi_grad".to_string()]);

    let code = cg.generate();
    assert!(code.contains("int phi_grad(const eg_real** arg, eg_real** res, eg_real* w) {"));
    assert!(code.contains(&format!("eg_int phi_grad_sz_w(void) {{ return {}; }}", df.sz_w())));
    // One copy helper for the whole unit.
    assert_eq!(code.as_str().matches("static void eg_copy(").count(), 1);
}

// ============================================================================
// Sparsity and queries
// ============================================================================

#[test]
fn test_sparsity_queries() {
    let mut cg = CodeGenerator::default();
    cg.add(&tile()).unwrap();
    let code = cg.generate();

    assert!(code.contains("static const eg_int eg_s0[7] = {1, 2, 0, 1, 2, 0, 0};"));
    assert!(code.contains("static const eg_int eg_s1[15] = {1, 6, 0, 1, 2, 3, 4, 5, 6, 0, 0, 0, 0, 0, 0};"));
    assert!(code.contains("const eg_int* tile_sparsity_in(eg_int i) {"));
    assert!(code.contains("    case 0: return eg_s0;"));
    assert!(code.contains("eg_int tile_n_in(void) { return 1; }"));
    assert!(code.contains("eg_int tile_n_out(void) { return 1; }"));
}

#[test]
fn test_sparsity_arrays_shared_between_functions() {
    let mut g = ExprGraph::new();
    let x = g.input("x", SparsityPattern::dense(1, 2));
    let y = g.horzrepmat(x, 2).unwrap();
    let t = g.transpose(x).unwrap();
    let f = Function::new(&g, "f", &[x], &[y]).unwrap();
    let h = Function::new(&g, "h", &[x], &[t]).unwrap();

    let mut cg = CodeGenerator::default();
    cg.add(&f).unwrap();
    cg.add(&h).unwrap();
    let code = cg.generate();
    assert_eq!(code.as_str().matches("= {1, 2, 0, 1, 2, 0, 0};").count(), 1);
}

// ============================================================================
// Options
// ============================================================================

#[test]
fn test_options_trim_output() {
    let options = CodegenOptions {
        real_type: "float".to_string(),
        int_type: "int".to_string(),
        with_header: false,
        with_sparsity: false,
        with_comments: false,
    };
    let mut cg = CodeGenerator::new(options);
    cg.add(&tile()).unwrap();
    let code = cg.generate();

    assert!(code.contains("typedef float eg_real;"));
    assert!(code.contains("typedef int eg_int;"));
    assert!(!code.contains("__cplusplus"));
    assert!(!code.contains("_sparsity_in"));
    assert!(!code.contains("#0:"));
    assert!(!code.contains("int tile(const eg_real** arg, eg_real** res, eg_real* w);"));
}

#[test]
fn test_header_lists_prototypes() {
    let mut cg = CodeGenerator::default();
    cg.add(&tile()).unwrap();
    let header = cg.header();
    assert!(header.contains("#ifndef EXPRGRAPH_GENERATED_H"));
    assert!(header.contains("int tile(const eg_real** arg, eg_real** res, eg_real* w);"));
    assert!(header.contains("const eg_int* tile_sparsity_out(eg_int i);"));
    assert!(header.contains("typedef long long int eg_int;"));
}

#[test]
fn test_invalid_name() {
    let mut g = ExprGraph::new();
    let x = g.input("x", SparsityPattern::scalar());
    let f = Function::new(&g, "2x", &[x], &[x]).unwrap();
    let err = CodeGenerator::default().add(&f).unwrap_err();
    assert!(matches!(err, CodegenError::InvalidName { .. }));
}
