//! # Translation Unit Assembly
//!
//! [`CodeGenerator`] turns compiled [`Function`]s into one C99 source file.
//! Each function `f` becomes
//!
//! ```text
//! int f(const eg_real** arg, eg_real** res, eg_real* w);
//! eg_int f_n_in(void);
//! eg_int f_n_out(void);
//! eg_int f_sz_w(void);
//! const eg_int* f_sparsity_in(eg_int i);   (compressed column format)
//! const eg_int* f_sparsity_out(eg_int i);
//! ```
//!
//! with the same buffer convention as [`Function::eval`]: `arg[i]` holds the
//! nonzeros of input `i`, `res[i]` receives those of output `i` (a null
//! `res[i]` is skipped) and `w` has `f_sz_w()` elements. Workspace slots
//! are the ones the function was compiled with, so in-place instructions
//! write into their operand's slot.

use exprgraph_core::{Function, Src};
use log::debug;

use crate::code::CCode;
use crate::context::{is_identifier, Auxiliary, BufRef, CodegenContext, CodegenOptions, INT, REAL};
use crate::emit::emit_node;
use crate::error::CodegenError;

fn buffer(f: &Function, src: Src) -> BufRef {
    match src {
        Src::Arg(i) => BufRef::arg(i),
        Src::Slot(s) => BufRef::work(f.slot_offset(s)),
    }
}

/// Collects compiled functions into one translation unit.
#[derive(Debug)]
pub struct CodeGenerator {
    ctx: CodegenContext,
    names: Vec<String>,
    declarations: Vec<String>,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new(CodegenOptions::default())
    }
}

impl CodeGenerator {
    pub fn new(options: CodegenOptions) -> Self {
        Self {
            ctx: CodegenContext::new(options),
            names: Vec::new(),
            declarations: Vec::new(),
        }
    }

    /// Names of the functions added so far, in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Emit the kernel and query functions for `f`.
    pub fn add(&mut self, f: &Function) -> Result<(), CodegenError> {
        let name = f.name().to_string();
        if !is_identifier(&name) {
            return Err(CodegenError::InvalidName { name });
        }
        if self.names.contains(&name) {
            return Err(CodegenError::DuplicateFunction { name });
        }

        let mark = self.ctx.mark();
        let declarations = match self.emit_function(f, &name) {
            Ok(declarations) => declarations,
            Err(err) => {
                self.ctx.rollback(mark);
                return Err(err);
            }
        };

        debug!(
            "emitted kernel '{name}': {} instructions, {} outputs, sz_w = {}",
            f.instructions().len(),
            f.n_out(),
            f.sz_w()
        );
        self.names.push(name);
        self.declarations.extend(declarations);
        Ok(())
    }

    /// Kernel and queries for `f`; returns their prototypes.
    fn emit_function(&mut self, f: &Function, name: &str) -> Result<Vec<String>, CodegenError> {
        let signature = format!("int {name}(const {REAL}** arg, {REAL}** res, {REAL}* w)");
        self.ctx.comment(format!(
            "{name}: {} inputs, {} outputs, sz_w = {}",
            f.n_in(),
            f.n_out(),
            f.sz_w()
        ));
        self.ctx.line(format!("{signature} {{"));
        self.ctx.indent();
        for (k, ins) in f.instructions().iter().enumerate() {
            let res = BufRef::work(f.slot_offset(ins.res));
            let args: Vec<BufRef> = ins.args.iter().map(|&src| buffer(f, src)).collect();
            let inputs: Vec<String> = args.iter().map(BufRef::ptr).collect();
            self.ctx.comment(format!(
                "#{k}: {} = {}({}){}",
                res.ptr(),
                ins.node.op,
                inputs.join(", "),
                if ins.in_place { ", in place" } else { "" }
            ));
            emit_node(&mut self.ctx, &ins.node, &args, &[res])?;
        }
        for (i, &src) in f.output_sources().iter().enumerate() {
            self.ctx.use_aux(Auxiliary::Copy);
            self.ctx.line(format!(
                "eg_copy({}, {}, res[{i}]);",
                buffer(f, src).ptr(),
                f.nnz_out(i)
            ));
        }
        self.ctx.line("return 0;");
        self.ctx.dedent();
        self.ctx.line("}");
        self.ctx.blank();

        let mut declarations = vec![format!("{signature};")];
        let sizes = [("n_in", f.n_in()), ("n_out", f.n_out()), ("sz_w", f.sz_w())];
        for (query, value) in sizes {
            self.ctx.line(format!("{INT} {name}_{query}(void) {{ return {value}; }}"));
            declarations.push(format!("{INT} {name}_{query}(void);"));
        }
        self.ctx.blank();

        if self.ctx.options().with_sparsity {
            let inputs: Vec<_> = (0..f.n_in()).map(|i| f.sparsity_in(i).clone()).collect();
            let outputs: Vec<_> = (0..f.n_out()).map(|i| f.sparsity_out(i).clone()).collect();
            for (which, patterns) in [("in", inputs), ("out", outputs)] {
                let signature = format!("const {INT}* {name}_sparsity_{which}({INT} i)");
                self.ctx.line(format!("{signature} {{"));
                self.ctx.indent();
                self.ctx.line("switch (i) {");
                self.ctx.indent();
                for (i, sp) in patterns.iter().enumerate() {
                    let array = self.ctx.sparsity(sp);
                    self.ctx.line(format!("case {i}: return {array};"));
                }
                self.ctx.line("default: return 0;");
                self.ctx.dedent();
                self.ctx.line("}");
                self.ctx.dedent();
                self.ctx.line("}");
                self.ctx.blank();
                declarations.push(format!("{signature};"));
            }
        }
        Ok(declarations)
    }

    /// Prototypes of everything added so far.
    pub fn header(&self) -> CCode {
        let mut out = String::from("#ifndef EXPRGRAPH_GENERATED_H\n#define EXPRGRAPH_GENERATED_H\n\n");
        out.push_str(&self.ctx.preamble());
        out.push_str("\n#ifdef __cplusplus\nextern \"C\" {\n#endif\n\n");
        for decl in &self.declarations {
            out.push_str(decl);
            out.push('\n');
        }
        out.push_str("\n#ifdef __cplusplus\n}\n#endif\n\n#endif\n");
        CCode::new(out)
    }

    /// The complete translation unit.
    pub fn generate(&self) -> CCode {
        let with_header = self.ctx.options().with_header;
        let mut out = String::from("/* Generated by exprgraph-codegen */\n#include <math.h>\n\n");
        out.push_str(&self.ctx.preamble());
        out.push('\n');
        if with_header {
            out.push_str("#ifdef __cplusplus\nextern \"C\" {\n#endif\n\n");
            for decl in &self.declarations {
                out.push_str(decl);
                out.push('\n');
            }
            out.push('\n');
        }
        out.push_str(&self.ctx.definitions());
        out.push_str(self.ctx.body());
        if with_header {
            out.push_str("#ifdef __cplusplus\n}\n#endif\n");
        }
        CCode::new(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exprgraph_core::{ExprGraph, SparsityPattern};

    #[test]
    fn test_rejects_bad_names() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::scalar());
        let f = Function::new(&g, "not-c", &[x], &[x]).unwrap();
        let err = CodeGenerator::default().add(&f).unwrap_err();
        assert_eq!(
            err,
            CodegenError::InvalidName {
                name: "not-c".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_duplicates() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::scalar());
        let f = Function::new(&g, "f", &[x], &[x]).unwrap();
        let mut cg = CodeGenerator::default();
        cg.add(&f).unwrap();
        assert!(matches!(cg.add(&f), Err(CodegenError::DuplicateFunction { .. })));
        assert_eq!(cg.names(), ["f".to_string()]);
    }

    #[test]
    fn test_passthrough_copies_argument() {
        let mut g = ExprGraph::new();
        let x = g.input("x", SparsityPattern::dense(2, 1));
        let f = Function::new(&g, "ident", &[x], &[x]).unwrap();
        let mut cg = CodeGenerator::default();
        cg.add(&f).unwrap();
        let code = cg.generate();
        assert!(code.contains("eg_copy(arg[0], 2, res[0]);"));
        assert!(code.contains("static void eg_copy("));
        assert!(code.contains("eg_int ident_sz_w(void) { return 0; }"));
    }
}
