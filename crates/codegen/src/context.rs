//! # Emission Context
//!
//! [`CodegenContext`] accumulates one translation unit: the function bodies,
//! the static integer arrays they reference (deduplicated by content) and
//! the auxiliary helpers they call. [`BufRef`] names a position in one of
//! the kernel's buffers.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use exprgraph_core::SparsityPattern;

/// Type alias for real numbers in the emitted source.
pub const REAL: &str = "eg_real";
/// Type alias for integers in the emitted source.
pub const INT: &str = "eg_int";

/// Options controlling the emitted C source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenOptions {
    /// C type behind `eg_real`
    pub real_type: String,
    /// C type behind `eg_int`
    pub int_type: String,
    /// Prototypes and `extern "C"` guards at the top of the unit
    pub with_header: bool,
    /// `name_sparsity_in` / `name_sparsity_out` and their static arrays
    pub with_sparsity: bool,
    /// One comment per instruction naming the node
    pub with_comments: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            real_type: "double".to_string(),
            int_type: "long long int".to_string(),
            with_header: true,
            with_sparsity: true,
            with_comments: true,
        }
    }
}

/// Helper functions emitted once per unit, on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Auxiliary {
    /// `eg_copy(x, n, y)`: `y[0..n] = x[0..n]`
    Copy,
}

impl Auxiliary {
    fn source(self) -> String {
        match self {
            Auxiliary::Copy => format!(
                "static void eg_copy(const {REAL}* x, {INT} n, {REAL}* y) {{\n  \
                 {INT} i;\n  \
                 if (y) {{\n    \
                 if (x) {{\n      \
                 for (i = 0; i < n; ++i) *y++ = *x++;\n    \
                 }} else {{\n      \
                 for (i = 0; i < n; ++i) *y++ = 0.;\n    \
                 }}\n  \
                 }}\n\
                 }}\n"
            ),
        }
    }
}

/// A buffer position: `base[offset + k]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufRef {
    base: String,
    offset: usize,
}

impl BufRef {
    /// Input buffer `arg[i]`.
    pub fn arg(i: usize) -> Self {
        Self {
            base: format!("arg[{i}]"),
            offset: 0,
        }
    }

    /// Output buffer `res[i]`.
    pub fn res(i: usize) -> Self {
        Self {
            base: format!("res[{i}]"),
            offset: 0,
        }
    }

    /// Workspace starting at `w + offset`.
    pub fn work(offset: usize) -> Self {
        Self {
            base: "w".to_string(),
            offset,
        }
    }

    /// Element `k`.
    pub fn at(&self, k: usize) -> String {
        format!("{}[{}]", self.base, self.offset + k)
    }

    /// Element `k + stride * var`, for loops.
    pub fn at_strided(&self, k: usize, stride: usize, var: &str) -> String {
        format!("{}[{}+{}*{}]", self.base, self.offset + k, stride, var)
    }

    /// The buffer start as a pointer expression.
    pub fn ptr(&self) -> String {
        if self.offset == 0 {
            self.base.clone()
        } else {
            format!("{}+{}", self.base, self.offset)
        }
    }
}

/// A point in a [`CodegenContext`] that can be restored.
#[derive(Debug, Clone)]
pub struct Mark {
    body: usize,
    indent: usize,
    arrays: usize,
    aux: BTreeSet<Auxiliary>,
}

/// Accumulates the body of a translation unit.
#[derive(Debug, Default)]
pub struct CodegenContext {
    options: CodegenOptions,
    body: String,
    indent: usize,
    arrays: Vec<(String, Vec<usize>)>,
    array_index: HashMap<Vec<usize>, usize>,
    aux: BTreeSet<Auxiliary>,
}

impl CodegenContext {
    pub fn new(options: CodegenOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    /// Append one line at the current indentation.
    pub fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.body.push_str("  ");
        }
        self.body.push_str(text.as_ref());
        self.body.push('\n');
    }

    pub fn blank(&mut self) {
        self.body.push('\n');
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn dedent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    /// A `/* ... */` line, if comments are enabled.
    pub fn comment(&mut self, text: impl AsRef<str>) {
        if self.options.with_comments {
            let text = text.as_ref().replace("*/", "* /");
            self.line(format!("/* {text} */"));
        }
    }

    /// Name of a static integer array holding `data`, shared between equal
    /// arrays.
    pub fn int_array(&mut self, data: &[usize]) -> String {
        if let Some(&i) = self.array_index.get(data) {
            return self.arrays[i].0.clone();
        }
        let name = format!("eg_s{}", self.arrays.len());
        self.array_index.insert(data.to_vec(), self.arrays.len());
        self.arrays.push((name.clone(), data.to_vec()));
        name
    }

    /// Static array with the compressed form of `sp`.
    pub fn sparsity(&mut self, sp: &SparsityPattern) -> String {
        self.int_array(&sp.compressed())
    }

    pub fn use_aux(&mut self, aux: Auxiliary) {
        self.aux.insert(aux);
    }

    pub fn mark(&self) -> Mark {
        Mark {
            body: self.body.len(),
            indent: self.indent,
            arrays: self.arrays.len(),
            aux: self.aux.clone(),
        }
    }

    /// Drop everything emitted since `mark`.
    pub fn rollback(&mut self, mark: Mark) {
        self.body.truncate(mark.body);
        self.indent = mark.indent;
        self.arrays.truncate(mark.arrays);
        self.array_index.retain(|_, i| *i < mark.arrays);
        self.aux = mark.aux;
    }

    /// Number of distinct static arrays so far.
    pub fn num_arrays(&self) -> usize {
        self.arrays.len()
    }

    /// Type aliases for the configured C types.
    pub fn preamble(&self) -> String {
        format!(
            "typedef {} {REAL};\ntypedef {} {INT};\n",
            self.options.real_type, self.options.int_type
        )
    }

    /// Auxiliary helpers and static arrays referenced by the body.
    pub fn definitions(&self) -> String {
        let mut out = String::new();
        for aux in &self.aux {
            out.push_str(&aux.source());
            out.push('\n');
        }
        for (name, data) in &self.arrays {
            let values: Vec<String> = data.iter().map(usize::to_string).collect();
            let _ = writeln!(
                out,
                "static const {INT} {name}[{}] = {{{}}};",
                data.len(),
                values.join(", ")
            );
        }
        if !self.arrays.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Preamble, definitions, then the body.
    pub fn assemble(&self) -> String {
        format!("{}\n{}{}", self.preamble(), self.definitions(), self.body)
    }
}

/// C literal for a real constant.
pub fn literal(v: f64) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v == f64::INFINITY {
        "INFINITY".to_string()
    } else if v == f64::NEG_INFINITY {
        "-INFINITY".to_string()
    } else {
        format!("{v:?}")
    }
}

/// True if `name` is a valid C identifier.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
