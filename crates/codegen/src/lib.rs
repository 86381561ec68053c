//! # Codegen - C Kernels for Compiled Functions
//!
//! Emits a C99 translation unit with one pure kernel per compiled
//! [`Function`](exprgraph_core::Function). A generated kernel is a drop-in
//! replacement for [`Function::eval`](exprgraph_core::Function::eval): same
//! buffers, same workspace size, same values.
//!
//! ## Modules
//!
//! - [`context`] - Unit accumulation, buffer references and options
//! - [`emit`] - Per-node statements
//! - [`generator`] - Kernel and query function assembly
//!
//! ## Example
//!
//! ```rust
//! use exprgraph_core::{ExprGraph, Function, SparsityPattern};
//! use exprgraph_codegen::CodeGenerator;
//!
//! let mut g = ExprGraph::new();
//! let x = g.input("x", SparsityPattern::dense(1, 2));
//! let y = g.horzrepmat(x, 3).unwrap();
//! let f = Function::new(&g, "tile", &[x], &[y]).unwrap();
//!
//! let mut cg = CodeGenerator::default();
//! cg.add(&f).unwrap();
//! let code = cg.generate();
//! assert!(code.contains("int tile(const eg_real** arg, eg_real** res, eg_real* w)"));
//! ```

pub mod code;
pub mod context;
pub mod emit;
pub mod error;
pub mod generator;

pub use code::CCode;
pub use context::{BufRef, CodegenContext, CodegenOptions, Mark};
pub use emit::emit_node;
pub use error::CodegenError;
pub use generator::CodeGenerator;
