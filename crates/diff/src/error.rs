//! Error types for differentiation and derivative checking.

use exprgraph_core::CoreError;
use thiserror::Error;

/// Errors from the differentiation sweeps.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DiffError {
    /// Building a derivative node failed, or a variant has no rule.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A seed direction does not have one entry per seeded node.
    #[error("Seed direction {direction} has {got} entries, expected {expected}")]
    SeedArity {
        direction: usize,
        expected: usize,
        got: usize,
    },

    /// Computed and reference derivatives disagree.
    #[error(transparent)]
    Mismatch(#[from] GradCheckError),
}

/// First element where a derivative check failed.
#[derive(Debug, Error, Clone, PartialEq)]
#[error(
    "Derivative mismatch at {what}[{index}][{elem}]: analytical={analytical}, reference={reference}, diff={diff}"
)]
pub struct GradCheckError {
    /// Which quantity was compared (`"jvp"`, `"dot product"`)
    pub what: &'static str,
    pub index: usize,
    pub elem: usize,
    pub analytical: f64,
    pub reference: f64,
    pub diff: f64,
}
