use exprgraph_core::CoreError;
use thiserror::Error;

/// Errors raised while assembling a C translation unit.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodegenError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Function names become C identifiers.
    #[error("'{name}' is not a valid C identifier")]
    InvalidName { name: String },

    #[error("Function '{name}' was already added")]
    DuplicateFunction { name: String },
}
