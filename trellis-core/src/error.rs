//! Error Types
//!
//! Every fallible operation in the crate returns [`CellError`]. Formula
//! failures travel through recomputation untouched: the error the user's
//! formula produced is kept as the `source` of [`CellError::Formula`].

use thiserror::Error;

/// Boxed error produced by user formula code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CellError>;

/// Errors raised by cells and formula evaluation.
#[derive(Debug, Error)]
pub enum CellError {
    /// The operation is not available on this kind of cell.
    #[error("unsupported operation `{operation}` on formula cell")]
    Unsupported {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// The user formula failed with something other than "no value".
    #[error("formula for cell {cell} failed")]
    Formula {
        /// Label (or identity) of the cell whose formula failed.
        cell: String,
        /// The error returned by the formula.
        #[source]
        source: BoxError,
    },

    /// A formula was invoked again while its previous invocation was
    /// still running.
    #[error("formula for cell {cell} invoked while already evaluating")]
    ReentrantEvaluation {
        /// Label (or identity) of the cell.
        cell: String,
    },
}

impl CellError {
    /// Check whether this error wraps a failure of user formula code.
    pub fn is_formula_failure(&self) -> bool {
        matches!(self, CellError::Formula { .. })
    }
}
