//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,

    #[error("`Context` is empty")]
    EmptyContext,

    #[error("var slice length ({0}) does not match var count ({1})")]
    BadVarSlice(usize, usize),

    #[error("oracle evaluation failed: {0}")]
    Oracle(String),

    #[error("build was cancelled")]
    Cancelled,

    #[error("evaluation failed in cell [{lower:?}, {upper:?}]: {source}")]
    Cell {
        lower: [f64; 3],
        upper: [f64; 3],
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps an error with the bounds of the cell in which it was hit
    ///
    /// Only the first (outermost) cell is recorded; wrapping an
    /// already-wrapped error is a no-op.
    pub(crate) fn in_cell(self, lower: [f64; 3], upper: [f64; 3]) -> Self {
        match self {
            e @ Error::Cell { .. } => e,
            e => Error::Cell {
                lower,
                upper,
                source: Box::new(e),
            },
        }
    }
}
