//! Error types for model construction and fitting.
//!
//! Only problems with the input surface as errors. Numerical trouble
//! during optimization is absorbed and reported as warnings on the
//! fitted model instead.

use glmm_linalg::LinalgError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Malformed model specification: {0}")]
    MalformedSpec(String),

    #[error("Column '{0}' not found in data")]
    UnknownColumn(String),

    #[error("Formula error: {0}")]
    Formula(String),

    #[error("Prior error: {0}")]
    Prior(String),

    #[error(transparent)]
    Linalg(#[from] LinalgError),

    #[error("Optimizer error: {0}")]
    Optimizer(String),
}

pub type FitResult<T> = Result<T, FitError>;
