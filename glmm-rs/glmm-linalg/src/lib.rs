//! glmm-linalg: Linear algebra wrappers for glmm-rs
//!
//! Dense and sparse matrix storage plus the Cholesky, QR and symmetric
//! eigenvalue routines used by the Laplace-approximation fitter.

pub mod decomposition;
pub mod dense;
pub mod sparse;

pub use decomposition::{CholeskyDecomp, LinalgError};
pub use dense::DenseMatrix;
pub use sparse::SparseMatrix;
