#![allow(clippy::needless_range_loop)]
//! Matrix decompositions and solvers.
//!
//! Cholesky is the workhorse: the damped Newton step of the Laplace
//! inner loop, the log-determinant correction and the outer-parameter
//! covariance all go through it. QR is used only to detect
//! rank-deficient design matrices before a fit starts.

use crate::dense::DenseMatrix;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinalgError {
    #[error("Matrix is not positive definite (pivot {pivot} = {value:.3e})")]
    NotPositiveDefinite { pivot: usize, value: f64 },

    #[error("Singular matrix encountered at column {column}")]
    SingularMatrix { column: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Lower-triangular Cholesky factor L with A = L * L'.
#[derive(Debug, Clone)]
pub struct CholeskyDecomp {
    pub l: DenseMatrix,
}

impl CholeskyDecomp {
    /// Factor a symmetric positive definite matrix. Only the lower
    /// triangle of `a` is read.
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(LinalgError::DimensionMismatch {
                expected: n,
                got: a.ncols(),
            });
        }
        let mut l = DenseMatrix::zeros(n, n);

        for j in 0..n {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l.get(j, k) * l.get(j, k);
            }
            let diag = a.get(j, j) - sum;
            if !(diag > 0.0) || !diag.is_finite() {
                return Err(LinalgError::NotPositiveDefinite {
                    pivot: j,
                    value: diag,
                });
            }
            let ljj = diag.sqrt();
            l.set(j, j, ljj);

            for i in (j + 1)..n {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l.get(i, k) * l.get(j, k);
                }
                l.set(i, j, (a.get(i, j) - sum) / ljj);
            }
        }

        Ok(CholeskyDecomp { l })
    }

    pub fn dim(&self) -> usize {
        self.l.nrows()
    }

    /// log|A| = 2 * sum(log L_jj).
    pub fn log_det(&self) -> f64 {
        2.0 * self.l.diag().iter().map(|d| d.ln()).sum::<f64>()
    }

    /// Solve L * y = b.
    pub fn forward(&self, b: &[f64]) -> Vec<f64> {
        let n = self.dim();
        assert_eq!(b.len(), n);
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..i {
                sum += self.l.get(i, j) * y[j];
            }
            y[i] = (b[i] - sum) / self.l.get(i, i);
        }
        y
    }

    /// Solve L * L' * x = b.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.dim();
        let y = self.forward(b);
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..n {
                sum += self.l.get(j, i) * x[j];
            }
            x[i] = (y[i] - sum) / self.l.get(i, i);
        }
        x
    }

    /// A^{-1} = (L L')^{-1}.
    pub fn inverse(&self) -> DenseMatrix {
        let n = self.dim();
        let mut inv = DenseMatrix::zeros(n, n);
        let mut e = vec![0.0; n];
        for j in 0..n {
            e[j] = 1.0;
            let col = self.solve(&e);
            inv.set_col(j, &col);
            e[j] = 0.0;
        }
        inv.symmetrize();
        inv
    }
}

/// Thin QR decomposition A = Q * R by modified Gram-Schmidt.
pub struct QrDecomp {
    pub q: DenseMatrix,
    pub r: DenseMatrix,
}

impl QrDecomp {
    /// Fails with `SingularMatrix` when a column is (numerically) a linear
    /// combination of the preceding ones. The tolerance is relative to the
    /// column's own norm.
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        let m = a.nrows();
        let n = a.ncols();
        if m < n {
            return Err(LinalgError::DimensionMismatch {
                expected: n,
                got: m,
            });
        }

        let mut q = DenseMatrix::zeros(m, n);
        let mut r = DenseMatrix::zeros(n, n);
        let mut cols: Vec<Vec<f64>> = (0..n).map(|j| a.col(j)).collect();

        for j in 0..n {
            let original_norm = DenseMatrix::dot(&cols[j], &cols[j]).sqrt();
            for i in 0..j {
                let q_col = q.col(i);
                let rij = DenseMatrix::dot(&q_col, &cols[j]);
                r.set(i, j, rij);
                for k in 0..m {
                    cols[j][k] -= rij * q_col[k];
                }
            }

            let norm = DenseMatrix::dot(&cols[j], &cols[j]).sqrt();
            if norm <= 1e-10 * original_norm.max(1e-300) || norm < 1e-14 {
                return Err(LinalgError::SingularMatrix { column: j });
            }
            r.set(j, j, norm);
            for k in 0..m {
                q.set(k, j, cols[j][k] / norm);
            }
        }

        Ok(QrDecomp { q, r })
    }

    /// Least-squares solve: R * x = Q' * b.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.r.nrows();
        let qtb = self.q.t_mat_vec(b);
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..n {
                sum += self.r.get(i, j) * x[j];
            }
            x[i] = (qtb[i] - sum) / self.r.get(i, i);
        }
        x
    }
}

/// Eigenvalues of a symmetric matrix in descending order.
pub fn symmetric_eigenvalues(a: &DenseMatrix) -> Result<Vec<f64>, LinalgError> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(LinalgError::DimensionMismatch {
            expected: n,
            got: a.ncols(),
        });
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let eig = a.as_faer().selfadjoint_eigendecomposition(faer::Side::Lower);
    let s = eig.s();
    let mut evals: Vec<f64> = (0..n).map(|i| s.column_vector().read(i)).collect();
    evals.sort_by(|a, b| b.total_cmp(a));
    Ok(evals)
}

/// Solve a symmetric positive definite system A*x = b.
pub fn solve_spd(a: &DenseMatrix, b: &[f64]) -> Result<Vec<f64>, LinalgError> {
    Ok(CholeskyDecomp::new(a)?.solve(b))
}

/// Inverse of a symmetric positive definite matrix.
pub fn inverse_spd(a: &DenseMatrix) -> Result<DenseMatrix, LinalgError> {
    Ok(CholeskyDecomp::new(a)?.inverse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cholesky_factor() {
        let a = DenseMatrix::from_row_major(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let chol = CholeskyDecomp::new(&a).unwrap();
        assert!((chol.l.get(0, 0) - 2.0).abs() < 1e-10);
        assert!((chol.l.get(1, 0) - 1.0).abs() < 1e-10);
        assert!((chol.l.get(1, 1) - 2.0f64.sqrt()).abs() < 1e-10);
        // |A| = 8
        assert!((chol.log_det() - 8.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_cholesky_solve() {
        let a = DenseMatrix::from_row_major(3, 3, &[4.0, 2.0, 1.0, 2.0, 5.0, 3.0, 1.0, 3.0, 6.0]);
        let b = vec![1.0, 2.0, 3.0];
        let x = CholeskyDecomp::new(&a).unwrap().solve(&b);
        let ax = a.mat_vec(&x);
        for i in 0..3 {
            assert!((ax[i] - b[i]).abs() < 1e-10, "ax[{}]={} != b[{}]={}", i, ax[i], i, b[i]);
        }
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = DenseMatrix::from_row_major(2, 2, &[1.0, 3.0, 3.0, 1.0]);
        match CholeskyDecomp::new(&a) {
            Err(LinalgError::NotPositiveDefinite { pivot, .. }) => assert_eq!(pivot, 1),
            other => panic!("expected NotPositiveDefinite, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_qr_solve_normal_equations() {
        let a = DenseMatrix::from_row_major(3, 2, &[1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let b = vec![1.0, 2.0, 2.0];
        let x = QrDecomp::new(&a).unwrap().solve(&b);
        let ata = a.transpose().mat_mul(&a);
        let atb = a.t_mat_vec(&b);
        let atax = ata.mat_vec(&x);
        for i in 0..2 {
            assert!((atax[i] - atb[i]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_qr_detects_collinear_columns() {
        // Third column = first + second.
        let a = DenseMatrix::from_row_major(
            4,
            3,
            &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 2.0, 3.0, 1.0, 3.0, 4.0],
        );
        match QrDecomp::new(&a) {
            Err(LinalgError::SingularMatrix { column }) => assert_eq!(column, 2),
            _ => panic!("collinear design not detected"),
        }
    }

    #[test]
    fn test_eigenvalues() {
        let a = DenseMatrix::from_row_major(2, 2, &[3.0, 1.0, 1.0, 3.0]);
        let evals = symmetric_eigenvalues(&a).unwrap();
        assert!((evals[0] - 4.0).abs() < 1e-10);
        assert!((evals[1] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_inverse_spd() {
        let a = DenseMatrix::from_row_major(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let inv = inverse_spd(&a).unwrap();
        let prod = a.mat_mul(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((prod.get(i, j) - expected).abs() < 1e-10);
            }
        }
    }
}
