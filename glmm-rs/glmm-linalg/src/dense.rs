#![allow(clippy::needless_range_loop)]
//! Dense matrix storage backed by faer.
//!
//! Design matrices (X, Xzi, Xdisp), the random-effect Hessian and the
//! outer-parameter covariance all live in a `DenseMatrix`. Storage is
//! column-major; serialization goes through a flat column-major proxy so
//! fitted models can be written with bincode or JSON.

use faer::Mat;
use serde::{Deserialize, Serialize};

/// A dense matrix wrapper around faer's `Mat<f64>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "ColMajor", from = "ColMajor")]
pub struct DenseMatrix {
    inner: Mat<f64>,
}

/// Flat column-major image of a `DenseMatrix` used on the wire.
#[derive(Serialize, Deserialize)]
struct ColMajor {
    nrows: usize,
    ncols: usize,
    data: Vec<f64>,
}

impl From<DenseMatrix> for ColMajor {
    fn from(m: DenseMatrix) -> Self {
        ColMajor {
            nrows: m.nrows(),
            ncols: m.ncols(),
            data: m.to_col_major(),
        }
    }
}

impl From<ColMajor> for DenseMatrix {
    fn from(c: ColMajor) -> Self {
        // A truncated payload yields zeros rather than a panic.
        let n = c.nrows;
        let data = c.data;
        DenseMatrix {
            inner: Mat::from_fn(c.nrows, c.ncols, |i, j| {
                data.get(j * n + i).copied().unwrap_or(0.0)
            }),
        }
    }
}

impl DenseMatrix {
    /// Create a new dense matrix filled with zeros.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            inner: Mat::zeros(nrows, ncols),
        }
    }

    /// Build a matrix entry by entry.
    pub fn from_fn<F: FnMut(usize, usize) -> f64>(nrows: usize, ncols: usize, f: F) -> Self {
        Self {
            inner: Mat::from_fn(nrows, ncols, f),
        }
    }

    /// Create a dense matrix from row-major input.
    pub fn from_row_major(nrows: usize, ncols: usize, data: &[f64]) -> Self {
        assert_eq!(data.len(), nrows * ncols);
        let inner = Mat::from_fn(nrows, ncols, |i, j| data[i * ncols + j]);
        Self { inner }
    }

    /// Create a matrix whose columns are the given vectors.
    pub fn from_columns(nrows: usize, cols: &[Vec<f64>]) -> Self {
        for c in cols {
            assert_eq!(c.len(), nrows);
        }
        let inner = Mat::from_fn(nrows, cols.len(), |i, j| cols[j][i]);
        Self { inner }
    }

    /// Create an identity matrix of size n x n.
    pub fn identity(n: usize) -> Self {
        let inner = Mat::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 });
        Self { inner }
    }

    pub fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    /// Get element at (row, col).
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.inner.read(row, col)
    }

    /// Set element at (row, col).
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.inner.write(row, col, value);
    }

    /// Add `value` to the element at (row, col).
    pub fn add_to(&mut self, row: usize, col: usize, value: f64) {
        let v = self.inner.read(row, col);
        self.inner.write(row, col, v + value);
    }

    pub fn as_faer(&self) -> &Mat<f64> {
        &self.inner
    }

    /// Matrix-vector product: self * v.
    pub fn mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(self.ncols(), v.len());
        let n = self.nrows();
        let mut result = vec![0.0; n];
        for j in 0..self.ncols() {
            let vj = v[j];
            if vj == 0.0 {
                continue;
            }
            for i in 0..n {
                result[i] += self.inner.read(i, j) * vj;
            }
        }
        result
    }

    /// Transposed matrix-vector product: self' * v.
    pub fn t_mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(self.nrows(), v.len());
        (0..self.ncols())
            .map(|j| {
                let mut s = 0.0;
                for i in 0..self.nrows() {
                    s += self.inner.read(i, j) * v[i];
                }
                s
            })
            .collect()
    }

    /// Dot product of row `i` with `v`.
    pub fn row_dot(&self, i: usize, v: &[f64]) -> f64 {
        assert_eq!(self.ncols(), v.len());
        let mut s = 0.0;
        for j in 0..self.ncols() {
            s += self.inner.read(i, j) * v[j];
        }
        s
    }

    /// Matrix-matrix product: self * other.
    pub fn mat_mul(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.ncols(), other.nrows());
        DenseMatrix {
            inner: &self.inner * &other.inner,
        }
    }

    pub fn transpose(&self) -> DenseMatrix {
        DenseMatrix {
            inner: self.inner.transpose().to_owned(),
        }
    }

    /// Extract column as a Vec<f64>.
    pub fn col(&self, j: usize) -> Vec<f64> {
        (0..self.nrows()).map(|i| self.inner.read(i, j)).collect()
    }

    /// Extract row as a Vec<f64>.
    pub fn row(&self, i: usize) -> Vec<f64> {
        (0..self.ncols()).map(|j| self.inner.read(i, j)).collect()
    }

    /// Set an entire column from a slice.
    pub fn set_col(&mut self, j: usize, data: &[f64]) {
        assert_eq!(data.len(), self.nrows());
        for i in 0..self.nrows() {
            self.inner.write(i, j, data[i]);
        }
    }

    /// Keep only the listed rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> DenseMatrix {
        let inner = Mat::from_fn(rows.len(), self.ncols(), |i, j| self.inner.read(rows[i], j));
        DenseMatrix { inner }
    }

    /// Square sub-matrix on the index range `start..start + len`.
    pub fn block(&self, start: usize, len: usize) -> DenseMatrix {
        let inner = Mat::from_fn(len, len, |i, j| self.inner.read(start + i, start + j));
        DenseMatrix { inner }
    }

    /// Return self + lambda * I (square matrices only).
    pub fn shifted_diag(&self, lambda: f64) -> DenseMatrix {
        assert_eq!(self.nrows(), self.ncols());
        let inner = Mat::from_fn(self.nrows(), self.ncols(), |i, j| {
            let v = self.inner.read(i, j);
            if i == j {
                v + lambda
            } else {
                v
            }
        });
        DenseMatrix { inner }
    }

    /// Replace self by (self + self') / 2.
    pub fn symmetrize(&mut self) {
        let n = self.nrows();
        assert_eq!(n, self.ncols());
        for i in 0..n {
            for j in (i + 1)..n {
                let m = 0.5 * (self.inner.read(i, j) + self.inner.read(j, i));
                self.inner.write(i, j, m);
                self.inner.write(j, i, m);
            }
        }
    }

    pub fn scale(&self, s: f64) -> DenseMatrix {
        let inner = Mat::from_fn(self.nrows(), self.ncols(), |i, j| self.inner.read(i, j) * s);
        DenseMatrix { inner }
    }

    /// Diagonal of a square matrix.
    pub fn diag(&self) -> Vec<f64> {
        let n = self.nrows().min(self.ncols());
        (0..n).map(|i| self.inner.read(i, i)).collect()
    }

    /// Quadratic form u' * self * v.
    pub fn quad_form(&self, u: &[f64], v: &[f64]) -> f64 {
        assert_eq!(self.nrows(), u.len());
        assert_eq!(self.ncols(), v.len());
        let mut s = 0.0;
        for j in 0..self.ncols() {
            if v[j] == 0.0 {
                continue;
            }
            let mut col = 0.0;
            for i in 0..self.nrows() {
                col += u[i] * self.inner.read(i, j);
            }
            s += col * v[j];
        }
        s
    }

    /// Largest absolute entry.
    pub fn max_abs(&self) -> f64 {
        let mut m: f64 = 0.0;
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                m = m.max(self.inner.read(i, j).abs());
            }
        }
        m
    }

    pub fn dot(a: &[f64], b: &[f64]) -> f64 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    /// Compute X' * diag(w) * X for design matrix X and weight vector w.
    pub fn xtwx(&self, w: &[f64]) -> DenseMatrix {
        let n = self.nrows();
        let p = self.ncols();
        assert_eq!(w.len(), n);
        let mut result = DenseMatrix::zeros(p, p);
        for j in 0..p {
            for k in j..p {
                let mut s = 0.0;
                for i in 0..n {
                    s += self.inner.read(i, j) * w[i] * self.inner.read(i, k);
                }
                result.set(j, k, s);
                if j != k {
                    result.set(k, j, s);
                }
            }
        }
        result
    }

    /// Compute X' * diag(w) * v.
    pub fn xtwv(&self, w: &[f64], v: &[f64]) -> Vec<f64> {
        let n = self.nrows();
        assert_eq!(w.len(), n);
        assert_eq!(v.len(), n);
        (0..self.ncols())
            .map(|j| {
                let mut s = 0.0;
                for i in 0..n {
                    s += self.inner.read(i, j) * w[i] * v[i];
                }
                s
            })
            .collect()
    }

    /// Flat column-major copy of the entries.
    pub fn to_col_major(&self) -> Vec<f64> {
        let mut data = Vec::with_capacity(self.nrows() * self.ncols());
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                data.push(self.inner.read(i, j));
            }
        }
        data
    }
}

impl std::fmt::Display for DenseMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for i in 0..self.nrows() {
            for j in 0..self.ncols() {
                if j > 0 {
                    write!(f, "\t")?;
                }
                write!(f, "{:.6}", self.inner.read(i, j))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mat_vec_and_transpose_product() {
        let a = DenseMatrix::from_row_major(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(a.mat_vec(&[1.0, 0.0, -1.0]), vec![-2.0, -2.0]);
        assert_eq!(a.t_mat_vec(&[1.0, 1.0]), vec![5.0, 7.0, 9.0]);
        assert!((a.row_dot(1, &[1.0, 1.0, 1.0]) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_mat_mul() {
        let a = DenseMatrix::from_row_major(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = DenseMatrix::from_row_major(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let c = a.mat_mul(&b);
        assert!((c.get(0, 0) - 58.0).abs() < 1e-10);
        assert!((c.get(0, 1) - 64.0).abs() < 1e-10);
        assert!((c.get(1, 0) - 139.0).abs() < 1e-10);
        assert!((c.get(1, 1) - 154.0).abs() < 1e-10);
    }

    #[test]
    fn test_xtwx() {
        let x = DenseMatrix::from_row_major(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let result = x.xtwx(&[1.0, 2.0, 3.0]);
        // col0 = [1,0,1], col1 = [0,1,1], W = diag(1,2,3)
        assert!((result.get(0, 0) - 4.0).abs() < 1e-10);
        assert!((result.get(0, 1) - 3.0).abs() < 1e-10);
        assert!((result.get(1, 0) - 3.0).abs() < 1e-10);
        assert!((result.get(1, 1) - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_quad_form_and_shift() {
        let a = DenseMatrix::from_row_major(2, 2, &[2.0, 1.0, 1.0, 3.0]);
        assert!((a.quad_form(&[1.0, 1.0], &[1.0, 1.0]) - 7.0).abs() < 1e-12);
        let s = a.shifted_diag(0.5);
        assert_eq!(s.diag(), vec![2.5, 3.5]);
        assert_eq!(s.get(0, 1), 1.0);
    }

    #[test]
    fn test_symmetrize() {
        let mut a = DenseMatrix::from_row_major(2, 2, &[1.0, 2.0, 4.0, 1.0]);
        a.symmetrize();
        assert_eq!(a.get(0, 1), 3.0);
        assert_eq!(a.get(1, 0), 3.0);
    }

    #[test]
    fn test_serde_roundtrip_preserves_layout() {
        let a = DenseMatrix::from_row_major(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let json = serde_json::to_string(&a).unwrap();
        let b: DenseMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(b.nrows(), 2);
        assert_eq!(b.ncols(), 3);
        assert_eq!(b.to_col_major(), a.to_col_major());
    }

    #[test]
    fn test_select_rows_and_block() {
        let a = DenseMatrix::from_row_major(3, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let r = a.select_rows(&[2, 0]);
        assert_eq!(r.row(0), vec![7.0, 8.0, 9.0]);
        assert_eq!(r.row(1), vec![1.0, 2.0, 3.0]);
        let b = a.block(1, 2);
        assert_eq!(b.to_col_major(), vec![5.0, 8.0, 6.0, 9.0]);
    }
}
