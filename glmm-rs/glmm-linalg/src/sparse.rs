#![allow(clippy::needless_range_loop)]
//! Sparse matrices backed by sprs.
//!
//! Random-effect design matrices Z (n x q) are stored in CSR form: each
//! observation row touches only the d columns of its own grouping level
//! for each term, so rows are short and row iteration is the hot path.

use serde::{Deserialize, Serialize};
use sprs::{CsMatI, TriMat};

/// A sparse matrix wrapper around sprs CSR format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "Triplets", from = "Triplets")]
pub struct SparseMatrix {
    inner: CsMatI<f64, usize>,
    nrows: usize,
    ncols: usize,
}

/// Coordinate-form image of a `SparseMatrix` used on the wire.
#[derive(Serialize, Deserialize)]
struct Triplets {
    nrows: usize,
    ncols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
}

impl From<SparseMatrix> for Triplets {
    fn from(m: SparseMatrix) -> Self {
        let mut rows = Vec::with_capacity(m.nnz());
        let mut cols = Vec::with_capacity(m.nnz());
        let mut vals = Vec::with_capacity(m.nnz());
        for i in 0..m.nrows {
            let (idx, data) = m.row(i);
            for (&j, &v) in idx.iter().zip(data.iter()) {
                rows.push(i);
                cols.push(j);
                vals.push(v);
            }
        }
        Triplets {
            nrows: m.nrows,
            ncols: m.ncols,
            rows,
            cols,
            vals,
        }
    }
}

impl From<Triplets> for SparseMatrix {
    fn from(t: Triplets) -> Self {
        let k = t.rows.len().min(t.cols.len()).min(t.vals.len());
        SparseMatrix::from_triplets(t.nrows, t.ncols, &t.rows[..k], &t.cols[..k], &t.vals[..k])
    }
}

impl SparseMatrix {
    /// Create a sparse matrix from COO triplets. Duplicates are summed.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        rows: &[usize],
        cols: &[usize],
        vals: &[f64],
    ) -> Self {
        assert_eq!(rows.len(), cols.len());
        assert_eq!(rows.len(), vals.len());
        let mut tri = TriMat::new((nrows, ncols));
        for i in 0..rows.len() {
            tri.add_triplet(rows[i], cols[i], vals[i]);
        }
        Self {
            inner: tri.to_csr(),
            nrows,
            ncols,
        }
    }

    /// An n x 0 matrix: a model part without random effects.
    pub fn empty(nrows: usize) -> Self {
        Self::from_triplets(nrows, 0, &[], &[], &[])
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.inner.nnz()
    }

    /// Get element at (row, col). Returns 0.0 if not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.inner.get(row, col).copied().unwrap_or(0.0)
    }

    /// Column indices and values stored in row `i`.
    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        match self.inner.outer_view(i) {
            Some(view) => {
                let (indices, data) = view.into_raw_storage();
                (indices, data)
            }
            None => (&[], &[]),
        }
    }

    /// Dot product of row `i` with a dense vector.
    pub fn row_dot(&self, i: usize, v: &[f64]) -> f64 {
        let (idx, data) = self.row(i);
        idx.iter().zip(data.iter()).map(|(&j, &x)| x * v[j]).sum()
    }

    /// Sparse matrix-vector product: self * v.
    pub fn mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(v.len(), self.ncols);
        (0..self.nrows).map(|i| self.row_dot(i, v)).collect()
    }

    /// Transposed product: self' * v.
    pub fn t_mat_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(v.len(), self.nrows);
        let mut out = vec![0.0; self.ncols];
        for i in 0..self.nrows {
            if v[i] == 0.0 {
                continue;
            }
            let (idx, data) = self.row(i);
            for (&j, &x) in idx.iter().zip(data.iter()) {
                out[j] += x * v[i];
            }
        }
        out
    }

    /// Keep only the listed rows, in order.
    pub fn select_rows(&self, rows: &[usize]) -> SparseMatrix {
        let mut r = Vec::new();
        let mut c = Vec::new();
        let mut v = Vec::new();
        for (new_i, &old_i) in rows.iter().enumerate() {
            let (idx, data) = self.row(old_i);
            for (&j, &x) in idx.iter().zip(data.iter()) {
                r.push(new_i);
                c.push(j);
                v.push(x);
            }
        }
        SparseMatrix::from_triplets(rows.len(), self.ncols, &r, &c, &v)
    }
}
