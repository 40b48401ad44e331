//! Compressed sparse row storage with a shared, immutable pattern.
//!
//! The pattern is built once per circuit layout and shared behind an `Arc`
//! by every matrix over that layout. Values live in a single contiguous
//! arena indexed by entry offset, so devices hold integer offsets rather
//! than references into the matrix.

use std::collections::BTreeSet;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// Row-compressed sparsity pattern of a square matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    size: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl SparsityPattern {
    /// Build a pattern from (row, col) entries. Duplicates collapse.
    pub fn from_entries<I>(size: usize, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let mut set = BTreeSet::new();
        for (row, col) in entries {
            if row >= size || col >= size {
                return Err(Error::EntryOutOfRange { row, col, size });
            }
            set.insert((row, col));
        }

        let mut row_ptr = vec![0; size + 1];
        let mut col_idx = Vec::with_capacity(set.len());
        for &(row, col) in &set {
            row_ptr[row + 1] += 1;
            col_idx.push(col);
        }
        for i in 0..size {
            row_ptr[i + 1] += row_ptr[i];
        }

        Ok(Self {
            size,
            row_ptr,
            col_idx,
        })
    }

    /// Pattern with every entry present.
    pub fn dense(size: usize) -> Self {
        Self {
            size,
            row_ptr: (0..=size).map(|row| row * size).collect(),
            col_idx: (0..size).flat_map(|_| 0..size).collect(),
        }
    }

    /// Dimension N of the N x N matrix.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    /// Arena offset of entry (row, col), if present.
    pub fn offset(&self, row: usize, col: usize) -> Option<usize> {
        if row >= self.size {
            return None;
        }
        let start = self.row_ptr[row];
        let end = self.row_ptr[row + 1];
        self.col_idx[start..end]
            .binary_search(&col)
            .ok()
            .map(|k| start + k)
    }

    /// Iterate `(row, col, offset)` in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.size).flat_map(move |row| {
            (self.row_ptr[row]..self.row_ptr[row + 1]).map(move |k| (row, self.col_idx[k], k))
        })
    }
}

/// Values over a shared [`SparsityPattern`].
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    pattern: Arc<SparsityPattern>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// Zero matrix over `pattern`.
    pub fn new(pattern: Arc<SparsityPattern>) -> Self {
        let values = vec![0.0; pattern.nnz()];
        Self { pattern, values }
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn size(&self) -> usize {
        self.pattern.size()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Reset all stored values to zero, keeping the pattern.
    pub fn clear(&mut self) {
        self.values.fill(0.0);
    }

    /// Value at (row, col); zero if the entry is not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.pattern
            .offset(row, col)
            .map_or(0.0, |offset| self.values[offset])
    }

    /// Add `value` at an arena offset.
    pub fn add_at(&mut self, offset: usize, value: f64) {
        self.values[offset] += value;
    }

    fn same_layout(&self, other: &SparseMatrix) -> bool {
        Arc::ptr_eq(&self.pattern, &other.pattern) || self.pattern == other.pattern
    }

    /// Overwrite with `a * x + b * y`; all three must share a layout.
    pub fn assign_combination(
        &mut self,
        a: f64,
        x: &SparseMatrix,
        b: f64,
        y: &SparseMatrix,
    ) -> Result<()> {
        if !self.same_layout(x) || !self.same_layout(y) {
            return Err(Error::LayoutMismatch);
        }
        for ((out, xv), yv) in self.values.iter_mut().zip(&x.values).zip(&y.values) {
            *out = a * xv + b * yv;
        }
        Ok(())
    }

    /// Add another matrix with the same layout into this one.
    pub fn add_assign(&mut self, other: &SparseMatrix) -> Result<()> {
        if !self.same_layout(other) {
            return Err(Error::LayoutMismatch);
        }
        for (out, v) in self.values.iter_mut().zip(&other.values) {
            *out += v;
        }
        Ok(())
    }

    /// Sparse matrix-vector product.
    pub fn mul_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.size());
        for (row, col, offset) in self.pattern.iter() {
            y[row] += self.values[offset] * x[col];
        }
        y
    }

    /// Expand into a dense matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let n = self.size();
        let mut dense = DMatrix::zeros(n, n);
        for (row, col, offset) in self.pattern.iter() {
            dense[(row, col)] = self.values[offset];
        }
        dense
    }
}
