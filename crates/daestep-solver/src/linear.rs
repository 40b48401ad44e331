//! Linear solve collaborator used by the Newton driver.
//!
//! A solve never fails with an `Err` for numerical reasons: a singular matrix
//! comes back as [`LinearStatus::Singular`] with a zero update, so the caller
//! can treat it as a recoverable step failure.

use std::fmt::Debug;

use daestep_core::SparseMatrix;
use nalgebra::DVector;

/// Outcome class of a linear solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearStatus {
    Success,
    /// Numerically singular; the update is zero.
    Singular,
    /// The solver is misconfigured or the inputs are inconsistent.
    Fatal,
}

/// Result of one linear solve.
#[derive(Debug, Clone)]
pub struct LinearSolve {
    pub delta: DVector<f64>,
    pub status: LinearStatus,
}

impl LinearSolve {
    fn failed(size: usize, status: LinearStatus) -> Self {
        Self {
            delta: DVector::zeros(size),
            status,
        }
    }
}

/// Solves `J * delta = rhs`.
pub trait LinearSolver: Debug + Send + Sync {
    fn solve(&mut self, jacobian: &SparseMatrix, rhs: &DVector<f64>) -> LinearSolve;

    fn name(&self) -> &str;
}

/// Dense LU with partial pivoting.
///
/// Suited to the small and medium systems this crate targets; the sparse
/// Jacobian is expanded to dense storage for every factorization.
#[derive(Debug, Clone)]
pub struct DenseLu {
    /// Pivots below this magnitude, relative to the largest entry, count as singular.
    pub pivot_tol: f64,
}

impl DenseLu {
    pub fn new() -> Self {
        Self { pivot_tol: 1e-14 }
    }
}

impl Default for DenseLu {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver for DenseLu {
    fn solve(&mut self, jacobian: &SparseMatrix, rhs: &DVector<f64>) -> LinearSolve {
        let n = jacobian.size();
        if rhs.len() != n {
            log::error!("linear solve: rhs has {} entries, matrix is {}x{}", rhs.len(), n, n);
            return LinearSolve::failed(n, LinearStatus::Fatal);
        }
        let dense = jacobian.to_dense();
        let scale = dense.amax();
        let lu = dense.lu();
        let u = lu.u();
        let tiny = u
            .diagonal()
            .iter()
            .any(|d| !d.is_finite() || d.abs() <= self.pivot_tol * scale);
        if scale == 0.0 || tiny {
            return LinearSolve::failed(n, LinearStatus::Singular);
        }
        match lu.solve(rhs) {
            Some(delta) if delta.iter().all(|v| v.is_finite()) => LinearSolve {
                delta,
                status: LinearStatus::Success,
            },
            _ => LinearSolve::failed(n, LinearStatus::Singular),
        }
    }

    fn name(&self) -> &str {
        "dense-lu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daestep_core::SparsityPattern;
    use nalgebra::dvector;
    use std::sync::Arc;

    fn full_matrix(values: [[f64; 2]; 2]) -> SparseMatrix {
        let pattern =
            SparsityPattern::from_entries(2, [(0, 0), (0, 1), (1, 0), (1, 1)]).unwrap();
        let pattern = Arc::new(pattern);
        let mut m = SparseMatrix::new(pattern.clone());
        for (r, row) in values.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                let k = pattern.offset(r, c).unwrap();
                m.add_at(k, *v);
            }
        }
        m
    }

    #[test]
    fn test_dense_lu_success() {
        // 2x + y = 5
        // x + 3y = 6
        // Solution: x = 1.8, y = 1.4
        let j = full_matrix([[2.0, 1.0], [1.0, 3.0]]);
        let out = DenseLu::new().solve(&j, &dvector![5.0, 6.0]);
        assert_eq!(out.status, LinearStatus::Success);
        assert!((out.delta[0] - 1.8).abs() < 1e-12);
        assert!((out.delta[1] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_dense_lu_singular_returns_zero_update() {
        let j = full_matrix([[1.0, 2.0], [2.0, 4.0]]);
        let out = DenseLu::new().solve(&j, &dvector![1.0, 2.0]);
        assert_eq!(out.status, LinearStatus::Singular);
        assert_eq!(out.delta, dvector![0.0, 0.0]);
    }

    #[test]
    fn test_dense_lu_fatal_on_bad_rhs() {
        let j = full_matrix([[1.0, 0.0], [0.0, 1.0]]);
        let out = DenseLu::new().solve(&j, &dvector![1.0]);
        assert_eq!(out.status, LinearStatus::Fatal);
    }
}
