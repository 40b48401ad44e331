//! Shared DAE accumulators: residual parts F and Q and their Jacobians.
//!
//! The system solved is `F(x) + dQ(x)/dt = 0`. Devices never see the
//! storage directly; they receive a [`ResidualAccumulator`] and a
//! [`JacobianAccumulator`], which only support adding into bound rows and
//! offsets.

use std::sync::Arc;

use nalgebra::DVector;

use crate::error::{Error, Result};
use crate::sparse::{SparseMatrix, SparsityPattern};
use crate::stamp::DeviceBinding;

/// Assembled F, Q, dF/dx and dQ/dx for one candidate solution.
#[derive(Debug, Clone)]
pub struct DaeSystem {
    f: DVector<f64>,
    q: DVector<f64>,
    dfdx: SparseMatrix,
    dqdx: SparseMatrix,
}

impl DaeSystem {
    /// Zeroed system over a Jacobian pattern.
    pub fn new(pattern: Arc<SparsityPattern>) -> Self {
        let n = pattern.size();
        Self {
            f: DVector::zeros(n),
            q: DVector::zeros(n),
            dfdx: SparseMatrix::new(pattern.clone()),
            dqdx: SparseMatrix::new(pattern),
        }
    }

    /// Number of unknowns.
    pub fn size(&self) -> usize {
        self.f.len()
    }

    /// Zero every accumulator.
    pub fn clear(&mut self) {
        self.f.fill(0.0);
        self.q.fill(0.0);
        self.dfdx.clear();
        self.dqdx.clear();
    }

    pub fn f(&self) -> &DVector<f64> {
        &self.f
    }

    pub fn q(&self) -> &DVector<f64> {
        &self.q
    }

    pub fn dfdx(&self) -> &SparseMatrix {
        &self.dfdx
    }

    pub fn dqdx(&self) -> &SparseMatrix {
        &self.dqdx
    }

    /// Borrow both accumulators at once.
    pub fn accumulators(&mut self) -> (ResidualAccumulator<'_>, JacobianAccumulator<'_>) {
        (
            ResidualAccumulator {
                f: self.f.as_mut_slice(),
                q: self.q.as_mut_slice(),
            },
            JacobianAccumulator {
                dfdx: self.dfdx.values_mut(),
                dqdx: self.dqdx.values_mut(),
            },
        )
    }

    /// Add another system assembled over the same layout.
    pub fn accumulate(&mut self, other: &DaeSystem) -> Result<()> {
        if self.size() != other.size() {
            return Err(Error::LayoutMismatch);
        }
        self.f += &other.f;
        self.q += &other.q;
        self.dfdx.add_assign(&other.dfdx)?;
        self.dqdx.add_assign(&other.dqdx)
    }
}

/// Additive view of the F and Q vectors.
#[derive(Debug)]
pub struct ResidualAccumulator<'a> {
    f: &'a mut [f64],
    q: &'a mut [f64],
}

impl ResidualAccumulator<'_> {
    /// Add `value` to F at `row`; ground rows are dropped.
    #[inline]
    pub fn add_f(&mut self, row: Option<usize>, value: f64) {
        if let Some(r) = row {
            self.f[r] += value;
        }
    }

    /// Add `value` to Q at `row`; ground rows are dropped.
    #[inline]
    pub fn add_q(&mut self, row: Option<usize>, value: f64) {
        if let Some(r) = row {
            self.q[r] += value;
        }
    }

    /// Current flowing from local `a` to local `b`: `+i` at a, `-i` at b.
    pub fn branch_f(&mut self, binding: &DeviceBinding, a: usize, b: usize, current: f64) {
        self.add_f(binding.row(a), current);
        self.add_f(binding.row(b), -current);
    }

    /// Charge stored between local `a` and local `b`.
    pub fn branch_q(&mut self, binding: &DeviceBinding, a: usize, b: usize, charge: f64) {
        self.add_q(binding.row(a), charge);
        self.add_q(binding.row(b), -charge);
    }
}

/// Additive view of the dF/dx and dQ/dx value arenas.
#[derive(Debug)]
pub struct JacobianAccumulator<'a> {
    dfdx: &'a mut [f64],
    dqdx: &'a mut [f64],
}

impl JacobianAccumulator<'_> {
    #[inline]
    pub fn add_dfdx(&mut self, offset: Option<usize>, value: f64) {
        if let Some(k) = offset {
            self.dfdx[k] += value;
        }
    }

    #[inline]
    pub fn add_dqdx(&mut self, offset: Option<usize>, value: f64) {
        if let Some(k) = offset {
            self.dqdx[k] += value;
        }
    }

    /// Stamp `g` into dF/dx through a four-slot block starting at `base`.
    pub fn block_dfdx(&mut self, binding: &DeviceBinding, base: usize, g: f64) {
        self.add_dfdx(binding.offset(base), g);
        self.add_dfdx(binding.offset(base + 1), -g);
        self.add_dfdx(binding.offset(base + 2), -g);
        self.add_dfdx(binding.offset(base + 3), g);
    }

    /// Stamp `c` into dQ/dx through a four-slot block starting at `base`.
    pub fn block_dqdx(&mut self, binding: &DeviceBinding, base: usize, c: f64) {
        self.add_dqdx(binding.offset(base), c);
        self.add_dqdx(binding.offset(base + 1), -c);
        self.add_dqdx(binding.offset(base + 2), -c);
        self.add_dqdx(binding.offset(base + 3), c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_system() -> DaeSystem {
        let pattern =
            SparsityPattern::from_entries(2, [(0, 0), (0, 1), (1, 0), (1, 1)]).unwrap();
        DaeSystem::new(Arc::new(pattern))
    }

    #[test]
    fn test_accumulators_are_additive() {
        let mut sys = two_node_system();
        let binding = DeviceBinding::new(
            vec![Some(0), Some(1)],
            vec![Some(0), Some(1), Some(2), Some(3)],
        );
        for _ in 0..2 {
            let (mut res, mut jac) = sys.accumulators();
            res.branch_f(&binding, 0, 1, 1.5);
            jac.block_dfdx(&binding, 0, 0.5);
        }
        assert_eq!(sys.f()[0], 3.0);
        assert_eq!(sys.f()[1], -3.0);
        assert_eq!(sys.dfdx().get(0, 0), 1.0);
        assert_eq!(sys.dfdx().get(0, 1), -1.0);
    }

    #[test]
    fn test_ground_writes_dropped() {
        let mut sys = two_node_system();
        let binding = DeviceBinding::new(vec![Some(1), None], vec![Some(3), None, None, None]);
        let (mut res, mut jac) = sys.accumulators();
        res.branch_q(&binding, 0, 1, 2.0);
        jac.block_dqdx(&binding, 0, 1e-6);
        assert_eq!(sys.q()[1], 2.0);
        assert_eq!(sys.q()[0], 0.0);
        assert_eq!(sys.dqdx().get(1, 1), 1e-6);
        assert_eq!(sys.dqdx().values().iter().filter(|v| **v != 0.0).count(), 1);
    }

    #[test]
    fn test_accumulate_and_clear() {
        let mut a = two_node_system();
        let mut b = a.clone();
        {
            let (mut res, _) = b.accumulators();
            res.add_f(Some(0), 2.0);
        }
        a.accumulate(&b).unwrap();
        a.accumulate(&b).unwrap();
        assert_eq!(a.f()[0], 4.0);
        a.clear();
        assert_eq!(a.f()[0], 0.0);
    }
}
