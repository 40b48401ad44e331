//! Nonlinear problems the Newton driver can solve.

use daestep_core::SparseMatrix;
use daestep_devices::AnalysisMode;
use nalgebra::DVector;

use crate::error::Result;
use crate::loader::{AssemblyStatus, Loader};

/// A square nonlinear system `R(x) = 0` with Jacobian `dR/dx`.
pub trait NonlinearProblem {
    /// Number of unknowns.
    fn size(&self) -> usize;

    /// Evaluate the residual at `x`, and the Jacobian if `with_jacobian`.
    fn evaluate(&mut self, x: &DVector<f64>, with_jacobian: bool) -> Result<AssemblyStatus>;

    /// Residual from the last evaluation.
    fn residual(&self) -> &DVector<f64>;

    /// Jacobian from the last evaluation that requested one.
    fn jacobian(&self) -> &SparseMatrix;
}

/// Steady state `F(x) + gmin * x_nodes = 0` at a fixed time.
///
/// The Q terms are dropped. The shunt `gmin` on node rows keeps floating
/// nodes (capacitor-only connections) solvable.
#[derive(Debug)]
pub struct SteadyStateProblem<'a> {
    loader: &'a mut Loader,
    time: f64,
    gmin: f64,
    residual: DVector<f64>,
    jacobian: SparseMatrix,
}

impl<'a> SteadyStateProblem<'a> {
    pub fn new(loader: &'a mut Loader, time: f64, gmin: f64) -> Self {
        let residual = DVector::zeros(loader.size());
        let jacobian = SparseMatrix::new(loader.pattern().clone());
        Self {
            loader,
            time,
            gmin,
            residual,
            jacobian,
        }
    }
}

impl NonlinearProblem for SteadyStateProblem<'_> {
    fn size(&self) -> usize {
        self.loader.size()
    }

    fn evaluate(&mut self, x: &DVector<f64>, with_jacobian: bool) -> Result<AssemblyStatus> {
        let status = self
            .loader
            .assemble(x, self.time, AnalysisMode::OperatingPoint, with_jacobian)?;
        let nodes = self.loader.num_nodes();
        let system = self.loader.system();

        self.residual.copy_from(system.f());
        for i in 0..nodes {
            self.residual[i] += self.gmin * x[i];
        }

        if with_jacobian {
            self.jacobian
                .assign_combination(1.0, system.dfdx(), 0.0, system.dqdx())?;
            if self.gmin != 0.0 {
                let pattern = self.jacobian.pattern().clone();
                for i in 0..nodes {
                    if let Some(k) = pattern.offset(i, i) {
                        self.jacobian.add_at(k, self.gmin);
                    }
                }
            }
        }
        Ok(status)
    }

    fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    fn jacobian(&self) -> &SparseMatrix {
        &self.jacobian
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daestep_core::NodeId;
    use daestep_devices::{BoxedDevice, Capacitor, CurrentSource, Resistor};

    #[test]
    fn test_steady_state_drops_charge_and_adds_gmin() {
        let devices: Vec<BoxedDevice> = vec![
            Box::new(Resistor::new("R1", NodeId::new(1), NodeId::GROUND, 2.0)),
            Box::new(Capacitor::new("C1", NodeId::new(2), NodeId::GROUND, 1.0)),
            Box::new(CurrentSource::dc("I1", NodeId::GROUND, NodeId::new(1), 1.0)),
        ];
        let mut loader = Loader::new(devices, 2).unwrap();
        let mut problem = SteadyStateProblem::new(&mut loader, 0.0, 0.25);
        let x = DVector::from_vec(vec![2.0, 4.0]);
        let status = problem.evaluate(&x, true).unwrap();
        assert_eq!(status, AssemblyStatus::CONVERGED);

        // node 1: 2/2 - 1 + 0.25*2
        assert_eq!(problem.residual()[0], 0.5);
        // node 2 sees only the shunt
        assert_eq!(problem.residual()[1], 1.0);
        assert_eq!(problem.jacobian().get(0, 0), 0.75);
        assert_eq!(problem.jacobian().get(1, 1), 0.25);
    }
}
