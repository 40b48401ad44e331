//! Finite-difference verification of the assembled Jacobians.
//!
//! Each unknown is perturbed in turn and the resulting change in F and Q is
//! compared column by column against the analytic `dF/dx` and `dQ/dx`.
//! Entries the stamps never declared count as mismatches when the
//! difference quotient is not negligible.

use daestep_devices::AnalysisMode;
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::loader::Loader;

/// Which Jacobian a mismatch was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianKind {
    Dfdx,
    Dqdx,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JacobianMismatch {
    pub kind: JacobianKind,
    pub row: usize,
    pub col: usize,
    pub analytic: f64,
    pub numeric: f64,
}

impl JacobianMismatch {
    fn error(&self) -> f64 {
        (self.analytic - self.numeric).abs()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JacobianReport {
    pub mismatches: Vec<JacobianMismatch>,
}

impl JacobianReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Mismatch with the largest absolute disagreement.
    pub fn worst(&self) -> Option<&JacobianMismatch> {
        self.mismatches
            .iter()
            .max_by(|a, b| a.error().total_cmp(&b.error()))
    }

    /// `Err(InconsistentJacobian)` if anything disagreed.
    pub fn into_result(self) -> Result<()> {
        match self.worst() {
            None => Ok(()),
            Some(w) => Err(Error::InconsistentJacobian {
                count: self.mismatches.len(),
                row: w.row,
                col: w.col,
            }),
        }
    }
}

/// Forward-difference Jacobian checker.
#[derive(Debug, Clone)]
pub struct JacobianCheck {
    pub rel_tol: f64,
    pub abs_tol: f64,
}

impl Default for JacobianCheck {
    fn default() -> Self {
        Self {
            rel_tol: 1e-3,
            abs_tol: 1e-6,
        }
    }
}

impl JacobianCheck {
    fn agrees(&self, analytic: f64, numeric: f64) -> bool {
        let scale = analytic.abs().max(numeric.abs());
        (analytic - numeric).abs() <= self.rel_tol * scale + self.abs_tol
    }

    /// Compare analytic and difference Jacobians of `loader` at `x`.
    pub fn run(
        &self,
        loader: &mut Loader,
        x: &DVector<f64>,
        time: f64,
        mode: AnalysisMode,
    ) -> Result<JacobianReport> {
        loader.assemble(x, time, mode, true)?;
        let system = loader.system();
        let f0 = system.f().clone();
        let q0 = system.q().clone();
        let dfdx = system.dfdx().to_dense();
        let dqdx = system.dqdx().to_dense();
        let pattern = loader.pattern().clone();

        let mut report = JacobianReport::default();
        let mut xp = x.clone();
        for col in 0..x.len() {
            let h = f64::EPSILON.sqrt() * x[col].abs().max(1.0);
            xp[col] = x[col] + h;
            loader.assemble(&xp, time, mode, false)?;
            xp[col] = x[col];

            let system = loader.system();
            let df = (system.f() - &f0) / h;
            let dq = (system.q() - &q0) / h;
            for (kind, numeric, analytic) in [
                (JacobianKind::Dfdx, &df, &dfdx),
                (JacobianKind::Dqdx, &dq, &dqdx),
            ] {
                self.compare_column(&mut report, kind, col, numeric, analytic, &pattern);
            }
        }
        // leave the loader holding the unperturbed evaluation
        loader.assemble(x, time, mode, true)?;

        if let Some(w) = report.worst() {
            log::warn!(
                "jacobian check: {} mismatches, worst {:?}[{}, {}] analytic {:e} numeric {:e}",
                report.mismatches.len(),
                w.kind,
                w.row,
                w.col,
                w.analytic,
                w.numeric
            );
        }
        Ok(report)
    }

    fn compare_column(
        &self,
        report: &mut JacobianReport,
        kind: JacobianKind,
        col: usize,
        numeric: &DVector<f64>,
        analytic: &DMatrix<f64>,
        pattern: &daestep_core::SparsityPattern,
    ) {
        for row in 0..numeric.len() {
            let a = analytic[(row, col)];
            let n = numeric[row];
            let declared = pattern.offset(row, col).is_some();
            if (declared && !self.agrees(a, n)) || (!declared && !self.agrees(0.0, n)) {
                report.mismatches.push(JacobianMismatch {
                    kind,
                    row,
                    col,
                    analytic: a,
                    numeric: n,
                });
            }
        }
    }
}

/// Run `check` on `loader` at `x` and `time` in transient mode.
pub fn check_jacobian(
    loader: &mut Loader,
    x: &DVector<f64>,
    time: f64,
    check: &JacobianCheck,
) -> Result<JacobianReport> {
    check.run(loader, x, time, AnalysisMode::Transient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use daestep_core::{
        DeviceBinding, JacobianAccumulator, NodeId, ResidualAccumulator, StampPattern,
    };
    use daestep_devices::{BoxedDevice, Capacitor, Device, Diode, EvalContext, Resistor};

    /// Conductor whose Jacobian is off by a factor of two.
    #[derive(Debug)]
    struct WrongSlope {
        nodes: [NodeId; 2],
        binding: DeviceBinding,
    }

    impl Device for WrongSlope {
        fn name(&self) -> &str {
            "W1"
        }

        fn terminals(&self) -> &[NodeId] {
            &self.nodes
        }

        fn declare_stamp(&self) -> StampPattern {
            StampPattern::two_terminal(0, 1)
        }

        fn bind_offsets(&mut self, binding: DeviceBinding) {
            self.binding = binding;
        }

        fn load_residual(&self, ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool {
            let v = self.binding.difference(ctx.solution, 0, 1);
            res.branch_f(&self.binding, 0, 1, v);
            true
        }

        fn load_jacobian(&self, _ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool {
            jac.block_dfdx(&self.binding, 0, 2.0);
            true
        }
    }

    #[test]
    fn test_builtin_devices_are_consistent() {
        let devices: Vec<BoxedDevice> = vec![
            Box::new(Resistor::new("R1", NodeId::new(1), NodeId::new(2), 1e3)),
            Box::new(Capacitor::new("C1", NodeId::new(2), NodeId::GROUND, 1e-6)),
            Box::new(Diode::new("D1", NodeId::new(2), NodeId::GROUND)),
        ];
        let mut loader = Loader::new(devices, 2).unwrap();
        let x = DVector::from_vec(vec![1.0, 0.3]);
        let report = check_jacobian(&mut loader, &x, 0.0, &JacobianCheck::default()).unwrap();
        assert!(report.is_consistent(), "{:?}", report.mismatches);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_wrong_slope_is_reported() {
        let devices: Vec<BoxedDevice> = vec![Box::new(WrongSlope {
            nodes: [NodeId::new(1), NodeId::GROUND],
            binding: DeviceBinding::default(),
        })];
        let mut loader = Loader::new(devices, 1).unwrap();
        let x = DVector::from_vec(vec![0.5]);
        let report = JacobianCheck::default()
            .run(&mut loader, &x, 0.0, AnalysisMode::Transient)
            .unwrap();
        let worst = report.worst().unwrap();
        assert_eq!(worst.kind, JacobianKind::Dfdx);
        assert_eq!((worst.row, worst.col), (0, 0));
        assert_eq!(worst.analytic, 2.0);
        assert!((worst.numeric - 1.0).abs() < 1e-6);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, Error::InconsistentJacobian { count: 1, row: 0, col: 0 }));
    }
}
