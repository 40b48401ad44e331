//! Two-level solves: device contributions that run their own Newton solve.
//!
//! A [`NestedSolve`] is invoked explicitly from a device's `update_state`.
//! It owns its problem, solver, iterate and counters, and only reads the
//! outer solution through whatever the device copies into its problem.
//! The inner iterate restarts from the value committed at the last accepted
//! outer step, so rejected outer steps leave no trace in it.

use std::sync::Arc;

use daestep_core::{
    DeviceBinding, JacobianAccumulator, NodeId, ResidualAccumulator, SparseMatrix,
    SparsityPattern, StampPattern,
};
use daestep_devices::diode::{critical_voltage, thermal_voltage};
use daestep_devices::{BoxedDevice, Device, DeviceRegistry, DeviceSpec, EvalContext, StateStatus};
use nalgebra::DVector;

use crate::error::Result;
use crate::loader::AssemblyStatus;
use crate::newton::{NewtonCounters, NewtonOutcome, NewtonSolver};
use crate::options::{NewtonOptions, SearchMethod};
use crate::problem::NonlinearProblem;

/// An inner nonlinear solve with its own iterate and history.
#[derive(Debug)]
pub struct NestedSolve<P> {
    problem: P,
    newton: NewtonSolver,
    iterate: DVector<f64>,
    committed: DVector<f64>,
}

impl<P: NonlinearProblem> NestedSolve<P> {
    /// Inner solve starting from `initial`.
    pub fn new(problem: P, options: NewtonOptions, initial: DVector<f64>) -> Self {
        Self {
            problem,
            newton: NewtonSolver::new(options),
            committed: initial.clone(),
            iterate: initial,
        }
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn problem_mut(&mut self) -> &mut P {
        &mut self.problem
    }

    /// Solve from the committed iterate.
    pub fn solve(&mut self) -> Result<NewtonOutcome> {
        self.iterate.copy_from(&self.committed);
        self.newton
            .solve(&mut self.problem, &mut self.iterate, Some(&self.committed))
    }

    /// Latest inner iterate.
    pub fn solution(&self) -> &DVector<f64> {
        &self.iterate
    }

    /// Make the latest iterate the starting point of future solves.
    pub fn commit(&mut self) {
        self.committed.copy_from(&self.iterate);
    }

    pub fn counters(&self) -> NewtonCounters {
        self.newton.counters()
    }
}

/// Junction current with the exponential continued linearly above `v_lin`.
fn limited_junction(is: f64, nvt: f64, v_lin: f64, v: f64) -> (f64, f64) {
    if v <= v_lin {
        let e = (v / nvt).exp();
        (is * (e - 1.0), is * e / nvt)
    } else {
        let e = (v_lin / nvt).exp();
        let g = is * e / nvt;
        (is * (e - 1.0) + g * (v - v_lin), g)
    }
}

/// Kirchhoff balance at the hidden junction node of a series R-diode:
/// `id(vj) - (v_applied - vj) / rs = 0`.
#[derive(Debug)]
pub struct JunctionBalance {
    is: f64,
    nvt: f64,
    v_lin: f64,
    rs: f64,
    v_applied: f64,
    residual: DVector<f64>,
    jacobian: SparseMatrix,
}

impl JunctionBalance {
    fn new(is: f64, nvt: f64, rs: f64) -> Self {
        let pattern = Arc::new(SparsityPattern::dense(1));
        Self {
            is,
            nvt,
            v_lin: critical_voltage(is, nvt),
            rs,
            v_applied: 0.0,
            residual: DVector::zeros(1),
            jacobian: SparseMatrix::new(pattern),
        }
    }

    pub fn set_applied(&mut self, v: f64) {
        self.v_applied = v;
    }

    /// Junction current and conductance at `vj`.
    pub fn junction(&self, vj: f64) -> (f64, f64) {
        limited_junction(self.is, self.nvt, self.v_lin, vj)
    }
}

impl NonlinearProblem for JunctionBalance {
    fn size(&self) -> usize {
        1
    }

    fn evaluate(&mut self, x: &DVector<f64>, with_jacobian: bool) -> Result<AssemblyStatus> {
        let vj = x[0];
        let (id, gd) = self.junction(vj);
        self.residual[0] = id - (self.v_applied - vj) / self.rs;
        if with_jacobian {
            self.jacobian.clear();
            self.jacobian.add_at(0, gd + 1.0 / self.rs);
        }
        Ok(AssemblyStatus::CONVERGED)
    }

    fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    fn jacobian(&self) -> &SparseMatrix {
        &self.jacobian
    }
}

/// Parameters of [`SeriesResistanceDiode`].
#[derive(Debug, Clone)]
pub struct SeriesDiodeParams {
    pub is: f64,
    pub n: f64,
    /// Series resistance (ohms).
    pub rs: f64,
    /// Linear junction capacitance (F).
    pub cj0: f64,
    pub temp: f64,
}

impl Default for SeriesDiodeParams {
    fn default() -> Self {
        Self {
            is: 1e-14,
            n: 1.0,
            rs: 1.0,
            cj0: 0.0,
            temp: 300.15,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SeriesOperatingPoint {
    v_applied: f64,
    vj: f64,
    id: f64,
    /// dI/dV_applied with the junction node eliminated.
    g_eff: f64,
    /// dVj/dV_applied.
    dvj: f64,
}

/// Diode with series resistance whose junction voltage is eliminated by
/// an inner scalar Newton solve on every evaluation.
#[derive(Debug)]
pub struct SeriesResistanceDiode {
    name: String,
    nodes: [NodeId; 2],
    params: SeriesDiodeParams,
    binding: DeviceBinding,
    inner: NestedSolve<JunctionBalance>,
    op: SeriesOperatingPoint,
}

impl SeriesResistanceDiode {
    pub fn new(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        params: SeriesDiodeParams,
    ) -> Self {
        Self::with_inner_options(name, node_pos, node_neg, params, Self::default_inner_options())
    }

    pub fn with_inner_options(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        params: SeriesDiodeParams,
        options: NewtonOptions,
    ) -> Self {
        let nvt = params.n * thermal_voltage(params.temp);
        let problem = JunctionBalance::new(params.is, nvt, params.rs);
        Self {
            name: name.into(),
            nodes: [node_pos, node_neg],
            params,
            binding: DeviceBinding::default(),
            inner: NestedSolve::new(problem, options, DVector::zeros(1)),
            op: SeriesOperatingPoint::default(),
        }
    }

    fn default_inner_options() -> NewtonOptions {
        NewtonOptions {
            max_iterations: 100,
            search_method: SearchMethod::Full,
            rhs_tol: 1e-12,
            ..NewtonOptions::dc()
        }
    }

    /// Junction voltage from the last successful inner solve.
    pub fn junction_voltage(&self) -> f64 {
        self.op.vj
    }

    pub fn inner_counters(&self) -> NewtonCounters {
        self.inner.counters()
    }
}

impl Device for SeriesResistanceDiode {
    fn name(&self) -> &str {
        &self.name
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

    fn update_state(&mut self, ctx: &EvalContext<'_>) -> StateStatus {
        let v_applied = self.binding.difference(ctx.solution, 0, 1);
        self.inner.problem_mut().set_applied(v_applied);
        match self.inner.solve() {
            Ok(outcome) if outcome.is_converged() => {
                let vj = self.inner.solution()[0];
                let (id, gd) = self.inner.problem().junction(vj);
                let rs = self.params.rs;
                self.op = SeriesOperatingPoint {
                    v_applied,
                    vj,
                    id,
                    g_eff: gd / (1.0 + gd * rs),
                    dvj: 1.0 / (1.0 + gd * rs),
                };
                StateStatus::Converged
            }
            Ok(outcome) => {
                log::debug!(
                    "{}: junction solve {:?} at v = {:.4}",
                    self.name,
                    outcome.status,
                    v_applied
                );
                StateStatus::InnerSolveFailed
            }
            Err(e) => {
                log::warn!("{}: junction solve error: {}", self.name, e);
                StateStatus::InnerSolveFailed
            }
        }
    }

    fn load_residual(&self, _ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool {
        res.branch_f(&self.binding, 0, 1, self.op.id);
        if self.params.cj0 != 0.0 {
            res.branch_q(&self.binding, 0, 1, self.params.cj0 * self.op.vj);
        }
        true
    }

    fn load_jacobian(&self, _ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool {
        jac.block_dfdx(&self.binding, 0, self.op.g_eff);
        if self.params.cj0 != 0.0 {
            jac.block_dqdx(&self.binding, 0, self.params.cj0 * self.op.dvj);
        }
        true
    }

    fn accept_step(&mut self, _ctx: &EvalContext<'_>) {
        self.inner.commit();
        log::trace!(
            "{}: committed vj = {:.6} at v = {:.6}",
            self.name,
            self.op.vj,
            self.op.v_applied
        );
    }
}

fn build_series_diode(spec: &DeviceSpec) -> daestep_devices::Result<BoxedDevice> {
    let (a, b) = spec.two_nodes()?;
    let defaults = SeriesDiodeParams::default();
    let params = SeriesDiodeParams {
        is: spec.get_or("is", defaults.is),
        n: spec.get_or("n", defaults.n),
        rs: spec.require_positive("rs")?,
        cj0: spec.get_or("cj0", defaults.cj0),
        temp: spec.get_or("temp", defaults.temp),
    };
    for (param, value) in [("is", params.is), ("n", params.n), ("temp", params.temp)] {
        if value <= 0.0 || !value.is_finite() {
            return Err(daestep_devices::Error::InvalidParameter {
                device: spec.name.clone(),
                param: param.to_string(),
                value,
            });
        }
    }
    Ok(Box::new(SeriesResistanceDiode::new(spec.name.clone(), a, b, params)))
}

/// Add the kinds defined in this crate ("DS": series-resistance diode).
pub fn register_nested_devices(registry: &mut DeviceRegistry) {
    registry.register("DS", build_series_diode);
}
