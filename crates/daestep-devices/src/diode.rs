//! Junction diode using the Shockley equation, with SPICE voltage limiting.

use daestep_core::{
    DeviceBinding, JacobianAccumulator, NodeId, ResidualAccumulator, StampPattern,
};

use crate::device::{Device, EvalContext, StateStatus};

/// Diode model parameters.
#[derive(Debug, Clone)]
pub struct DiodeParams {
    /// Saturation current (A). Default: 1e-14.
    pub is: f64,
    /// Emission coefficient. Default: 1.0.
    pub n: f64,
    /// Zero-bias junction capacitance (F), linear here. Default: 0.0.
    pub cj0: f64,
    /// Transit time (s). Default: 0.0.
    pub tt: f64,
    /// Parallel conductance keeping the junction well-posed. Default: 1e-12.
    pub gmin: f64,
    /// Junction temperature (K). Default: 300.15.
    pub temp: f64,
}

impl Default for DiodeParams {
    fn default() -> Self {
        Self {
            is: 1e-14,
            n: 1.0,
            cj0: 0.0,
            tt: 0.0,
            gmin: 1e-12,
            temp: 300.15,
        }
    }
}

/// Thermal voltage at a given temperature.
pub fn thermal_voltage(temp_k: f64) -> f64 {
    const K_BOLTZMANN: f64 = 1.380649e-23;
    const Q_ELECTRON: f64 = 1.602176634e-19;
    K_BOLTZMANN * temp_k / Q_ELECTRON
}

/// Junction current and conductance at `vd`.
pub fn junction_current(is: f64, nvt: f64, vd: f64) -> (f64, f64) {
    let e = (vd / nvt).exp();
    (is * (e - 1.0), is * e / nvt)
}

/// Critical voltage above which junction steps are limited.
pub fn critical_voltage(is: f64, nvt: f64) -> f64 {
    nvt * (nvt / (std::f64::consts::SQRT_2 * is)).ln()
}

/// SPICE `pnjlim`: limit a junction voltage step from `vold` to `vnew`.
///
/// Returns the limited voltage and whether limiting was applied.
pub fn pnjlim(vnew: f64, vold: f64, nvt: f64, vcrit: f64) -> (f64, bool) {
    if vnew > vcrit && (vnew - vold).abs() > 2.0 * nvt {
        let limited = if vold > 0.0 {
            let arg = 1.0 + (vnew - vold) / nvt;
            if arg > 0.0 {
                vold + nvt * arg.ln()
            } else {
                vcrit
            }
        } else {
            nvt * (vnew / nvt).ln()
        };
        (limited, true)
    } else {
        (vnew, false)
    }
}

/// Junction operating point, refreshed by `update_state`.
#[derive(Debug, Clone, Copy, Default)]
struct OperatingPoint {
    /// Voltage the iterate actually carries.
    v_raw: f64,
    /// Voltage the model was evaluated at, after limiting.
    v_eval: f64,
    id: f64,
    gd: f64,
}

/// A diode element.
#[derive(Debug, Clone)]
pub struct Diode {
    /// Device name (e.g., "D1").
    pub name: String,
    nodes: [NodeId; 2],
    pub params: DiodeParams,
    binding: DeviceBinding,
    op: OperatingPoint,
    /// Limited voltage from the previous evaluation.
    v_last: f64,
    /// Junction voltage at the last accepted step.
    v_accepted: f64,
}

impl Diode {
    pub fn new(name: impl Into<String>, node_pos: NodeId, node_neg: NodeId) -> Self {
        Self::with_params(name, node_pos, node_neg, DiodeParams::default())
    }

    pub fn with_params(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        params: DiodeParams,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: [node_pos, node_neg],
            params,
            binding: DeviceBinding::default(),
            op: OperatingPoint::default(),
            v_last: 0.0,
            v_accepted: 0.0,
        }
    }

    fn nvt(&self) -> f64 {
        self.params.n * thermal_voltage(self.params.temp)
    }

    /// Current and conductance at `vd` including gmin.
    pub fn evaluate(&self, vd: f64) -> (f64, f64) {
        let (id, gd) = junction_current(self.params.is, self.nvt(), vd);
        (id + self.params.gmin * vd, gd + self.params.gmin)
    }

    /// Junction voltage stored at the last accepted step.
    pub fn accepted_voltage(&self) -> f64 {
        self.v_accepted
    }

    fn charge(&self, v: f64, id: f64) -> f64 {
        self.params.cj0 * v + self.params.tt * id
    }

    fn capacitance(&self, gd: f64) -> f64 {
        self.params.cj0 + self.params.tt * gd
    }
}

impl Device for Diode {
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
        let nvt = self.nvt();
        let vd = self.binding.difference(ctx.solution, 0, 1);
        let vcrit = critical_voltage(self.params.is, nvt);
        let (v_eval, limited) = pnjlim(vd, self.v_last, nvt, vcrit);
        if limited {
            log::debug!("{}: limited junction step {:.4} -> {:.4}", self.name, vd, v_eval);
        }

        let (id, gd) = self.evaluate(v_eval);
        self.op = OperatingPoint {
            v_raw: vd,
            v_eval,
            id,
            gd,
        };
        self.v_last = v_eval;

        if limited {
            StateStatus::NotConverged
        } else {
            StateStatus::Converged
        }
    }

    fn load_residual(&self, _ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool {
        let op = &self.op;
        // Linearise around the limited point so the Newton step stays consistent.
        let dv = op.v_raw - op.v_eval;
        let current = op.id + op.gd * dv;
        let charge = self.charge(op.v_eval, op.id) + self.capacitance(op.gd) * dv;
        res.branch_f(&self.binding, 0, 1, current);
        res.branch_q(&self.binding, 0, 1, charge);
        op.v_raw == op.v_eval
    }

    fn load_jacobian(&self, _ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool {
        jac.block_dfdx(&self.binding, 0, self.op.gd);
        jac.block_dqdx(&self.binding, 0, self.capacitance(self.op.gd));
        true
    }

    fn accept_step(&mut self, _ctx: &EvalContext<'_>) {
        self.v_accepted = self.op.v_eval;
        self.v_last = self.op.v_eval;
    }
}
