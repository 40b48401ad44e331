//! Independent sources driven by a [`Waveform`].

use daestep_core::{
    Breakpoint, DeviceBinding, JacobianAccumulator, NodeId, ResidualAccumulator, StampPattern,
};

use crate::device::{Device, EvalContext};
use crate::waveforms::Waveform;

fn waveform_breakpoints(waveform: &Waveform, from: f64, to: f64) -> Vec<Breakpoint> {
    waveform
        .breakpoints(from, to)
        .into_iter()
        .map(Breakpoint::simple)
        .collect()
}

/// An independent voltage source with its branch current as local 2.
///
/// Branch equation: `v+ - v- - V(t) = 0`.
#[derive(Debug, Clone)]
pub struct VoltageSource {
    /// Device name (e.g., "V1").
    pub name: String,
    nodes: [NodeId; 2],
    pub waveform: Waveform,
    binding: DeviceBinding,
}

const BRANCH: usize = 2;

impl VoltageSource {
    pub fn new(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        waveform: Waveform,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: [node_pos, node_neg],
            waveform,
            binding: DeviceBinding::default(),
        }
    }

    /// Constant-voltage convenience constructor.
    pub fn dc(name: impl Into<String>, node_pos: NodeId, node_neg: NodeId, voltage: f64) -> Self {
        Self::new(name, node_pos, node_neg, Waveform::dc(voltage))
    }

    /// Global unknown carrying the branch current, once bound.
    pub fn current_unknown(&self) -> Option<usize> {
        self.binding.row(BRANCH)
    }
}

impl Device for VoltageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn terminals(&self) -> &[NodeId] {
        &self.nodes
    }

    fn num_internal_unknowns(&self) -> usize {
        1
    }

    fn declare_stamp(&self) -> StampPattern {
        let mut p = StampPattern::new();
        p.push(0, BRANCH);
        p.push(1, BRANCH);
        p.push(BRANCH, 0);
        p.push(BRANCH, 1);
        p
    }

    fn bind_offsets(&mut self, binding: DeviceBinding) {
        self.binding = binding;
    }

    fn load_residual(&self, ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool {
        let b = &self.binding;
        let i = b.value(ctx.solution, BRANCH);
        let v = b.difference(ctx.solution, 0, 1);
        res.branch_f(b, 0, 1, i);
        res.add_f(b.row(BRANCH), v - self.waveform.value_at(ctx.time));
        true
    }

    fn load_jacobian(&self, _ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool {
        let b = &self.binding;
        jac.add_dfdx(b.offset(0), 1.0);
        jac.add_dfdx(b.offset(1), -1.0);
        jac.add_dfdx(b.offset(2), 1.0);
        jac.add_dfdx(b.offset(3), -1.0);
        true
    }

    fn breakpoints(&self, from: f64, to: f64) -> Vec<Breakpoint> {
        waveform_breakpoints(&self.waveform, from, to)
    }

    fn max_time_step(&self) -> Option<f64> {
        self.waveform.max_step()
    }
}

/// An independent current source pushing `I(t)` from `n+` through the
/// source to `n-`.
#[derive(Debug, Clone)]
pub struct CurrentSource {
    /// Device name (e.g., "I1").
    pub name: String,
    nodes: [NodeId; 2],
    pub waveform: Waveform,
    binding: DeviceBinding,
}

impl CurrentSource {
    pub fn new(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        waveform: Waveform,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: [node_pos, node_neg],
            waveform,
            binding: DeviceBinding::default(),
        }
    }

    pub fn dc(name: impl Into<String>, node_pos: NodeId, node_neg: NodeId, current: f64) -> Self {
        Self::new(name, node_pos, node_neg, Waveform::dc(current))
    }
}

impl Device for CurrentSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn terminals(&self) -> &[NodeId] {
        &self.nodes
    }

    fn declare_stamp(&self) -> StampPattern {
        StampPattern::new()
    }

    fn bind_offsets(&mut self, binding: DeviceBinding) {
        self.binding = binding;
    }

    fn load_residual(&self, ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool {
        res.branch_f(&self.binding, 0, 1, self.waveform.value_at(ctx.time));
        true
    }

    fn load_jacobian(&self, _ctx: &EvalContext<'_>, _jac: &mut JacobianAccumulator<'_>) -> bool {
        true
    }

    fn breakpoints(&self, from: f64, to: f64) -> Vec<Breakpoint> {
        waveform_breakpoints(&self.waveform, from, to)
    }

    fn max_time_step(&self) -> Option<f64> {
        self.waveform.max_step()
    }

    fn is_masked(&self) -> bool {
        self.waveform.is_zero()
    }
}
