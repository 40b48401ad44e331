//! Passive device models: Resistor, Capacitor, Inductor.

use daestep_core::{
    DeviceBinding, JacobianAccumulator, NodeId, ResidualAccumulator, StampPattern,
};

use crate::device::{Device, EvalContext};

/// A linear resistor: `F = G * (v+ - v-)`.
#[derive(Debug, Clone)]
pub struct Resistor {
    /// Device name (e.g., "R1").
    pub name: String,
    nodes: [NodeId; 2],
    /// Resistance value in ohms.
    pub resistance: f64,
    binding: DeviceBinding,
}

impl Resistor {
    pub fn new(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        resistance: f64,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: [node_pos, node_neg],
            resistance,
            binding: DeviceBinding::default(),
        }
    }

    /// Get the conductance (1/R).
    pub fn conductance(&self) -> f64 {
        1.0 / self.resistance
    }
}

impl Device for Resistor {
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

    fn load_residual(&self, ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool {
        let v = self.binding.difference(ctx.solution, 0, 1);
        res.branch_f(&self.binding, 0, 1, self.conductance() * v);
        true
    }

    fn load_jacobian(&self, _ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool {
        jac.block_dfdx(&self.binding, 0, self.conductance());
        true
    }
}

/// A linear capacitor: `Q = C * (v+ - v-)`.
#[derive(Debug, Clone)]
pub struct Capacitor {
    /// Device name (e.g., "C1").
    pub name: String,
    nodes: [NodeId; 2],
    /// Capacitance value in farads.
    pub capacitance: f64,
    binding: DeviceBinding,
}

impl Capacitor {
    pub fn new(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        capacitance: f64,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: [node_pos, node_neg],
            capacitance,
            binding: DeviceBinding::default(),
        }
    }
}

impl Device for Capacitor {
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

    fn load_residual(&self, ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool {
        let v = self.binding.difference(ctx.solution, 0, 1);
        res.branch_q(&self.binding, 0, 1, self.capacitance * v);
        true
    }

    fn load_jacobian(&self, _ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool {
        jac.block_dqdx(&self.binding, 0, self.capacitance);
        true
    }
}

/// A linear inductor with its branch current as internal unknown 2.
///
/// Branch equation: `L * di/dt - (v+ - v-) = 0`.
#[derive(Debug, Clone)]
pub struct Inductor {
    /// Device name (e.g., "L1").
    pub name: String,
    nodes: [NodeId; 2],
    /// Inductance value in henries.
    pub inductance: f64,
    binding: DeviceBinding,
}

const BRANCH: usize = 2;

impl Inductor {
    pub fn new(
        name: impl Into<String>,
        node_pos: NodeId,
        node_neg: NodeId,
        inductance: f64,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: [node_pos, node_neg],
            inductance,
            binding: DeviceBinding::default(),
        }
    }

    /// Global unknown carrying the branch current, once bound.
    pub fn current_unknown(&self) -> Option<usize> {
        self.binding.row(BRANCH)
    }
}

impl Device for Inductor {
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
        p.push(BRANCH, BRANCH);
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
        res.add_f(b.row(BRANCH), -v);
        res.add_q(b.row(BRANCH), self.inductance * i);
        true
    }

    fn load_jacobian(&self, _ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool {
        let b = &self.binding;
        jac.add_dfdx(b.offset(0), 1.0);
        jac.add_dfdx(b.offset(1), -1.0);
        jac.add_dfdx(b.offset(2), -1.0);
        jac.add_dfdx(b.offset(3), 1.0);
        jac.add_dqdx(b.offset(4), self.inductance);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AnalysisMode;
    use daestep_core::{DaeSystem, SparsityPattern};
    use std::sync::Arc;

    /// Bind a device against a dense pattern where local k maps to global k.
    fn bind_dense(device: &mut dyn Device, size: usize) -> DaeSystem {
        let all = (0..size).flat_map(|r| (0..size).map(move |c| (r, c)));
        let pattern = Arc::new(SparsityPattern::from_entries(size, all).unwrap());
        let rows: Vec<Option<usize>> = (0..device.num_locals()).map(Some).collect();
        let offsets = device
            .declare_stamp()
            .entries()
            .iter()
            .map(|&(r, c)| pattern.offset(r, c))
            .collect();
        device.bind_offsets(DeviceBinding::new(rows, offsets));
        DaeSystem::new(pattern)
    }

    fn load(device: &dyn Device, sys: &mut DaeSystem, x: &[f64]) {
        let ctx = EvalContext::new(x, 0.0, AnalysisMode::Transient);
        let (mut res, mut jac) = sys.accumulators();
        assert!(device.load_residual(&ctx, &mut res));
        assert!(device.load_jacobian(&ctx, &mut jac));
    }

    #[test]
    fn test_resistor_stamp() {
        let mut r = Resistor::new("R1", NodeId::new(1), NodeId::new(2), 1000.0);
        let mut sys = bind_dense(&mut r, 2);
        load(&r, &mut sys, &[2.0, 1.0]);

        assert!((sys.f()[0] - 1e-3).abs() < 1e-15);
        assert!((sys.f()[1] + 1e-3).abs() < 1e-15);
        assert!((sys.dfdx().get(0, 0) - 1e-3).abs() < 1e-15);
        assert!((sys.dfdx().get(0, 1) + 1e-3).abs() < 1e-15);
    }

    #[test]
    fn test_capacitor_writes_q_only() {
        let mut c = Capacitor::new("C1", NodeId::new(1), NodeId::GROUND, 1e-6);
        let mut sys = bind_dense(&mut c, 2);
        load(&c, &mut sys, &[3.0, 0.0]);

        assert_eq!(sys.f()[0], 0.0);
        assert!((sys.q()[0] - 3e-6).abs() < 1e-18);
        assert!((sys.dqdx().get(0, 0) - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn test_inductor_branch_equation() {
        let mut l = Inductor::new("L1", NodeId::new(1), NodeId::new(2), 1e-3);
        let mut sys = bind_dense(&mut l, 3);
        load(&l, &mut sys, &[1.0, 0.25, 0.5]);

        assert_eq!(sys.f()[0], 0.5);
        assert_eq!(sys.f()[1], -0.5);
        assert_eq!(sys.f()[2], -0.75);
        assert!((sys.q()[2] - 0.5e-3).abs() < 1e-18);
        assert_eq!(sys.dfdx().get(2, 0), -1.0);
        assert_eq!(l.current_unknown(), Some(2));
    }

    #[test]
    fn test_stamp_is_stable() {
        let l = Inductor::new("L1", NodeId::new(1), NodeId::new(2), 1e-3);
        assert_eq!(l.declare_stamp(), l.declare_stamp());
        assert_eq!(l.num_locals(), 3);
    }
}
