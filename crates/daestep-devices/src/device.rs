//! The device contribution interface.
//!
//! Every device kind implements [`Device`]. The assembler drives a device
//! through a fixed lifecycle:
//!
//! 1. [`Device::declare_stamp`] once, to learn the sparsity pattern.
//! 2. [`Device::bind_offsets`] once the global layout is fixed.
//! 3. Per evaluation: [`Device::update_state`], then [`Device::load_residual`]
//!    and, when a Jacobian is wanted, [`Device::load_jacobian`].
//! 4. [`Device::accept_step`] after every accepted time step.
//!
//! Local unknowns are numbered terminals first, then internal unknowns.

use std::fmt::Debug;

use daestep_core::{
    Breakpoint, DeviceBinding, JacobianAccumulator, NodeId, ResidualAccumulator, StampPattern,
};

/// A boxed device trait object, as held by the assembler.
pub type BoxedDevice = Box<dyn Device>;

/// Which equations are being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    /// Steady state: time derivatives vanish, only F is solved.
    OperatingPoint,
    /// Time integration: F + dQ/dt is solved.
    Transient,
}

/// Read-only inputs to one device evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Candidate global solution.
    pub solution: &'a [f64],
    /// Time at which sources are evaluated.
    pub time: f64,
    pub mode: AnalysisMode,
}

impl<'a> EvalContext<'a> {
    pub fn new(solution: &'a [f64], time: f64, mode: AnalysisMode) -> Self {
        Self {
            solution,
            time,
            mode,
        }
    }
}

/// Outcome of [`Device::update_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateStatus {
    #[default]
    Converged,
    /// A limiting or clamping algorithm altered the evaluation point.
    NotConverged,
    /// A nested solve inside the device did not converge.
    InnerSolveFailed,
}

impl StateStatus {
    pub fn is_converged(self) -> bool {
        self == StateStatus::Converged
    }
}

/// Contribution capability shared by all device kinds.
pub trait Device: Debug + Send + Sync {
    /// Instance name (e.g. "R1").
    fn name(&self) -> &str;

    /// Terminal nodes, in local-index order.
    fn terminals(&self) -> &[NodeId];

    /// Extra unknowns owned by this device (branch currents, internal nodes).
    fn num_internal_unknowns(&self) -> usize {
        0
    }

    /// Total local unknowns: terminals followed by internal unknowns.
    fn num_locals(&self) -> usize {
        self.terminals().len() + self.num_internal_unknowns()
    }

    /// Local (row, column) pairs this device will ever write.
    ///
    /// Must be deterministic and independent of the solution.
    fn declare_stamp(&self) -> StampPattern;

    /// Store the resolved global rows and Jacobian offsets.
    fn bind_offsets(&mut self, binding: DeviceBinding);

    /// Refresh internal state from the candidate solution.
    fn update_state(&mut self, _ctx: &EvalContext<'_>) -> StateStatus {
        StateStatus::Converged
    }

    /// Add F and Q contributions. Returns `false` to flag non-convergence.
    fn load_residual(&self, ctx: &EvalContext<'_>, res: &mut ResidualAccumulator<'_>) -> bool;

    /// Add dF/dx and dQ/dx contributions. Returns `false` to flag
    /// non-convergence.
    fn load_jacobian(&self, ctx: &EvalContext<'_>, jac: &mut JacobianAccumulator<'_>) -> bool;

    /// Discontinuity times in `(from, to]` the integrator must land on.
    fn breakpoints(&self, _from: f64, _to: f64) -> Vec<Breakpoint> {
        Vec::new()
    }

    /// Largest step this device tolerates, if it has an opinion.
    fn max_time_step(&self) -> Option<f64> {
        None
    }

    /// Commit state after an accepted time step.
    fn accept_step(&mut self, _ctx: &EvalContext<'_>) {}

    /// True if the device currently contributes nothing and may be skipped.
    fn is_masked(&self) -> bool {
        false
    }
}
