//! Variable-order BDF time integration of `F(x, t) + dQ(x)/dt = 0`.
//!
//! The [`Integrator`] owns the [`Loader`], the divided-difference history
//! and the step controller. Each call to [`Integrator::step`] predicts,
//! corrects with Newton, runs the local error test and either commits the
//! step or shrinks it; breakpoints are landed on exactly and restart the
//! history at order one.

use std::sync::Arc;

use daestep_core::{Breakpoint, BreakpointSet};
use daestep_devices::AnalysisMode;
use nalgebra::DVector;
use serde::Serialize;

use crate::bdf::{BdfHistory, TransientProblem};
use crate::error::{Error, Result};
use crate::jacobian_check::{check_jacobian, JacobianCheck};
use crate::loader::Loader;
use crate::linear::LinearSolver;
use crate::newton::{FailedReason, NewtonCounters, NewtonOutcome, NewtonSolver, NewtonStatus};
use crate::norm::{Reduction, SerialReduction};
use crate::options::IntegratorOptions;
use crate::problem::SteadyStateProblem;
use crate::step_control::{ConsistentPoint, FailureKind, StepBounds, StepController};

/// A single accepted time point.
#[derive(Debug, Clone)]
pub struct TimePoint {
    /// Time value (s).
    pub time: f64,
    /// Solution vector at this time.
    pub solution: DVector<f64>,
}

/// Accepted points of a transient run.
#[derive(Debug, Clone)]
pub struct TransientResult {
    pub points: Vec<TimePoint>,
    /// Number of nodes (excluding ground).
    pub num_nodes: usize,
}

impl TransientResult {
    fn new(num_nodes: usize) -> Self {
        Self {
            points: Vec::new(),
            num_nodes,
        }
    }

    /// `(time, value)` pairs of one unknown across all points.
    pub fn waveform(&self, index: usize) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|tp| (tp.time, tp.solution[index]))
            .collect()
    }

    pub fn times(&self) -> Vec<f64> {
        self.points.iter().map(|tp| tp.time).collect()
    }

    pub fn last(&self) -> Option<&TimePoint> {
        self.points.last()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// How [`Integrator::integrate_to_time`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationStatus {
    /// The requested time was reached.
    Finished,
    /// A pause breakpoint was reached first.
    Paused,
}

/// Result of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Accepted {
        time: f64,
        step: f64,
        order: usize,
        /// The step ended on a breakpoint; the history restarts.
        at_breakpoint: bool,
        /// The breakpoint was a pause.
        paused: bool,
    },
    /// The attempt was undone; `time` is the unchanged current time.
    Rejected {
        time: f64,
        step: f64,
        reason: FailureKind,
    },
}

/// Work counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub residual_loads: u64,
    pub jacobian_loads: u64,
    pub linear_solves: u64,
    pub failed_linear_solves: u64,
    pub accepted_steps: u64,
    pub rejected_steps: u64,
    pub newton_failures: u64,
    pub error_test_failures: u64,
    /// Corrector solves only.
    pub newton: NewtonCounters,
    /// Operating-point solves only.
    pub operating_point: NewtonCounters,
}

#[derive(Debug, Clone, Copy, Default)]
struct StepStats {
    accepted: u64,
    rejected: u64,
    newton_failures: u64,
    error_test_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    /// The history must be rebuilt before the next step. `initial` marks
    /// the start of the run, as opposed to a breakpoint restart.
    Restart { initial: bool },
    Running,
}

#[derive(Debug)]
pub struct Integrator {
    loader: Loader,
    options: IntegratorOptions,
    newton: NewtonSolver,
    dc_newton: NewtonSolver,
    history: BdfHistory,
    control: StepController,
    breakpoints: BreakpointSet,
    result: TransientResult,
    stats: StepStats,
    solution: DVector<f64>,
    start_time: f64,
    final_time: f64,
    target: f64,
    time: f64,
    last_time: f64,
    restart_cap: Option<f64>,
    interpolation_valid: bool,
    state: State,
}

impl Integrator {
    pub fn new(loader: Loader, options: IntegratorOptions) -> Result<Self> {
        Self::with_reduction(loader, options, Arc::new(SerialReduction))
    }

    /// Build an integrator whose norms go through `reduction`.
    pub fn with_reduction(
        loader: Loader,
        options: IntegratorOptions,
        reduction: Arc<dyn Reduction>,
    ) -> Result<Self> {
        options.validate()?;
        let size = loader.size();
        let newton = NewtonSolver::new(options.newton.clone()).with_reduction(reduction.clone());
        let dc_newton =
            NewtonSolver::new(options.dc_newton.clone()).with_reduction(reduction.clone());
        let control = StepController::new(&options, size, reduction);
        let result = TransientResult::new(loader.num_nodes());
        log::info!(
            "integrator: {} unknowns, {} devices, max order {}",
            size,
            loader.devices().len(),
            options.max_order
        );
        Ok(Self {
            history: BdfHistory::new(size, options.max_order),
            loader,
            options,
            newton,
            dc_newton,
            control,
            breakpoints: BreakpointSet::new(),
            result,
            stats: StepStats::default(),
            solution: DVector::zeros(size),
            start_time: 0.0,
            final_time: 0.0,
            target: 0.0,
            time: 0.0,
            last_time: 0.0,
            restart_cap: None,
            interpolation_valid: false,
            state: State::Uninitialized,
        })
    }

    /// Use solvers built by `make` for the corrector and operating-point
    /// linear systems instead of dense LU.
    pub fn with_linear_solver<F>(mut self, make: F) -> Self
    where
        F: Fn() -> Box<dyn LinearSolver>,
    {
        self.newton.set_linear_solver(make());
        self.dc_newton.set_linear_solver(make());
        self
    }

    /// Solve `F(x, time) = 0` from a zero start and make it the current
    /// solution.
    pub fn solve_operating_point(&mut self, time: f64) -> Result<NewtonOutcome> {
        let mut x = DVector::zeros(self.loader.size());
        let outcome = {
            let mut problem = SteadyStateProblem::new(&mut self.loader, time, self.options.dc_gmin);
            self.dc_newton.solve(&mut problem, &mut x, None)?
        };
        if outcome.status == NewtonStatus::Failed(FailedReason::LinearSolverFatal) {
            return Err(Error::LinearSolverFailed {
                solver: self.dc_newton.linear_solver_name().to_string(),
                time,
            });
        }
        if !outcome.is_converged() {
            return Err(Error::OperatingPointFailed(format!(
                "{:?} after {} iterations, residual norm {:e}",
                outcome.status, outcome.iterations, outcome.residual_norm
            )));
        }
        self.loader
            .accept_step(&x, time, AnalysisMode::OperatingPoint);
        self.solution = x;
        self.time = time;
        log::info!(
            "integrator: operating point at t = {:e} in {} iterations",
            time,
            outcome.iterations
        );
        Ok(outcome)
    }

    /// Start a run over `[t0, t_end]` from the operating point at `t0`.
    pub fn initialize(&mut self, t0: f64, t_end: f64) -> Result<()> {
        check_span(t0, t_end)?;
        self.solve_operating_point(t0)?;
        self.begin(t0, t_end)
    }

    /// Start a run over `[t0, t_end]` from the given consistent state.
    pub fn initialize_from(&mut self, x0: DVector<f64>, t0: f64, t_end: f64) -> Result<()> {
        check_span(t0, t_end)?;
        if x0.len() != self.loader.size() {
            return Err(Error::DimensionMismatch {
                expected: self.loader.size(),
                actual: x0.len(),
            });
        }
        self.loader.accept_step(&x0, t0, AnalysisMode::Transient);
        self.solution = x0;
        self.begin(t0, t_end)
    }

    fn begin(&mut self, t0: f64, t_end: f64) -> Result<()> {
        if self.options.check_jacobian {
            check_jacobian(&mut self.loader, &self.solution, t0, &JacobianCheck::default())?
                .into_result()?;
        }
        self.start_time = t0;
        self.final_time = t_end;
        self.target = t_end;
        self.time = t0;
        self.last_time = t0;
        self.restart_cap = None;
        self.interpolation_valid = false;
        self.breakpoints.discard_before(t0);

        self.result = TransientResult::new(self.loader.num_nodes());
        self.record();
        self.state = State::Restart { initial: true };
        Ok(())
    }

    /// Merge device breakpoints in `(from, to]` into the set.
    fn collect_breakpoints(&mut self, from: f64, to: f64) -> Result<()> {
        if !self.options.breakpoints {
            return Ok(());
        }
        for bp in self.loader.breakpoints(from, to) {
            self.breakpoints.insert(bp)?;
        }
        Ok(())
    }

    /// Register a breakpoint the integration must land on.
    pub fn set_breakpoint(&mut self, time: f64) -> Result<()> {
        self.insert_future(Breakpoint::simple(time))
    }

    /// Register a breakpoint at which `integrate_to_time` returns
    /// [`IntegrationStatus::Paused`].
    pub fn set_pause_breakpoint(&mut self, time: f64) -> Result<()> {
        self.insert_future(Breakpoint::pause(time))
    }

    fn insert_future(&mut self, bp: Breakpoint) -> Result<()> {
        if bp.time <= self.time {
            return Err(Error::TimeOutOfRange {
                requested: bp.time,
                start: self.time,
                end: f64::INFINITY,
            });
        }
        self.breakpoints.insert(bp)?;
        Ok(())
    }

    /// Step until `t` or a pause breakpoint.
    ///
    /// Requesting a time past the end of the run extends it.
    pub fn integrate_to_time(&mut self, t: f64) -> Result<IntegrationStatus> {
        if self.state == State::Uninitialized {
            return Err(Error::NotInitialized);
        }
        if t < self.time {
            return Err(Error::TimeOutOfRange {
                requested: t,
                start: self.time,
                end: self.final_time,
            });
        }
        if t > self.final_time {
            self.final_time = t;
        }
        self.target = t;

        while self.time < t {
            if let StepOutcome::Accepted { paused: true, .. } = self.step()? {
                log::info!("integrator: paused at t = {:e}", self.time);
                return Ok(IntegrationStatus::Paused);
            }
        }
        log::info!(
            "integrator: reached t = {:e} after {} steps ({} rejected)",
            self.time,
            self.stats.accepted,
            self.stats.rejected
        );
        Ok(IntegrationStatus::Finished)
    }

    fn bounds(&self) -> StepBounds {
        let c = &self.options.constants;
        let min_step = self.time.abs() * c.min_step_precision * f64::EPSILON;
        let span = self.final_time - self.start_time;
        let mut max_step = self.options.max_step.unwrap_or(0.1 * span);
        if let Some(cap) = self.loader.max_time_step() {
            max_step = max_step.min(cap);
        }
        if let Some(cap) = self.restart_cap {
            max_step = max_step.min(cap);
        }
        StepBounds {
            min_step,
            max_step: max_step.max(min_step),
        }
    }

    /// Attempt one step towards the current target.
    ///
    /// Recoverable failures come back as [`StepOutcome::Rejected`] with
    /// the step already shrunk; `Err` means the run cannot continue, and
    /// the last accepted point stays current.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let initial = match self.state {
            State::Uninitialized => return Err(Error::NotInitialized),
            State::Restart { initial } => Some(initial),
            State::Running => None,
        };
        if self.time >= self.target {
            return Err(Error::TimeOutOfRange {
                requested: self.time,
                start: self.start_time,
                end: self.target,
            });
        }

        let mut bounds = self.bounds();
        let tol = 2.0 * bounds.min_step;
        self.breakpoints.set_tolerance(tol);
        self.breakpoints.discard_before(self.last_time);
        self.collect_breakpoints(self.time, self.final_time)?;
        let stop_time = match self.breakpoints.next_after(self.time) {
            Some(bp) if bp.time < self.target - tol => bp.time,
            _ => self.target,
        };

        if let Some(initial) = initial {
            let span = stop_time - self.time;
            self.restart_cap = self
                .options
                .min_steps_per_breakpoint
                .map(|n| span / n.max(1) as f64);
            bounds = self.bounds();
            self.loader
                .assemble(&self.solution, self.time, AnalysisMode::Transient, false)?;
            let q0 = self.loader.system().q().clone();
            let f0 = self.loader.system().f().clone();
            let point = ConsistentPoint {
                x: &self.solution,
                q: &q0,
                f: &f0,
            };
            self.control
                .start(&mut self.history, point, span, bounds, !initial);
            self.state = State::Running;
            self.interpolation_valid = false;
        }

        let remaining = stop_time - self.time;
        let mut h = self.control.step().min(bounds.max_step);
        let landing = h >= remaining || remaining - h <= tol;
        if landing {
            h = remaining;
        }
        if h <= 0.0 || (h < bounds.min_step && !landing) {
            return Err(Error::StepTooSmall {
                time: self.time,
                step: h,
                min_step: bounds.min_step,
            });
        }
        let next_time = if landing { stop_time } else { self.time + h };

        self.control.set_step(h);
        let order = self.control.order();
        self.history.update_coefficients(
            h,
            order,
            self.control.used_step(),
            self.control.used_order(),
        );
        self.history.predict(order);

        let mut x = self.history.predicted_x().clone();
        let outcome = {
            let mut problem = TransientProblem::new(&mut self.loader, &self.history, next_time);
            self.newton
                .solve(&mut problem, &mut x, Some(&self.solution))?
        };
        if outcome.status == NewtonStatus::Failed(FailedReason::LinearSolverFatal) {
            self.history.restore(h, order);
            return Err(Error::LinearSolverFailed {
                solver: self.newton.linear_solver_name().to_string(),
                time: next_time,
            });
        }

        let failure = if !outcome.is_converged() {
            Some(FailureKind::Newton)
        } else {
            self.control
                .estimate_error(&self.history, &x, &self.solution);
            if self.control.error_test_passes() {
                None
            } else {
                Some(FailureKind::ErrorTest)
            }
        };

        match failure {
            None => Ok(self.accept(x, next_time, h, order, stop_time, bounds)),
            Some(reason) => {
                self.stats.rejected += 1;
                match reason {
                    FailureKind::Newton => self.stats.newton_failures += 1,
                    FailureKind::ErrorTest => self.stats.error_test_failures += 1,
                }
                log::warn!(
                    "integrator: step {:e} at t = {:e} rejected ({:?}, {:?} in {} its, err {:e})",
                    h,
                    self.time,
                    reason,
                    outcome.status,
                    outcome.iterations,
                    self.control.error_estimate()
                );
                self.control.reject(
                    &mut self.history,
                    reason,
                    self.time,
                    stop_time - self.time,
                    bounds,
                )?;
                if h <= bounds.min_step && !landing {
                    return Err(Error::StepTooSmall {
                        time: self.time,
                        step: self.control.step(),
                        min_step: bounds.min_step,
                    });
                }
                Ok(StepOutcome::Rejected {
                    time: self.time,
                    step: h,
                    reason,
                })
            }
        }
    }

    fn accept(
        &mut self,
        x: DVector<f64>,
        next_time: f64,
        h: f64,
        order: usize,
        stop_time: f64,
        bounds: StepBounds,
    ) -> StepOutcome {
        let q = self.loader.system().q().clone();
        self.control
            .complete(&mut self.history, &x, &q, stop_time - next_time, bounds);

        self.last_time = self.time;
        self.time = next_time;
        self.solution = x;
        self.loader
            .accept_step(&self.solution, next_time, AnalysisMode::Transient);
        self.stats.accepted += 1;
        self.interpolation_valid = true;
        self.record();

        let hit = self.breakpoints.find(next_time);
        if hit.is_some() {
            self.breakpoints.discard_before(next_time + self.breakpoints.tolerance());
            self.state = State::Restart { initial: false };
        }
        let paused = hit.is_some_and(|bp| bp.is_pause());
        log::debug!(
            "integrator: accepted t = {:e}, h = {:e}, order {}{}",
            next_time,
            h,
            order,
            if hit.is_some() { " (breakpoint)" } else { "" }
        );
        StepOutcome::Accepted {
            time: next_time,
            step: h,
            order,
            at_breakpoint: hit.is_some(),
            paused,
        }
    }

    fn record(&mut self) {
        let point = TimePoint {
            time: self.time,
            solution: self.solution.clone(),
        };
        if !self.options.record_points {
            self.result.points.clear();
        }
        self.result.points.push(point);
    }

    /// Solution at any time within the last accepted step.
    pub fn interpolate(&self, t: f64) -> Result<DVector<f64>> {
        if t == self.time {
            return Ok(self.solution.clone());
        }
        let start = self.time - self.control.used_step();
        if !self.interpolation_valid || t > self.time || t < start {
            return Err(Error::TimeOutOfRange {
                requested: t,
                start,
                end: self.time,
            });
        }
        Ok(self
            .history
            .interpolate(t, self.time, self.control.used_order()))
    }

    pub fn current_solution(&self) -> &DVector<f64> {
        &self.solution
    }

    pub fn current_time(&self) -> f64 {
        self.time
    }

    /// Step size the next attempt will use.
    pub fn next_step(&self) -> f64 {
        self.control.step()
    }

    /// Order the next attempt will use.
    pub fn order(&self) -> usize {
        self.control.order()
    }

    pub fn result(&self) -> &TransientResult {
        &self.result
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let newton = self.newton.counters();
        let operating_point = self.dc_newton.counters();
        Diagnostics {
            residual_loads: self.loader.residual_loads(),
            jacobian_loads: self.loader.jacobian_loads(),
            linear_solves: newton.linear_solves + operating_point.linear_solves,
            failed_linear_solves: newton.failed_linear_solves
                + operating_point.failed_linear_solves,
            accepted_steps: self.stats.accepted,
            rejected_steps: self.stats.rejected,
            newton_failures: self.stats.newton_failures,
            error_test_failures: self.stats.error_test_failures,
            newton,
            operating_point,
        }
    }

    /// Zero every diagnostic counter.
    pub fn reset_all(&mut self) {
        self.newton.reset_all();
        self.dc_newton.reset_all();
        self.loader.reset_counters();
        self.stats = StepStats::default();
    }
}

fn check_span(t0: f64, t_end: f64) -> Result<()> {
    if t0.is_finite() && t_end.is_finite() && t_end > t0 {
        Ok(())
    } else {
        Err(Error::InvalidOptions(format!(
            "integration interval [{t0:e}, {t_end:e}] is empty"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::{LinearSolve, LinearStatus};
    use daestep_core::{NodeId, SparseMatrix};
    use daestep_devices::{BoxedDevice, Capacitor, CurrentSource, Resistor};

    fn rc_loader() -> Loader {
        let devices: Vec<BoxedDevice> = vec![
            Box::new(Resistor::new("R1", NodeId::new(1), NodeId::GROUND, 1.0)),
            Box::new(Capacitor::new("C1", NodeId::new(1), NodeId::GROUND, 1.0)),
        ];
        Loader::new(devices, 1).unwrap()
    }

    #[test]
    fn test_step_before_initialize() {
        let mut integ = Integrator::new(rc_loader(), IntegratorOptions::default()).unwrap();
        assert!(matches!(integ.step(), Err(Error::NotInitialized)));
        assert!(matches!(integ.integrate_to_time(1.0), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_empty_interval_rejected() {
        let mut integ = Integrator::new(rc_loader(), IntegratorOptions::default()).unwrap();
        assert!(integ.initialize(1.0, 1.0).is_err());
    }

    #[test]
    fn test_dimension_checked() {
        let mut integ = Integrator::new(rc_loader(), IntegratorOptions::default()).unwrap();
        let err = integ
            .initialize_from(DVector::zeros(3), 0.0, 1.0)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 1, actual: 3 }));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let opts = IntegratorOptions {
            rel_tol: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            Integrator::new(rc_loader(), opts),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_past_breakpoint_rejected() {
        let mut integ = Integrator::new(rc_loader(), IntegratorOptions::default()).unwrap();
        integ
            .initialize_from(DVector::from_vec(vec![1.0]), 0.0, 1.0)
            .unwrap();
        assert!(integ.set_breakpoint(0.0).is_err());
        assert!(integ.set_pause_breakpoint(0.5).is_ok());
    }

    #[test]
    fn test_first_step_lands_on_stop_time() {
        let opts = IntegratorOptions {
            fixed_initial_step: Some(1.0),
            max_step: Some(10.0),
            ..Default::default()
        };
        let mut integ = Integrator::new(rc_loader(), opts).unwrap();
        integ
            .initialize_from(DVector::from_vec(vec![1.0]), 0.0, 1.0)
            .unwrap();
        match integ.step().unwrap() {
            StepOutcome::Accepted { time, step, order, .. } => {
                assert_eq!(time, 1.0);
                assert_eq!(step, 1.0);
                assert_eq!(order, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!((integ.current_solution()[0] - 0.5).abs() < 1e-12);
        assert_eq!(integ.result().len(), 2);
    }

    #[test]
    fn test_record_points_off_keeps_last() {
        let opts = IntegratorOptions {
            record_points: false,
            ..Default::default()
        };
        let mut integ = Integrator::new(rc_loader(), opts).unwrap();
        integ
            .initialize_from(DVector::from_vec(vec![1.0]), 0.0, 1e-3)
            .unwrap();
        integ.integrate_to_time(1e-3).unwrap();
        assert_eq!(integ.result().len(), 1);
        assert_eq!(integ.result().last().unwrap().time, 1e-3);
    }

    /// Linear solver that reports a configuration failure on every call.
    #[derive(Debug)]
    struct Unconfigured;

    impl LinearSolver for Unconfigured {
        fn solve(&mut self, _jacobian: &SparseMatrix, rhs: &DVector<f64>) -> LinearSolve {
            LinearSolve {
                delta: DVector::zeros(rhs.len()),
                status: LinearStatus::Fatal,
            }
        }

        fn name(&self) -> &str {
            "unconfigured"
        }
    }

    #[test]
    fn test_fatal_linear_solve_aborts_step() {
        let opts = IntegratorOptions {
            fixed_initial_step: Some(0.1),
            ..Default::default()
        };
        let mut integ = Integrator::new(rc_loader(), opts)
            .unwrap()
            .with_linear_solver(|| Box::new(Unconfigured));
        integ
            .initialize_from(DVector::from_vec(vec![1.0]), 0.0, 1.0)
            .unwrap();

        let err = integ.step().unwrap_err();
        assert!(
            matches!(err, Error::LinearSolverFailed { ref solver, .. } if solver == "unconfigured"),
            "unexpected {:?}",
            err
        );
        assert_eq!(integ.current_time(), 0.0);
        assert_eq!(integ.current_solution()[0], 1.0);
        let diag = integ.diagnostics();
        assert_eq!(diag.rejected_steps, 0);
        assert_eq!(diag.failed_linear_solves, 1);
    }

    #[test]
    fn test_fatal_linear_solve_fails_operating_point() {
        let devices: Vec<BoxedDevice> = vec![
            Box::new(CurrentSource::dc("I1", NodeId::GROUND, NodeId::new(1), 1.0)),
            Box::new(Resistor::new("R1", NodeId::new(1), NodeId::GROUND, 1.0)),
        ];
        let loader = Loader::new(devices, 1).unwrap();
        let mut integ = Integrator::new(loader, IntegratorOptions::default())
            .unwrap()
            .with_linear_solver(|| Box::new(Unconfigured));
        assert!(matches!(
            integ.initialize(0.0, 1.0),
            Err(Error::LinearSolverFailed { .. })
        ));
    }
}
