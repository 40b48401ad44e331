//! Newton-Raphson driver with globalization and a layered convergence test.
//!
//! The driver never retries on its own: every outcome, including divergence
//! and linear-solve failure, is returned as a [`NewtonStatus`] for the caller
//! to act on.

use std::sync::Arc;

use nalgebra::DVector;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::linear::{DenseLu, LinearSolver, LinearStatus};
use crate::loader::AssemblyStatus;
use crate::norm::{
    has_non_finite, max_norm, two_norm, update_weights, weighted_rms, Reduction, SerialReduction,
};
use crate::options::{NewtonOptions, SearchMethod};
use crate::problem::NonlinearProblem;

/// Why a solve was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergedReason {
    /// Update and residual both below tolerance.
    Normal,
    /// Residual below machine precision.
    NormTooSmall,
    /// Weighted update below the small-update tolerance.
    SmallUpdate,
    /// An undamped step reduced the residual to round-off.
    ResidualReduced,
    /// Residual reduced enough before the iteration or stall limit.
    NearConvergence,
}

/// Why a solve gave up; recoverable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergedReason {
    TooManyIterations,
    UpdateTooBig,
    Stalled,
    SingularJacobian,
}

/// Why a solve failed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedReason {
    NonFinite,
    InnerSolveFailed,
    ZeroUpdate,
    LinearSolverFatal,
}

/// Terminal state of one nonlinear solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonStatus {
    Converged(ConvergedReason),
    Diverged(DivergedReason),
    Failed(FailedReason),
}

impl NewtonStatus {
    pub fn is_converged(self) -> bool {
        matches!(self, NewtonStatus::Converged(_))
    }
}

/// Result of [`NewtonSolver::solve`]. The iterate is updated in place.
#[derive(Debug, Clone, Copy)]
pub struct NewtonOutcome {
    pub status: NewtonStatus,
    pub iterations: usize,
    /// 2-norm of the final residual.
    pub residual_norm: f64,
    /// Weighted RMS norm of the final update, scaled by the step length.
    pub weighted_update: f64,
}

impl NewtonOutcome {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Monotonic work counters, reset only by [`NewtonSolver::reset_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NewtonCounters {
    pub nonlinear_solves: u64,
    pub iterations: u64,
    pub residual_loads: u64,
    pub jacobian_loads: u64,
    pub linear_solves: u64,
    pub failed_linear_solves: u64,
}

/// Per-solve iteration bookkeeping.
#[derive(Debug, Clone)]
struct IterationState {
    niters: usize,
    norm_f0: f64,
    norm_f: f64,
    max_f: f64,
    rate: f64,
    min_rate: f64,
    bad_steps: usize,
    weighted_update: f64,
    /// Norm of the Newton direction from the linear solve.
    update_norm: f64,
    /// The last update was the full Newton step.
    full_step: bool,
}

impl IterationState {
    fn new(norm_f: f64, max_f: f64) -> Self {
        Self {
            niters: 0,
            norm_f0: norm_f,
            norm_f,
            max_f,
            rate: 1.0,
            min_rate: f64::INFINITY,
            bad_steps: 0,
            weighted_update: 1.0,
            update_norm: f64::INFINITY,
            full_step: false,
        }
    }

    fn relative_rate(&self) -> f64 {
        if self.norm_f0 > 0.0 {
            self.norm_f / self.norm_f0
        } else {
            0.0
        }
    }

    fn record_residual(&mut self, norm_f: f64, max_f: f64, stagnation_tol: f64) {
        self.rate = if self.norm_f > 0.0 {
            norm_f / self.norm_f
        } else {
            1.0
        };
        self.norm_f = norm_f;
        self.max_f = max_f;
        self.min_rate = self.min_rate.min(self.rate);
        if (self.rate - 1.0).abs() <= stagnation_tol {
            self.bad_steps += 1;
        } else {
            self.bad_steps = 0;
        }
    }
}

/// Damped Newton solver over any [`NonlinearProblem`].
#[derive(Debug)]
pub struct NewtonSolver {
    options: NewtonOptions,
    linear: Box<dyn LinearSolver>,
    reduction: Arc<dyn Reduction>,
    counters: NewtonCounters,
}

impl NewtonSolver {
    /// Solver using dense LU and a serial reduction.
    pub fn new(options: NewtonOptions) -> Self {
        Self::with_linear_solver(options, Box::new(DenseLu::new()))
    }

    pub fn with_linear_solver(options: NewtonOptions, linear: Box<dyn LinearSolver>) -> Self {
        Self {
            options,
            linear,
            reduction: Arc::new(SerialReduction),
            counters: NewtonCounters::default(),
        }
    }

    /// Replace the reduction used for every global norm.
    pub fn with_reduction(mut self, reduction: Arc<dyn Reduction>) -> Self {
        self.reduction = reduction;
        self
    }

    /// Replace the linear solve collaborator.
    pub fn set_linear_solver(&mut self, linear: Box<dyn LinearSolver>) {
        self.linear = linear;
    }

    pub fn linear_solver_name(&self) -> &str {
        self.linear.name()
    }

    pub fn options(&self) -> &NewtonOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: NewtonOptions) {
        self.options = options;
    }

    pub fn reduction(&self) -> &Arc<dyn Reduction> {
        &self.reduction
    }

    pub fn counters(&self) -> NewtonCounters {
        self.counters
    }

    /// Zero every counter.
    pub fn reset_all(&mut self) {
        self.counters = NewtonCounters::default();
    }

    /// Drive `problem` to `R(x) = 0`, starting from and updating `x`.
    ///
    /// `previous` is the solution at the last accepted step; in transient
    /// mode it enters the update weights.
    pub fn solve(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        x: &mut DVector<f64>,
        previous: Option<&DVector<f64>>,
    ) -> Result<NewtonOutcome> {
        if x.len() != problem.size() {
            return Err(Error::DimensionMismatch {
                expected: problem.size(),
                actual: x.len(),
            });
        }
        let opts = self.options.clone();
        let reduction = self.reduction.clone();
        let red = reduction.as_ref();
        self.counters.nonlinear_solves += 1;

        let mut assembly = self.evaluate(problem, x, true)?;
        let mut state = IterationState::new(
            two_norm(problem.residual(), red),
            max_norm(problem.residual(), red),
        );
        let mut weights = update_weights(x, previous.unwrap_or(x), opts.rel_tol, opts.abs_tol);

        loop {
            if let Some(status) = self.test(&opts, &state, assembly, x, problem.residual()) {
                return Ok(self.finish(status, &state));
            }

            let rhs = -problem.residual();
            let solve = self.linear.solve(problem.jacobian(), &rhs);
            self.counters.linear_solves += 1;
            match solve.status {
                LinearStatus::Success => {}
                LinearStatus::Singular => {
                    self.counters.failed_linear_solves += 1;
                    log::warn!("newton: singular Jacobian at iteration {}", state.niters);
                    return Ok(self.finish(
                        NewtonStatus::Diverged(DivergedReason::SingularJacobian),
                        &state,
                    ));
                }
                LinearStatus::Fatal => {
                    self.counters.failed_linear_solves += 1;
                    log::error!("newton: linear solver {} failed", self.linear.name());
                    return Ok(self.finish(
                        NewtonStatus::Failed(FailedReason::LinearSolverFatal),
                        &state,
                    ));
                }
            }

            let x_old = x.clone();
            let (step_length, status) =
                self.line_search(problem, x, &x_old, &solve.delta, state.norm_f, &opts)?;
            assembly = status;
            state.niters += 1;
            self.counters.iterations += 1;

            let dx = &*x - &x_old;
            if !opts.is_transient() {
                weights = update_weights(x, &x_old, opts.rel_tol, opts.abs_tol);
            }
            state.weighted_update = weighted_rms(&dx, &weights, red) / step_length;
            state.update_norm = two_norm(&solve.delta, red);
            state.full_step = step_length == 1.0;
            state.record_residual(
                two_norm(problem.residual(), red),
                max_norm(problem.residual(), red),
                opts.stagnation_tol,
            );

            log::debug!(
                "newton iter {}: |F| = {:.3e}, max|F| = {:.3e}, |dx|_w = {:.3e}, step = {}",
                state.niters,
                state.norm_f,
                state.max_f,
                state.weighted_update,
                step_length
            );
        }
    }

    fn evaluate(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        x: &DVector<f64>,
        with_jacobian: bool,
    ) -> Result<AssemblyStatus> {
        self.counters.residual_loads += 1;
        if with_jacobian {
            self.counters.jacobian_loads += 1;
        }
        problem.evaluate(x, with_jacobian)
    }

    fn finish(&self, status: NewtonStatus, state: &IterationState) -> NewtonOutcome {
        match status {
            NewtonStatus::Converged(ConvergedReason::NearConvergence) => log::warn!(
                "newton: accepted near-converged solution after {} iterations",
                state.niters
            ),
            NewtonStatus::Converged(_) => {
                log::debug!("newton: converged in {} iterations ({:?})", state.niters, status)
            }
            _ => log::debug!("newton: {:?} after {} iterations", status, state.niters),
        }
        NewtonOutcome {
            status,
            iterations: state.niters,
            residual_norm: state.norm_f,
            weighted_update: state.weighted_update,
        }
    }

    /// Convergence tests, applied in priority order.
    fn test(
        &self,
        opts: &NewtonOptions,
        s: &IterationState,
        assembly: AssemblyStatus,
        x: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Option<NewtonStatus> {
        let red = self.reduction.as_ref();
        let transient = opts.is_transient();
        let at_max = s.niters >= opts.max_iterations;

        if has_non_finite(residual, red) || has_non_finite(x, red) {
            return Some(NewtonStatus::Failed(FailedReason::NonFinite));
        }
        if !red.all(assembly.inner_converged) {
            return Some(NewtonStatus::Failed(FailedReason::InnerSolveFailed));
        }
        if opts.enforce_device_convergence && !red.all(assembly.devices_converged) {
            return at_max.then_some(NewtonStatus::Diverged(DivergedReason::TooManyIterations));
        }
        if s.max_f < opts.rhs_tol && s.max_f < f64::EPSILON {
            return Some(NewtonStatus::Converged(ConvergedReason::NormTooSmall));
        }
        if s.niters > 0 && s.weighted_update == 0.0 && s.update_norm == 0.0 {
            return Some(NewtonStatus::Failed(FailedReason::ZeroUpdate));
        }
        if s.niters > 0
            && s.full_step
            && s.rate <= opts.residual_reduction_tol
            && s.max_f < opts.rhs_tol
        {
            return Some(NewtonStatus::Converged(ConvergedReason::ResidualReduced));
        }
        if s.weighted_update < opts.delta_x_tol && s.max_f < opts.rhs_tol {
            return Some(NewtonStatus::Converged(ConvergedReason::Normal));
        }
        if transient && at_max {
            let near = s.rate <= opts.near_convergence_rate
                && s.relative_rate() <= opts.near_convergence_relative_rate;
            return Some(if near {
                NewtonStatus::Converged(ConvergedReason::NearConvergence)
            } else {
                NewtonStatus::Diverged(DivergedReason::TooManyIterations)
            });
        }
        if transient && s.weighted_update < opts.small_update_tol {
            return Some(NewtonStatus::Converged(ConvergedReason::SmallUpdate));
        }
        if at_max {
            return Some(NewtonStatus::Diverged(DivergedReason::TooManyIterations));
        }
        if s.niters > 0 && s.rate > opts.max_convergence_rate {
            return Some(NewtonStatus::Diverged(DivergedReason::UpdateTooBig));
        }
        if transient && s.bad_steps >= opts.max_bad_steps {
            let near = s.relative_rate() <= opts.near_convergence_rate && s.min_rate <= 1.0;
            return Some(if near {
                NewtonStatus::Converged(ConvergedReason::NearConvergence)
            } else {
                NewtonStatus::Diverged(DivergedReason::Stalled)
            });
        }
        None
    }

    /// Apply the configured globalization to `dx`, leaving `x` at the
    /// accepted point and the problem evaluated there.
    fn line_search(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        x: &mut DVector<f64>,
        x_old: &DVector<f64>,
        dx: &DVector<f64>,
        norm_old: f64,
        opts: &NewtonOptions,
    ) -> Result<(f64, AssemblyStatus)> {
        const ARMIJO: f64 = 1e-4;
        let reduction = self.reduction.clone();
        let red = reduction.as_ref();

        x.copy_from(x_old);
        *x += dx;
        let mut status = self.evaluate(problem, x, true)?;
        if opts.search_method == SearchMethod::Full {
            return Ok((1.0, status));
        }

        let mut lambda = 1.0;
        for _ in 0..opts.max_search_steps {
            let norm = two_norm(problem.residual(), red);
            let next = if opts.search_method == SearchMethod::Divide {
                if norm.is_finite() && norm < norm_old {
                    break;
                }
                0.5 * lambda
            } else {
                // phi(l) = |F(x + l dx)|^2 / 2; the Newton direction has phi'(0) = -|F|^2.
                let phi0 = 0.5 * norm_old * norm_old;
                let slope = -norm_old * norm_old;
                let phi = 0.5 * norm * norm;
                if phi.is_finite() && phi <= phi0 + ARMIJO * lambda * slope {
                    break;
                }
                let denom = 2.0 * (phi - phi0 - slope * lambda);
                let model = if opts.search_method == SearchMethod::Backtrack
                    && phi.is_finite()
                    && denom > 0.0
                {
                    -slope * lambda * lambda / denom
                } else {
                    0.5 * lambda
                };
                model.clamp(0.1 * lambda, 0.5 * lambda)
            };
            log::debug!("newton: reducing step {} -> {} (|F| = {:.3e})", lambda, next, norm);
            lambda = next;
            x.copy_from(x_old);
            x.axpy(lambda, dx, 1.0);
            status = self.evaluate(problem, x, true)?;
        }
        Ok((lambda, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearSolve;
    use daestep_core::{SparseMatrix, SparsityPattern};
    use nalgebra::dvector;

    /// Dense test problem `R(x) = r(x)` with a caller-supplied evaluation.
    struct Closure<F> {
        eval: F,
        residual: DVector<f64>,
        jacobian: SparseMatrix,
        status: AssemblyStatus,
    }

    impl<F> Closure<F>
    where
        F: FnMut(&DVector<f64>) -> (DVector<f64>, Vec<f64>),
    {
        fn new(size: usize, eval: F) -> Self {
            let entries = (0..size).flat_map(|r| (0..size).map(move |c| (r, c)));
            let pattern = Arc::new(SparsityPattern::from_entries(size, entries).unwrap());
            Self {
                eval,
                residual: DVector::zeros(size),
                jacobian: SparseMatrix::new(pattern),
                status: AssemblyStatus::CONVERGED,
            }
        }
    }

    impl<F> NonlinearProblem for Closure<F>
    where
        F: FnMut(&DVector<f64>) -> (DVector<f64>, Vec<f64>),
    {
        fn size(&self) -> usize {
            self.residual.len()
        }

        fn evaluate(&mut self, x: &DVector<f64>, with_jacobian: bool) -> Result<AssemblyStatus> {
            let (r, j) = (self.eval)(x);
            self.residual = r;
            if with_jacobian {
                // Row-major dense values match the CSR order of a full pattern.
                self.jacobian.values_mut().copy_from_slice(&j);
            }
            Ok(self.status)
        }

        fn residual(&self) -> &DVector<f64> {
            &self.residual
        }

        fn jacobian(&self) -> &SparseMatrix {
            &self.jacobian
        }
    }

    fn linear_problem() -> Closure<impl FnMut(&DVector<f64>) -> (DVector<f64>, Vec<f64>)> {
        // [4 2; 2 4] x = [6; 6], solution (1, 1), exact in binary.
        Closure::new(2, |x: &DVector<f64>| {
            let r = dvector![4.0 * x[0] + 2.0 * x[1] - 6.0, 2.0 * x[0] + 4.0 * x[1] - 6.0];
            (r, vec![4.0, 2.0, 2.0, 4.0])
        })
    }

    #[test]
    fn test_linear_converges_in_one_iteration() {
        for options in [NewtonOptions::transient(), NewtonOptions::dc()] {
            let mut solver = NewtonSolver::new(options);
            let mut problem = linear_problem();
            let mut x = dvector![0.0, 0.0];
            let out = solver.solve(&mut problem, &mut x, None).unwrap();
            assert!(out.is_converged(), "status {:?}", out.status);
            assert_eq!(out.iterations, 1);
            assert_eq!(x, dvector![1.0, 1.0]);
        }
    }

    #[test]
    fn test_counters_accumulate_and_reset() {
        let mut solver = NewtonSolver::new(NewtonOptions::transient());
        for _ in 0..2 {
            let mut problem = linear_problem();
            let mut x = dvector![0.0, 0.0];
            solver.solve(&mut problem, &mut x, None).unwrap();
        }
        let c = solver.counters();
        assert_eq!(c.nonlinear_solves, 2);
        assert_eq!(c.iterations, 2);
        assert_eq!(c.linear_solves, 2);
        assert_eq!(c.residual_loads, 4);
        assert_eq!(c.jacobian_loads, 4);
        assert_eq!(c.failed_linear_solves, 0);

        solver.reset_all();
        assert_eq!(solver.counters(), NewtonCounters::default());
    }

    #[test]
    fn test_quadratic_converges() {
        let mut solver = NewtonSolver::new(NewtonOptions::dc());
        let mut problem = Closure::new(1, |x: &DVector<f64>| {
            (dvector![x[0] * x[0] - 2.0], vec![2.0 * x[0]])
        });
        let mut x = dvector![1.0];
        let out = solver.solve(&mut problem, &mut x, None).unwrap();
        assert!(out.is_converged(), "status {:?}", out.status);
        assert!((x[0] - 2f64.sqrt()).abs() < 1e-9, "x = {}", x[0]);
    }

    #[test]
    fn test_divide_search_rescues_overshoot() {
        // Plain Newton on atan diverges from |x0| > 1.39.
        let atan = |x: &DVector<f64>| (dvector![x[0].atan()], vec![1.0 / (1.0 + x[0] * x[0])]);

        let mut full = NewtonSolver::new(NewtonOptions {
            search_method: SearchMethod::Full,
            ..NewtonOptions::dc()
        });
        let mut x = dvector![2.0];
        let out = full.solve(&mut Closure::new(1, atan), &mut x, None).unwrap();
        assert!(!out.is_converged());

        let methods = [
            SearchMethod::Divide,
            SearchMethod::Backtrack,
            SearchMethod::SimpleBacktrack,
        ];
        for method in methods {
            let mut damped = NewtonSolver::new(NewtonOptions {
                search_method: method,
                ..NewtonOptions::dc()
            });
            let mut x = dvector![2.0];
            let out = damped.solve(&mut Closure::new(1, atan), &mut x, None).unwrap();
            assert!(out.is_converged(), "{:?}: {:?}", method, out.status);
            assert!(x[0].abs() < 1e-6, "{:?}: x = {}", method, x[0]);
        }
    }

    #[test]
    fn test_device_non_convergence_diverges_at_max_iterations() {
        let mut solver = NewtonSolver::new(NewtonOptions::transient());
        let mut problem = linear_problem();
        problem.status.devices_converged = false;
        let mut x = dvector![0.0, 0.0];
        let out = solver.solve(&mut problem, &mut x, None).unwrap();
        assert_eq!(
            out.status,
            NewtonStatus::Diverged(DivergedReason::TooManyIterations)
        );
        assert_eq!(out.iterations, 20);
    }

    #[test]
    fn test_device_flags_ignored_when_not_enforced() {
        let mut solver = NewtonSolver::new(NewtonOptions {
            enforce_device_convergence: false,
            ..NewtonOptions::transient()
        });
        let mut problem = linear_problem();
        problem.status.devices_converged = false;
        let mut x = dvector![0.0, 0.0];
        assert!(solver.solve(&mut problem, &mut x, None).unwrap().is_converged());
    }

    #[test]
    fn test_inner_failure_is_fatal() {
        let mut solver = NewtonSolver::new(NewtonOptions::transient());
        let mut problem = linear_problem();
        problem.status.inner_converged = false;
        let mut x = dvector![0.0, 0.0];
        let out = solver.solve(&mut problem, &mut x, None).unwrap();
        assert_eq!(out.status, NewtonStatus::Failed(FailedReason::InnerSolveFailed));
        assert_eq!(out.iterations, 0);
    }

    #[test]
    fn test_singular_jacobian_diverges() {
        let mut solver = NewtonSolver::new(NewtonOptions::transient());
        let mut problem = Closure::new(2, |x: &DVector<f64>| {
            (dvector![x[0] + x[1] - 1.0, 2.0 * x[0] + 2.0 * x[1]], vec![1.0, 1.0, 2.0, 2.0])
        });
        let mut x = dvector![0.0, 0.0];
        let out = solver.solve(&mut problem, &mut x, None).unwrap();
        assert_eq!(out.status, NewtonStatus::Diverged(DivergedReason::SingularJacobian));
        assert_eq!(solver.counters().failed_linear_solves, 1);
        assert_eq!(x, dvector![0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_residual_fails() {
        let mut solver = NewtonSolver::new(NewtonOptions::transient());
        let mut problem =
            Closure::new(1, |x: &DVector<f64>| (dvector![x[0].ln()], vec![1.0 / x[0]]));
        let mut x = dvector![-1.0];
        let out = solver.solve(&mut problem, &mut x, None).unwrap();
        assert_eq!(out.status, NewtonStatus::Failed(FailedReason::NonFinite));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut solver = NewtonSolver::new(NewtonOptions::transient());
        let mut problem = linear_problem();
        let mut x = dvector![0.0];
        assert!(matches!(
            solver.solve(&mut problem, &mut x, None),
            Err(Error::DimensionMismatch { .. })
        ));
    }

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
    fn test_fatal_linear_solve_is_reported() {
        let mut solver =
            NewtonSolver::with_linear_solver(NewtonOptions::transient(), Box::new(Unconfigured));
        assert_eq!(solver.linear_solver_name(), "unconfigured");
        let mut problem = linear_problem();
        let mut x = dvector![0.0, 0.0];
        let out = solver.solve(&mut problem, &mut x, None).unwrap();
        assert_eq!(out.status, NewtonStatus::Failed(FailedReason::LinearSolverFatal));
        assert_eq!(out.iterations, 0);
        assert_eq!(solver.counters().failed_linear_solves, 1);
        assert_eq!(x, dvector![0.0, 0.0]);
    }

    #[test]
    fn test_inexact_linear_system_converges_in_one_iteration() {
        // Coefficients with no exact binary representation leave a round-off
        // residual after the first step.
        let mut problem = Closure::new(2, |x: &DVector<f64>| {
            let r = dvector![
                3.3 * x[0] - 1.7 * x[1] - 13.7,
                -1.7 * x[0] + 4.7 * x[1] + 0.37
            ];
            (r, vec![3.3, -1.7, -1.7, 4.7])
        });
        for options in [NewtonOptions::dc(), NewtonOptions::transient()] {
            let mut solver = NewtonSolver::new(options);
            let mut x = dvector![0.0, 0.0];
            let out = solver.solve(&mut problem, &mut x, None).unwrap();
            assert!(out.is_converged(), "status {:?}", out.status);
            assert_eq!(out.iterations, 1);
        }
    }

    #[test]
    fn test_residual_reduction_can_be_disabled() {
        let mut problem = Closure::new(1, |x: &DVector<f64>| {
            (dvector![0.7 * x[0] - 13.7], vec![0.7])
        });
        let mut solver = NewtonSolver::new(NewtonOptions {
            residual_reduction_tol: 0.0,
            ..NewtonOptions::dc()
        });
        let mut x = dvector![0.0];
        let out = solver.solve(&mut problem, &mut x, None).unwrap();
        assert!(out.is_converged(), "status {:?}", out.status);
        assert_ne!(out.status, NewtonStatus::Converged(ConvergedReason::ResidualReduced));
    }
}
