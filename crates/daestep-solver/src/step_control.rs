//! Local error estimation and step size / order selection for the BDF
//! integrator.
//!
//! The controller owns the step size and order. After every corrector
//! attempt the integrator asks it to [`estimate_error`], then either
//! [`complete`] or [`reject`] the step; both update the history and choose
//! the next step size and order.
//!
//! [`estimate_error`]: StepController::estimate_error
//! [`complete`]: StepController::complete
//! [`reject`]: StepController::reject

use std::f64::consts::SQRT_2;
use std::sync::Arc;

use nalgebra::DVector;

use crate::bdf::BdfHistory;
use crate::error::{Error, Result};
use crate::norm::{max_norm, weighted_rms, Reduction};
use crate::options::{IntegratorOptions, StepControlConstants};

/// Admissible step range at the current time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepBounds {
    pub min_step: f64,
    pub max_step: f64,
}

impl StepBounds {
    pub fn clamp(&self, h: f64) -> f64 {
        h.min(self.max_step).max(self.min_step)
    }
}

/// Why a step attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The corrector did not converge; the error estimate is not trusted.
    Newton,
    /// The corrector converged but the local error was too large.
    ErrorTest,
}

/// A consistent point `(x, Q(x), F(x))` to restart the history from.
#[derive(Debug, Clone, Copy)]
pub struct ConsistentPoint<'a> {
    pub x: &'a DVector<f64>,
    pub q: &'a DVector<f64>,
    pub f: &'a DVector<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderAction {
    Lower,
    Maintain,
    Raise,
}

/// Error estimates at orders k-2 through k+1 for the step just attempted.
#[derive(Debug, Clone, Copy, Default)]
struct ErrorTerms {
    est_over_tol: f64,
    est: f64,
    tk: f64,
    ekm1: f64,
    tkm1: f64,
    ekp1: f64,
    new_order: usize,
}

#[derive(Debug)]
pub struct StepController {
    constants: StepControlConstants,
    rel_tol: f64,
    abs_tol: f64,
    error_acceptance: f64,
    initial_step: f64,
    fixed_initial_step: Option<f64>,
    min_order: usize,
    max_order: usize,
    max_failures: usize,
    test_first_step: bool,
    reduction: Arc<dyn Reduction>,

    step: f64,
    order: usize,
    used_order: usize,
    used_step: f64,
    last_step: f64,
    number_of_steps: usize,
    failures: usize,
    initial_phase: bool,
    terms: ErrorTerms,
    correction: DVector<f64>,
    weights: DVector<f64>,
}

impl StepController {
    pub fn new(options: &IntegratorOptions, size: usize, reduction: Arc<dyn Reduction>) -> Self {
        Self {
            constants: options.constants.clone(),
            rel_tol: options.rel_tol,
            abs_tol: options.abs_tol,
            error_acceptance: options.error_acceptance,
            initial_step: options.initial_step,
            fixed_initial_step: options.fixed_initial_step,
            min_order: options.min_order,
            max_order: options.max_order,
            max_failures: options.max_failures,
            test_first_step: options.test_first_step,
            reduction,
            step: 0.0,
            order: 1,
            used_order: 1,
            used_step: 0.0,
            last_step: 0.0,
            number_of_steps: 0,
            failures: 0,
            initial_phase: true,
            terms: ErrorTerms::default(),
            correction: DVector::zeros(size),
            weights: DVector::zeros(size),
        }
    }

    /// Step size for the next attempt.
    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn set_step(&mut self, h: f64) {
        self.step = h;
    }

    /// Order for the next attempt.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Order of the last accepted step.
    pub fn used_order(&self) -> usize {
        self.used_order
    }

    /// Size of the last accepted step.
    pub fn used_step(&self) -> f64 {
        self.used_step
    }

    /// Steps accepted since the last restart.
    pub fn number_of_steps(&self) -> usize {
        self.number_of_steps
    }

    /// Consecutive failed attempts since the last accepted step.
    pub fn consecutive_failures(&self) -> usize {
        self.failures
    }

    /// Scaled error estimate of the last attempt; at most the acceptance
    /// threshold means the step is accurate enough.
    pub fn error_estimate(&self) -> f64 {
        self.terms.est_over_tol
    }

    /// Choose the first step after a start or restart and reset `history`
    /// to order one at `point`.
    ///
    /// `restarted` is false only at the very beginning of the integration.
    pub fn start(
        &mut self,
        history: &mut BdfHistory,
        point: ConsistentPoint<'_>,
        time_to_stop: f64,
        bounds: StepBounds,
        restarted: bool,
    ) -> f64 {
        let c = &self.constants;
        let red = self.reduction.as_ref();
        let q_weights = point.q.map(|q| self.rel_tol * q.abs() + self.abs_tol);
        let dnorm_q = weighted_rms(point.f, &q_weights, red);

        let span = time_to_stop.abs();
        let mut h = c.h0_max_factor * span;
        if dnorm_q > 0.0 {
            h = h.min(SQRT_2 / (c.h0_safety * dnorm_q));
        }
        h = h.min(self.initial_step).min(bounds.max_step);
        if restarted && self.last_step > 0.0 {
            h = h.min(self.last_step);
        }
        if let (Some(fixed), false) = (self.fixed_initial_step, restarted) {
            h = fixed.min(bounds.max_step);
        }
        h = h.min(span).max(bounds.min_step);

        history.initialize(point.x, point.q, point.f, h);
        self.step = h;
        self.order = 1;
        self.used_order = 1;
        self.number_of_steps = 0;
        self.failures = 0;
        self.initial_phase = true;
        log::debug!("bdf: start with h = {:e} (dnorm_q = {:e})", h, dnorm_q);
        h
    }

    /// Scaled local error of the corrected solution `x`.
    ///
    /// `current` is the solution at the start of the step; its largest
    /// entry sets the error weights.
    pub fn estimate_error(
        &mut self,
        history: &BdfHistory,
        x: &DVector<f64>,
        current: &DVector<f64>,
    ) -> f64 {
        let red = self.reduction.as_ref();
        self.correction.copy_from(x);
        self.correction -= history.predicted_x();
        let weight = self.rel_tol * max_norm(current, red) + self.abs_tol;
        self.weights.fill(weight);
        let est = history.coefficients().ck * weighted_rms(&self.correction, &self.weights, red);
        self.terms.est_over_tol = if est.is_finite() { est } else { f64::INFINITY };
        self.terms.est_over_tol
    }

    /// Whether the last estimate is acceptable.
    ///
    /// The first step after a restart is accepted without the test unless
    /// configured otherwise; the history there has no error information.
    pub fn error_test_passes(&self) -> bool {
        if self.number_of_steps == 0 && !self.test_first_step {
            return true;
        }
        self.terms.est_over_tol <= self.error_acceptance
    }

    fn norm(&self, v: &DVector<f64>) -> f64 {
        weighted_rms(v, &self.weights, self.reduction.as_ref())
    }

    /// Decide whether to drop an order regardless of the error test.
    fn check_reduce_order(&mut self, history: &BdfHistory) {
        let k = self.order;
        let c = history.coefficients();
        let ek = c.sigma[k] * self.terms.est_over_tol;
        let tk = (k + 1) as f64 * ek;
        let mut est = ek;
        let mut new_order = k;
        let (mut ekm1, mut tkm1) = (0.0, 0.0);

        if k > 1 {
            let km1 = history.x_history(k) + &self.correction;
            ekm1 = c.sigma[k - 1] * c.ck * self.norm(&km1);
            tkm1 = k as f64 * ekm1;
            let lower = if k > 2 {
                let km2 = km1 + history.x_history(k - 1);
                let ekm2 = c.sigma[k - 2] * c.ck * self.norm(&km2);
                let tkm2 = (k - 1) as f64 * ekm2;
                tkm1.max(tkm2) <= tk
            } else {
                tkm1 <= self.constants.tkm1_tk_safety * tk
            };
            if lower {
                new_order = k - 1;
                est = ekm1;
            }
        }

        let t = &mut self.terms;
        t.tk = tk;
        t.ekm1 = ekm1;
        t.tkm1 = tkm1;
        t.est = est;
        t.new_order = new_order;
    }

    /// Undo a failed attempt and shrink the step.
    ///
    /// Fails once `max_failures` consecutive attempts have been rejected.
    pub fn reject(
        &mut self,
        history: &mut BdfHistory,
        kind: FailureKind,
        time: f64,
        time_to_stop: f64,
        bounds: StepBounds,
    ) -> Result<()> {
        self.check_reduce_order(history);
        self.initial_phase = false;
        self.failures += 1;
        history.restore(self.step, self.order);
        if self.failures >= self.max_failures {
            return Err(Error::TooManyFailures {
                time,
                failures: self.failures,
            });
        }

        let c = &self.constants;
        let mut new_order = self.terms.new_order;
        let rr = match (kind, self.failures) {
            (FailureKind::Newton, n) => {
                if n > 2 {
                    new_order = 1;
                }
                c.r_min
            }
            (FailureKind::ErrorTest, 1) => {
                let exponent = -1.0 / (new_order as f64 + 1.0);
                let rr = c.r_factor * (c.r_safety * (self.terms.est + c.r_fudge)).powf(exponent);
                rr.min(c.r_max).max(c.r_min)
            }
            (FailureKind::ErrorTest, 2) => c.r_min,
            (FailureKind::ErrorTest, _) => {
                new_order = 1;
                c.r_min
            }
        };
        if new_order >= self.min_order {
            self.order = new_order;
        }

        let mut new_step = rr * self.step;
        if self.number_of_steps == 0 {
            history.rescale_first_step(rr, new_step);
        }
        new_step = bounds.clamp(new_step);
        if new_step > time_to_stop {
            new_step = time_to_stop;
        }
        log::debug!(
            "bdf: rejected ({:?}) h = {:e}, retry with h = {:e}, order {}",
            kind,
            self.step,
            new_step,
            self.order
        );
        self.step = new_step;
        Ok(())
    }

    /// Commit an accepted step with corrected solution `x` and charge `q`,
    /// then choose the next step size and order.
    ///
    /// `time_to_stop` is measured from the end of the accepted step.
    pub fn complete(
        &mut self,
        history: &mut BdfHistory,
        x: &DVector<f64>,
        q: &DVector<f64>,
        time_to_stop: f64,
        bounds: StepBounds,
    ) {
        self.number_of_steps += 1;
        self.failures = 0;
        self.last_step = self.step;
        self.check_reduce_order(history);

        let k = self.order;
        let order_diff = k as isize - self.used_order as isize;
        self.used_order = k;
        self.used_step = self.step;
        let c = self.constants.clone();

        if self.terms.new_order + 1 == k || k == self.max_order {
            self.initial_phase = false;
        }

        let mut new_step = self.step;
        if self.initial_phase {
            self.order += 1;
            new_step = c.h_phase0_incr * self.step;
        } else {
            let nscsco = history.coefficients().nscsco;
            let mut action = if self.terms.new_order + 1 == k {
                OrderAction::Lower
            } else if self.terms.new_order == self.max_order
                || k + 1 >= nscsco
                || order_diff == 1
            {
                OrderAction::Maintain
            } else {
                self.compare_higher_order(history, &c)
            };

            if k < self.min_order {
                action = OrderAction::Raise;
            } else if k == self.min_order && action == OrderAction::Lower {
                action = OrderAction::Maintain;
            }
            if k == self.max_order && action == OrderAction::Raise {
                action = OrderAction::Maintain;
            }

            let mut est = self.terms.est;
            match action {
                OrderAction::Raise => {
                    self.order += 1;
                    est = self.terms.ekp1;
                }
                OrderAction::Lower => {
                    self.order -= 1;
                    est = self.terms.ekm1;
                }
                OrderAction::Maintain => {}
            }

            let rr = (c.r_safety * (est + c.r_fudge)).powf(-1.0 / (self.order as f64 + 1.0));
            if rr >= c.r_hincr_test {
                new_step = c.r_hincr * self.step;
            } else if rr <= 1.0 {
                new_step = rr.min(c.r_max).max(c.r_min) * self.step;
            }
        }

        history.update(x, q, self.used_order);

        if time_to_stop > 0.0 {
            new_step = bounds.clamp(new_step);
            if new_step > time_to_stop {
                new_step = time_to_stop;
            }
        }
        log::trace!(
            "bdf: accepted h = {:e} at order {}, next h = {:e} at order {}",
            self.used_step,
            self.used_order,
            new_step,
            self.order
        );
        self.step = new_step;
    }

    /// Order action from the order k+1 estimate, which needs `k + 1`
    /// constant steps of history.
    fn compare_higher_order(
        &mut self,
        history: &BdfHistory,
        c: &StepControlConstants,
    ) -> OrderAction {
        let k = self.order;
        let coeffs = history.coefficients();
        let diff = &self.correction - history.x_history(k + 1);
        let tkp1 = coeffs.ck * self.norm(&diff);
        self.terms.ekp1 = tkp1 / (k + 2) as f64;
        let t = &self.terms;
        if k == 1 {
            if tkp1 >= c.tkp1_tk_safety * t.tk {
                OrderAction::Maintain
            } else {
                OrderAction::Raise
            }
        } else if t.tkm1 <= t.tk.min(tkp1) {
            OrderAction::Lower
        } else if tkp1 >= t.tk {
            OrderAction::Maintain
        } else {
            OrderAction::Raise
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::norm::SerialReduction;
    use nalgebra::dvector;

    const BOUNDS: StepBounds = StepBounds {
        min_step: 0.0,
        max_step: 10.0,
    };

    fn controller(options: &IntegratorOptions) -> (StepController, BdfHistory) {
        let ctl = StepController::new(options, 1, Arc::new(SerialReduction));
        (ctl, BdfHistory::new(1, options.max_order))
    }

    fn start(ctl: &mut StepController, hist: &mut BdfHistory, f: f64) -> f64 {
        let (x, q, f) = (dvector![1.0], dvector![1.0], dvector![f]);
        let point = ConsistentPoint {
            x: &x,
            q: &q,
            f: &f,
        };
        ctl.start(hist, point, 1.0, BOUNDS, false)
    }

    fn attempt(ctl: &StepController, hist: &mut BdfHistory) {
        hist.update_coefficients(ctl.step(), ctl.order(), ctl.used_step(), ctl.used_order());
        hist.predict(ctl.order());
    }

    #[test]
    fn test_initial_step_heuristic() {
        let options = IntegratorOptions {
            initial_step: 1.0,
            ..Default::default()
        };
        let (mut ctl, mut hist) = controller(&options);
        // no dynamics: h0_max_factor * span
        let h = start(&mut ctl, &mut hist, 0.0);
        assert!((h - 0.005).abs() < 1e-15, "h = {}", h);

        // fast dynamics limit the step through the charge-rate estimate
        let h = start(&mut ctl, &mut hist, 1e6);
        let w = 1e-3 + 1e-6;
        let expected = SQRT_2 / (2.0 * 1e6 / w);
        assert!((h - expected).abs() < 1e-15, "h = {}, expected {}", h, expected);
        assert_eq!(ctl.order(), 1);
    }

    #[test]
    fn test_fixed_initial_step_overrides_heuristic() {
        let options = IntegratorOptions {
            fixed_initial_step: Some(0.5),
            ..Default::default()
        };
        let (mut ctl, mut hist) = controller(&options);
        assert_eq!(start(&mut ctl, &mut hist, 1.0), 0.5);
    }

    #[test]
    fn test_first_step_skips_error_test() {
        let options = IntegratorOptions {
            fixed_initial_step: Some(0.5),
            ..Default::default()
        };
        let (mut ctl, mut hist) = controller(&options);
        start(&mut ctl, &mut hist, 1.0);
        attempt(&ctl, &mut hist);
        let est = ctl.estimate_error(&hist, &dvector![0.0], &dvector![1.0]);
        assert!(est > 1.0);
        assert!(ctl.error_test_passes());

        let strict = IntegratorOptions {
            test_first_step: true,
            ..options
        };
        let (mut ctl, mut hist) = controller(&strict);
        start(&mut ctl, &mut hist, 1.0);
        attempt(&ctl, &mut hist);
        ctl.estimate_error(&hist, &dvector![0.0], &dvector![1.0]);
        assert!(!ctl.error_test_passes());
    }

    #[test]
    fn test_newton_failure_quarters_step() {
        let options = IntegratorOptions {
            fixed_initial_step: Some(0.4),
            ..Default::default()
        };
        let (mut ctl, mut hist) = controller(&options);
        start(&mut ctl, &mut hist, 1.0);
        attempt(&ctl, &mut hist);
        ctl.estimate_error(&hist, &dvector![1.0], &dvector![1.0]);
        ctl.reject(&mut hist, FailureKind::Newton, 0.0, 1.0, BOUNDS).unwrap();
        assert!((ctl.step() - 0.1).abs() < 1e-15, "h = {}", ctl.step());
        assert_eq!(ctl.consecutive_failures(), 1);
        // first-step retry rescales the first difference and psi
        assert!((hist.coefficients().psi[0] - 0.1).abs() < 1e-15);
        assert!((hist.q_history(1)[0] + 0.1).abs() < 1e-15);
    }

    #[test]
    fn test_too_many_failures_is_fatal() {
        let options = IntegratorOptions {
            fixed_initial_step: Some(0.4),
            max_failures: 3,
            ..Default::default()
        };
        let (mut ctl, mut hist) = controller(&options);
        start(&mut ctl, &mut hist, 1.0);
        for _ in 0..2 {
            attempt(&ctl, &mut hist);
            ctl.estimate_error(&hist, &dvector![1.0], &dvector![1.0]);
            ctl.reject(&mut hist, FailureKind::ErrorTest, 0.0, 1.0, BOUNDS).unwrap();
        }
        attempt(&ctl, &mut hist);
        ctl.estimate_error(&hist, &dvector![1.0], &dvector![1.0]);
        let err = ctl
            .reject(&mut hist, FailureKind::ErrorTest, 0.0, 1.0, BOUNDS)
            .unwrap_err();
        assert!(matches!(err, Error::TooManyFailures { failures: 3, .. }));
    }

    #[test]
    fn test_initial_phase_doubles_step_and_raises_order() {
        let options = IntegratorOptions {
            fixed_initial_step: Some(0.01),
            ..Default::default()
        };
        let (mut ctl, mut hist) = controller(&options);
        start(&mut ctl, &mut hist, 1.0);
        attempt(&ctl, &mut hist);
        let x = dvector![0.99];
        ctl.estimate_error(&hist, &x, &dvector![1.0]);
        ctl.complete(&mut hist, &x, &x, 0.99, BOUNDS);

        assert_eq!(ctl.used_order(), 1);
        assert_eq!(ctl.order(), 2);
        assert!((ctl.step() - 0.02).abs() < 1e-15);
        assert_eq!(ctl.number_of_steps(), 1);
        assert_eq!(hist.x_history(0)[0], 0.99);
    }

    #[test]
    fn test_next_step_is_cut_to_stop_time() {
        let options = IntegratorOptions {
            fixed_initial_step: Some(0.01),
            ..Default::default()
        };
        let (mut ctl, mut hist) = controller(&options);
        start(&mut ctl, &mut hist, 1.0);
        attempt(&ctl, &mut hist);
        let x = dvector![0.99];
        ctl.estimate_error(&hist, &x, &dvector![1.0]);
        ctl.complete(&mut hist, &x, &x, 0.015, BOUNDS);
        assert_eq!(ctl.step(), 0.015);
    }
}
