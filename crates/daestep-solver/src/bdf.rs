//! Variable-order, variable-step BDF history in Nordsieck-like
//! modified-divided-difference form.
//!
//! The history holds scaled differences of the solution `x` and the charge
//! vector `Q` for orders up to five. Each step runs
//! [`BdfHistory::update_coefficients`] then [`BdfHistory::predict`]. After
//! the corrector, the step is either committed with [`BdfHistory::update`]
//! or undone with [`BdfHistory::restore`].

use daestep_core::SparseMatrix;
use daestep_devices::AnalysisMode;
use nalgebra::DVector;

use crate::error::Result;
use crate::loader::{AssemblyStatus, Loader};
use crate::problem::NonlinearProblem;

/// Highest supported order.
pub const MAX_ORDER: usize = 5;

/// Per-step method coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct BdfCoefficients {
    pub psi: [f64; MAX_ORDER + 1],
    pub alpha: [f64; MAX_ORDER + 1],
    pub beta: [f64; MAX_ORDER + 1],
    pub sigma: [f64; MAX_ORDER + 1],
    pub gamma: [f64; MAX_ORDER + 1],
    /// Fixed-leading-coefficient sum `-sum(1 / j)`.
    pub alphas: f64,
    pub alpha0: f64,
    /// Scale on `dQ/dx` in the corrector Jacobian.
    pub cj: f64,
    /// Scale turning the predictor-corrector difference into an error estimate.
    pub ck: f64,
    /// Steps taken with the current step size and order, capped at order + 2.
    pub nscsco: usize,
}

impl Default for BdfCoefficients {
    fn default() -> Self {
        Self {
            psi: [0.0; MAX_ORDER + 1],
            alpha: [0.0; MAX_ORDER + 1],
            beta: [1.0; MAX_ORDER + 1],
            sigma: [1.0; MAX_ORDER + 1],
            gamma: [0.0; MAX_ORDER + 1],
            alphas: 0.0,
            alpha0: 0.0,
            cj: 0.0,
            ck: 0.0,
            nscsco: 0,
        }
    }
}

/// Solution and charge history plus the predictor it produces.
#[derive(Debug, Clone)]
pub struct BdfHistory {
    max_order: usize,
    x: Vec<DVector<f64>>,
    q: Vec<DVector<f64>>,
    coeffs: BdfCoefficients,
    xn0: DVector<f64>,
    qn0: DVector<f64>,
    qpn0: DVector<f64>,
}

impl BdfHistory {
    pub fn new(size: usize, max_order: usize) -> Self {
        let max_order = max_order.clamp(1, MAX_ORDER);
        let columns = max_order + 1;
        Self {
            max_order,
            x: vec![DVector::zeros(size); columns],
            q: vec![DVector::zeros(size); columns],
            coeffs: BdfCoefficients::default(),
            xn0: DVector::zeros(size),
            qn0: DVector::zeros(size),
            qpn0: DVector::zeros(size),
        }
    }

    pub fn size(&self) -> usize {
        self.xn0.len()
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn coefficients(&self) -> &BdfCoefficients {
        &self.coeffs
    }

    /// Scaled solution difference of order `i`.
    pub fn x_history(&self, i: usize) -> &DVector<f64> {
        &self.x[i]
    }

    pub fn q_history(&self, i: usize) -> &DVector<f64> {
        &self.q[i]
    }

    /// Predicted solution for the step in progress.
    pub fn predicted_x(&self) -> &DVector<f64> {
        &self.xn0
    }

    pub fn predicted_q(&self) -> &DVector<f64> {
        &self.qn0
    }

    /// Predicted `dQ/dt` for the step in progress.
    pub fn predicted_q_derivative(&self) -> &DVector<f64> {
        &self.qpn0
    }

    /// Restart from a consistent point at order one.
    ///
    /// `f0` is F at `x0`, so `-h * f0` is the first charge difference.
    pub fn initialize(&mut self, x0: &DVector<f64>, q0: &DVector<f64>, f0: &DVector<f64>, h: f64) {
        for v in self.x.iter_mut().chain(self.q.iter_mut()) {
            v.fill(0.0);
        }
        self.x[0].copy_from(x0);
        self.q[0].copy_from(q0);
        self.q[1].copy_from(f0);
        self.q[1] *= -h;

        self.coeffs = BdfCoefficients::default();
        self.coeffs.psi[0] = h;
        self.coeffs.cj = 1.0 / h;
        self.xn0.copy_from(x0);
        self.qn0.copy_from(q0);
        self.qpn0.fill(0.0);
    }

    /// Recompute the coefficients for a step of size `h` at `order`.
    ///
    /// `used_step` and `used_order` describe the last accepted step. The
    /// variable-step coefficients only change while the step size or order
    /// has been constant for fewer than `order + 2` steps.
    pub fn update_coefficients(&mut self, h: f64, order: usize, used_step: f64, used_order: usize) {
        let c = &mut self.coeffs;
        if h != used_step || order != used_order {
            c.nscsco = 0;
        }
        c.nscsco = (c.nscsco + 1).min(used_order + 2);

        if order + 1 >= c.nscsco {
            c.beta[0] = 1.0;
            c.alpha[0] = 1.0;
            c.sigma[0] = 1.0;
            c.gamma[0] = 0.0;
            let mut temp1 = h;
            for i in 1..=order {
                let temp2 = c.psi[i - 1];
                c.psi[i - 1] = temp1;
                c.beta[i] = c.beta[i - 1] * c.psi[i - 1] / temp2;
                temp1 = temp2 + h;
                c.alpha[i] = h / temp1;
                c.sigma[i] = (i + 1) as f64 * c.sigma[i - 1] * c.alpha[i];
                c.gamma[i] = c.gamma[i - 1] + c.alpha[i - 1] / h;
            }
            c.psi[order] = temp1;

            c.alphas = 0.0;
            c.alpha0 = 0.0;
            for i in 0..order {
                c.alphas -= 1.0 / (i + 1) as f64;
                c.alpha0 -= c.alpha[i];
            }
            c.cj = -c.alphas / h;
            c.ck = (c.alpha[order] + c.alphas - c.alpha0).abs().max(c.alpha[order]);
        }
    }

    /// Scale the history for the new step and form the predictor.
    pub fn predict(&mut self, order: usize) {
        let start = self.coeffs.nscsco;
        for i in start..=order {
            let b = self.coeffs.beta[i];
            self.x[i] *= b;
            self.q[i] *= b;
        }

        self.xn0.fill(0.0);
        self.qn0.fill(0.0);
        self.qpn0.fill(0.0);
        for i in 0..=order {
            self.xn0 += &self.x[i];
            self.qn0 += &self.q[i];
        }
        for i in 1..=order {
            self.qpn0.axpy(self.coeffs.gamma[i], &self.q[i], 1.0);
        }
    }

    /// Undo the scaling of a step of size `h` at `order` that was rejected.
    pub fn restore(&mut self, h: f64, order: usize) {
        let start = self.coeffs.nscsco;
        for i in start..=order {
            let b = self.coeffs.beta[i];
            self.x[i] /= b;
            self.q[i] /= b;
        }
        for i in 1..=order {
            self.coeffs.psi[i - 1] = self.coeffs.psi[i] - h;
        }
    }

    /// Shrink the first difference when the very first step is retried.
    pub fn rescale_first_step(&mut self, ratio: f64, new_step: f64) {
        self.coeffs.psi[0] = new_step;
        self.x[1] *= ratio;
        self.q[1] *= ratio;
    }

    /// Commit the corrected solution `x` and charge `q` of an accepted step.
    pub fn update(&mut self, x: &DVector<f64>, q: &DVector<f64>, used_order: usize) {
        let x_corr = x - &self.xn0;
        let q_corr = q - &self.qn0;
        if used_order < self.max_order {
            self.x[used_order + 1].copy_from(&x_corr);
            self.q[used_order + 1].copy_from(&q_corr);
        }
        self.x[used_order] += &x_corr;
        self.q[used_order] += &q_corr;
        for j in (0..used_order).rev() {
            let (lo, hi) = self.x.split_at_mut(j + 1);
            lo[j] += &hi[0];
            let (lo, hi) = self.q.split_at_mut(j + 1);
            lo[j] += &hi[0];
        }
    }

    /// Corrector residual `qpn0 + cj * (q - qn0) + f`.
    pub fn residual_into(&self, f: &DVector<f64>, q: &DVector<f64>, out: &mut DVector<f64>) {
        out.copy_from(&self.qpn0);
        out.axpy(self.coeffs.cj, q, 1.0);
        out.axpy(-self.coeffs.cj, &self.qn0, 1.0);
        *out += f;
    }

    /// Solution at `t` within the last accepted step ending at `tn`.
    ///
    /// Uses the interpolating polynomial of `used_order`; exact at `tn`.
    pub fn interpolate(&self, t: f64, tn: f64, used_order: usize) -> DVector<f64> {
        let mut out = self.x[0].clone();
        let order = if t == tn { 0 } else { used_order.min(self.max_order) };
        let delt = t - tn;
        let psi = &self.coeffs.psi;
        let mut c = 1.0;
        let mut gam = delt / psi[0];
        for j in 1..=order {
            c *= gam;
            gam = (delt + psi[j - 1]) / psi[j];
            out.axpy(c, &self.x[j], 1.0);
        }
        out
    }
}

/// The corrector system of one BDF step, `qpn0 + cj (Q(x) - qn0) + F(x, t) = 0`.
#[derive(Debug)]
pub struct TransientProblem<'a> {
    loader: &'a mut Loader,
    history: &'a BdfHistory,
    time: f64,
    residual: DVector<f64>,
    jacobian: SparseMatrix,
}

impl<'a> TransientProblem<'a> {
    pub fn new(loader: &'a mut Loader, history: &'a BdfHistory, time: f64) -> Self {
        let residual = DVector::zeros(loader.size());
        let jacobian = SparseMatrix::new(loader.pattern().clone());
        Self {
            loader,
            history,
            time,
            residual,
            jacobian,
        }
    }
}

impl NonlinearProblem for TransientProblem<'_> {
    fn size(&self) -> usize {
        self.loader.size()
    }

    fn evaluate(&mut self, x: &DVector<f64>, with_jacobian: bool) -> Result<AssemblyStatus> {
        let status = self
            .loader
            .assemble(x, self.time, AnalysisMode::Transient, with_jacobian)?;
        let system = self.loader.system();
        self.history
            .residual_into(system.f(), system.q(), &mut self.residual);
        if with_jacobian {
            let cj = self.history.coefficients().cj;
            self.jacobian
                .assign_combination(cj, system.dqdx(), 1.0, system.dfdx())?;
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
    use nalgebra::dvector;

    /// One backward-Euler-equivalent step of `dx/dt = -lambda x` from the
    /// predictor, solved in closed form.
    fn linear_step(
        hist: &mut BdfHistory,
        lambda: f64,
        h: f64,
        order: usize,
        used: (f64, usize),
    ) -> f64 {
        hist.update_coefficients(h, order, used.0, used.1);
        hist.predict(order);
        let c = hist.coefficients();
        // qpn0 + cj (x - qn0) + lambda x = 0 with Q = x
        let x = (c.cj * hist.predicted_q()[0] - hist.predicted_q_derivative()[0]) / (c.cj + lambda);
        hist.update(&dvector![x], &dvector![x], order);
        x
    }

    #[test]
    fn test_first_step_is_backward_euler() {
        let mut hist = BdfHistory::new(1, 5);
        let h = 1.0;
        hist.initialize(&dvector![1.0], &dvector![1.0], &dvector![1.0], h);
        hist.update_coefficients(h, 1, 0.0, 1);
        hist.predict(1);

        let c = hist.coefficients();
        assert_eq!(c.cj, 1.0);
        assert_eq!(c.ck, 0.5);
        assert_eq!(hist.predicted_x()[0], 1.0);
        assert_eq!(hist.predicted_q()[0], 0.0);
        assert_eq!(hist.predicted_q_derivative()[0], -1.0);

        let mut r = dvector![0.0];
        hist.residual_into(&dvector![0.5], &dvector![0.5], &mut r);
        assert_eq!(r[0], 0.0);
    }

    #[test]
    fn test_constant_step_order_one_matches_backward_euler() {
        let h = 0.1;
        let lambda = 2.0;
        let mut hist = BdfHistory::new(1, 5);
        hist.initialize(&dvector![1.0], &dvector![1.0], &dvector![lambda], h);
        let mut used = (0.0, 1);
        let mut expected = 1.0;
        for _ in 0..10 {
            let x = linear_step(&mut hist, lambda, h, 1, used);
            used = (h, 1);
            expected /= 1.0 + lambda * h;
            assert!((x - expected).abs() < 1e-12, "x = {}, expected {}", x, expected);
        }
    }

    #[test]
    fn test_second_order_is_more_accurate() {
        let h = 0.05;
        let lambda = 1.0;
        let steps = 20;
        let exact = (-lambda * h * steps as f64).exp();

        let run = |order: usize| {
            let mut hist = BdfHistory::new(1, 5);
            hist.initialize(&dvector![1.0], &dvector![1.0], &dvector![lambda], h);
            let mut used = (0.0, 1);
            let mut x = 1.0;
            for n in 0..steps {
                let k = if n == 0 { 1 } else { order };
                x = linear_step(&mut hist, lambda, h, k, used);
                used = (h, k);
            }
            x
        };
        let err1 = (run(1) - exact).abs();
        let err2 = (run(2) - exact).abs();
        assert!(err2 < err1 / 5.0, "order 2 error {} vs order 1 error {}", err2, err1);
    }

    #[test]
    fn test_restore_undoes_prediction() {
        let h = 0.1;
        let mut hist = BdfHistory::new(1, 5);
        hist.initialize(&dvector![1.0], &dvector![1.0], &dvector![1.0], h);
        let mut used = (0.0, 1);
        for n in 0..4 {
            let k = if n == 0 { 1 } else { 2 };
            linear_step(&mut hist, 1.0, h, k, used);
            used = (h, k);
        }
        let before = hist.clone();

        hist.update_coefficients(0.3, 2, used.0, used.1);
        hist.predict(2);
        hist.restore(0.3, 2);

        for i in 0..=2 {
            assert!((hist.x_history(i)[0] - before.x_history(i)[0]).abs() < 1e-14);
            assert!((hist.q_history(i)[0] - before.q_history(i)[0]).abs() < 1e-14);
        }
        for i in 0..2 {
            let a = hist.coefficients().psi[i];
            let b = before.coefficients().psi[i];
            assert!((a - b).abs() < 1e-14, "psi[{}] {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_interpolation_order_one_is_linear() {
        let h = 0.5;
        let mut hist = BdfHistory::new(1, 5);
        hist.initialize(&dvector![2.0], &dvector![2.0], &dvector![2.0], h);
        let x1 = linear_step(&mut hist, 1.0, h, 1, (0.0, 1));

        assert_eq!(hist.interpolate(h, h, 1)[0], x1);
        let mid = hist.interpolate(0.25, h, 1)[0];
        assert!((mid - 0.5 * (2.0 + x1)).abs() < 1e-14, "mid = {}", mid);
        let start = hist.interpolate(0.0, h, 1)[0];
        assert!((start - 2.0).abs() < 1e-14);
    }
}
