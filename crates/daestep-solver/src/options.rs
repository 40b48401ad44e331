//! Solver and integrator options.
//!
//! All option structs implement `Default` and deserialize with
//! `#[serde(default)]`, so a partial JSON document overrides only the
//! fields it names.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Globalization applied to each Newton direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// Take the full Newton step.
    #[default]
    Full,
    /// Halve the step until the residual norm decreases.
    Divide,
    /// Armijo backtracking with a quadratic model for the reduction.
    Backtrack,
    /// Armijo backtracking with plain halving.
    SimpleBacktrack,
}

/// Which family of convergence tests applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewtonMode {
    /// Steady state: no near-convergence, small-update or stall shortcuts.
    Dc,
    /// Time step correction: the integrator decides on marginal results.
    #[default]
    Transient,
}

/// Newton driver options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonOptions {
    pub mode: NewtonMode,
    pub max_iterations: usize,
    pub search_method: SearchMethod,
    /// Maximum step reductions per iteration for the damped methods.
    pub max_search_steps: usize,
    /// Weighted update norm threshold.
    pub delta_x_tol: f64,
    /// Max-norm residual threshold.
    pub rhs_tol: f64,
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Weighted update below which a transient solve is handed back early.
    pub small_update_tol: f64,
    /// Converge after an undamped step that cut the residual norm by at least
    /// this factor and passes `rhs_tol`. Zero disables the test.
    pub residual_reduction_tol: f64,
    /// Keep iterating while any device reports non-convergence.
    pub enforce_device_convergence: bool,
    /// Residual reduction ratio accepted as near convergence at max iterations.
    pub near_convergence_rate: f64,
    /// Residual reduction relative to the first iterate for near convergence.
    pub near_convergence_relative_rate: f64,
    /// Residual growth ratio treated as divergence.
    pub max_convergence_rate: f64,
    /// `|rate - 1|` below which an iteration counts as stalled.
    pub stagnation_tol: f64,
    /// Consecutive stalled iterations before giving up.
    pub max_bad_steps: usize,
}

impl NewtonOptions {
    /// Preset for operating-point solves.
    pub fn dc() -> Self {
        Self {
            mode: NewtonMode::Dc,
            max_iterations: 200,
            search_method: SearchMethod::Divide,
            max_search_steps: 9,
            delta_x_tol: 1.0,
            rhs_tol: 1e-6,
            abs_tol: 1e-12,
            rel_tol: 1e-3,
            ..Self::transient()
        }
    }

    /// Preset for corrector solves inside a time step.
    pub fn transient() -> Self {
        Self {
            mode: NewtonMode::Transient,
            max_iterations: 20,
            search_method: SearchMethod::Full,
            max_search_steps: 2,
            delta_x_tol: 0.33,
            rhs_tol: 1e-2,
            abs_tol: 1e-6,
            rel_tol: 1e-2,
            small_update_tol: 1e-6,
            residual_reduction_tol: 1e-10,
            enforce_device_convergence: true,
            near_convergence_rate: 0.9,
            near_convergence_relative_rate: 1.0,
            max_convergence_rate: 0.5 * f64::MAX,
            stagnation_tol: 1e-3,
            max_bad_steps: 5,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.mode == NewtonMode::Transient
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidOptions("max_iterations must be at least 1".into()));
        }
        positive("delta_x_tol", self.delta_x_tol)?;
        positive("rhs_tol", self.rhs_tol)?;
        positive("abs_tol", self.abs_tol)?;
        non_negative("rel_tol", self.rel_tol)?;
        non_negative("small_update_tol", self.small_update_tol)?;
        non_negative("residual_reduction_tol", self.residual_reduction_tol)?;
        positive("max_convergence_rate", self.max_convergence_rate)?;
        Ok(())
    }
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self::transient()
    }
}

/// Empirically tuned step and order selection constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepControlConstants {
    pub h0_safety: f64,
    pub h0_max_factor: f64,
    /// Step growth per step during the initial phase.
    pub h_phase0_incr: f64,
    pub tkm1_tk_safety: f64,
    pub tkp1_tk_safety: f64,
    pub r_factor: f64,
    pub r_safety: f64,
    pub r_fudge: f64,
    pub r_min: f64,
    pub r_max: f64,
    pub r_hincr_test: f64,
    pub r_hincr: f64,
    /// Minimum step is `time * min_step_precision * eps`.
    pub min_step_precision: f64,
}

impl Default for StepControlConstants {
    fn default() -> Self {
        Self {
            h0_safety: 2.0,
            h0_max_factor: 0.005,
            h_phase0_incr: 2.0,
            tkm1_tk_safety: 2.0,
            tkp1_tk_safety: 0.5,
            r_factor: 0.9,
            r_safety: 2.0,
            r_fudge: 1e-4,
            r_min: 0.25,
            r_max: 0.9,
            r_hincr_test: 2.0,
            r_hincr: 2.0,
            min_step_precision: 10.0,
        }
    }
}

impl StepControlConstants {
    pub fn validate(&self) -> Result<()> {
        positive("h0_safety", self.h0_safety)?;
        positive("h0_max_factor", self.h0_max_factor)?;
        positive("h_phase0_incr", self.h_phase0_incr)?;
        positive("r_min", self.r_min)?;
        positive("r_safety", self.r_safety)?;
        if self.r_min > self.r_max {
            return Err(Error::InvalidOptions(format!(
                "r_min {} exceeds r_max {}",
                self.r_min, self.r_max
            )));
        }
        Ok(())
    }
}

/// Time-integration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    /// Relative local-error tolerance.
    pub rel_tol: f64,
    /// Absolute local-error tolerance.
    pub abs_tol: f64,
    /// Accept a step while the scaled error estimate is at most this.
    pub error_acceptance: f64,
    /// Upper bound on the heuristic first step.
    pub initial_step: f64,
    /// Use exactly this first step (still capped by max step and stop time).
    pub fixed_initial_step: Option<f64>,
    /// Step cap; defaults to a tenth of the integration span.
    pub max_step: Option<f64>,
    pub min_order: usize,
    pub max_order: usize,
    /// Consecutive failed attempts (Newton or error test) before giving up.
    pub max_failures: usize,
    /// Honour device and user breakpoints.
    pub breakpoints: bool,
    /// After a restart, cap the step so the next breakpoint interval takes at
    /// least this many steps.
    pub min_steps_per_breakpoint: Option<usize>,
    /// Run the local error test on the first step after a restart.
    pub test_first_step: bool,
    /// Compare analytic and finite-difference Jacobians at setup.
    pub check_jacobian: bool,
    /// Shunt conductance on node rows during operating-point solves.
    pub dc_gmin: f64,
    /// Keep every accepted point in the result record.
    pub record_points: bool,
    pub newton: NewtonOptions,
    pub dc_newton: NewtonOptions,
    pub constants: StepControlConstants,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            rel_tol: 1e-3,
            abs_tol: 1e-6,
            error_acceptance: 1.0,
            initial_step: 1e-10,
            fixed_initial_step: None,
            max_step: None,
            min_order: 1,
            max_order: 5,
            max_failures: 15,
            breakpoints: true,
            min_steps_per_breakpoint: None,
            test_first_step: false,
            check_jacobian: false,
            dc_gmin: 1e-12,
            record_points: true,
            newton: NewtonOptions::transient(),
            dc_newton: NewtonOptions::dc(),
            constants: StepControlConstants::default(),
        }
    }
}

impl IntegratorOptions {
    pub fn validate(&self) -> Result<()> {
        positive("rel_tol", self.rel_tol)?;
        positive("abs_tol", self.abs_tol)?;
        positive("error_acceptance", self.error_acceptance)?;
        positive("initial_step", self.initial_step)?;
        if let Some(h) = self.fixed_initial_step {
            positive("fixed_initial_step", h)?;
        }
        if let Some(h) = self.max_step {
            positive("max_step", h)?;
        }
        if self.min_order < 1 || self.min_order > self.max_order || self.max_order > 5 {
            return Err(Error::InvalidOptions(format!(
                "orders must satisfy 1 <= min ({}) <= max ({}) <= 5",
                self.min_order, self.max_order
            )));
        }
        if self.max_failures == 0 {
            return Err(Error::InvalidOptions("max_failures must be at least 1".into()));
        }
        non_negative("dc_gmin", self.dc_gmin)?;
        self.newton.validate()?;
        self.dc_newton.validate()?;
        self.constants.validate()
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidOptions(format!("{name} must be positive, got {value}")))
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidOptions(format!("{name} must be non-negative, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_differ() {
        let dc = NewtonOptions::dc();
        let tr = NewtonOptions::transient();
        assert_eq!(dc.max_iterations, 200);
        assert_eq!(tr.max_iterations, 20);
        assert_eq!(dc.search_method, SearchMethod::Divide);
        assert_eq!(tr.search_method, SearchMethod::Full);
        assert!((tr.delta_x_tol - 0.33).abs() < 1e-15);
        assert!(!dc.is_transient());
        assert_eq!(dc.small_update_tol, tr.small_update_tol);
    }

    #[test]
    fn test_defaults_validate() {
        assert!(IntegratorOptions::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_orders() {
        let opts = IntegratorOptions {
            min_order: 3,
            max_order: 2,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn test_invalid_ratio_bounds() {
        let mut opts = IntegratorOptions::default();
        opts.constants.r_min = 0.95;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_partial_json_overrides() {
        let opts: IntegratorOptions =
            serde_json::from_str(r#"{ "rel_tol": 1e-4, "newton": { "max_iterations": 7 } }"#)
                .unwrap();
        assert_eq!(opts.rel_tol, 1e-4);
        assert_eq!(opts.abs_tol, 1e-6);
        assert_eq!(opts.newton.max_iterations, 7);
        assert_eq!(opts.newton.search_method, SearchMethod::Full);
        assert_eq!(opts.max_order, 5);
    }
}
