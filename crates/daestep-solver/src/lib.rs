//! Assembler, Newton driver and time integrator for daestep.
//!
//! This crate provides:
//! - The [`Loader`], which assembles F, Q, dF/dx and dQ/dx from devices
//! - A damped Newton driver over any [`NonlinearProblem`]
//! - DC operating point solves
//! - Variable-order, variable-step BDF time integration with breakpoints
//! - Finite-difference Jacobian checking and nested device solves

pub mod bdf;
pub mod error;
pub mod integrator;
pub mod jacobian_check;
pub mod linear;
pub mod loader;
pub mod nested;
pub mod newton;
pub mod norm;
pub mod options;
pub mod problem;
pub mod step_control;

pub use bdf::{BdfHistory, TransientProblem, MAX_ORDER};
pub use error::{Error, Result};
pub use integrator::{
    Diagnostics, IntegrationStatus, Integrator, StepOutcome, TimePoint, TransientResult,
};
pub use jacobian_check::{check_jacobian, JacobianCheck, JacobianKind, JacobianReport};
pub use linear::{DenseLu, LinearSolve, LinearSolver, LinearStatus};
pub use loader::{AssemblyStatus, Loader};
pub use nested::{
    register_nested_devices, NestedSolve, SeriesDiodeParams, SeriesResistanceDiode,
};
pub use newton::{
    ConvergedReason, DivergedReason, FailedReason, NewtonCounters, NewtonOutcome, NewtonSolver,
    NewtonStatus,
};
pub use norm::{Reduction, SerialReduction};
pub use options::{
    IntegratorOptions, NewtonMode, NewtonOptions, SearchMethod, StepControlConstants,
};
pub use problem::{NonlinearProblem, SteadyStateProblem};
pub use step_control::{ConsistentPoint, FailureKind, StepBounds, StepController};
