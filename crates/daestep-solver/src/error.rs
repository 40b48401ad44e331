//! Error types for daestep-solver.
//!
//! Only unrecoverable conditions are errors. Recoverable ones (device
//! non-convergence, Newton divergence, singular Jacobians, error-test
//! failures) are status values consumed by the integrator's retry policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] daestep_core::Error),

    #[error(transparent)]
    Device(#[from] daestep_devices::Error),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("device {device} references node {node}, but only {num_nodes} nodes exist")]
    UnknownNode {
        device: String,
        node: u32,
        num_nodes: usize,
    },

    #[error("invalid vector dimensions: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("inconsistent Jacobian: {count} entries disagree, worst at ({row}, {col})")]
    InconsistentJacobian { count: usize, row: usize, col: usize },

    #[error("operating point did not converge: {0}")]
    OperatingPointFailed(String),

    #[error("linear solver {solver} failed at t = {time:e}")]
    LinearSolverFailed { solver: String, time: f64 },

    #[error("integrator used before initialization")]
    NotInitialized,

    #[error("time step {step:e} at t = {time:e} is below the minimum {min_step:e}")]
    StepTooSmall { time: f64, step: f64, min_step: f64 },

    #[error("{failures} consecutive step failures at t = {time:e}")]
    TooManyFailures { time: f64, failures: usize },

    #[error("requested time {requested:e} is outside [{start:e}, {end:e}]")]
    TimeOutOfRange { requested: f64, start: f64, end: f64 },
}

pub type Result<T> = std::result::Result<T, Error>;
