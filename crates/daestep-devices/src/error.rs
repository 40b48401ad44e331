//! Error types for daestep-devices.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device {device}: invalid value {value} for parameter {param}")]
    InvalidParameter {
        device: String,
        param: String,
        value: f64,
    },

    #[error("device {device}: missing required parameter {param}")]
    MissingParameter { device: String, param: String },

    #[error("device {device}: expected {expected} nodes, got {actual}")]
    WrongNodeCount {
        device: String,
        expected: usize,
        actual: usize,
    },

    #[error("unknown device kind: {0}")]
    UnknownKind(String),

    #[error("invalid waveform: {0}")]
    InvalidWaveform(String),
}

pub type Result<T> = std::result::Result<T, Error>;
