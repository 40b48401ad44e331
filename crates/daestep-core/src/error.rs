//! Error types for daestep-core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device {device}: stamp refers to local unknown {local}, device owns {owned}")]
    LocalIndexOutOfRange {
        device: String,
        local: usize,
        owned: usize,
    },

    #[error("device {0}: stamp pattern changed between declarations")]
    UnstableStamp(String),

    #[error("device {device}: binding has {actual} entries, stamp declared {expected}")]
    BindingMismatch {
        device: String,
        expected: usize,
        actual: usize,
    },

    #[error("entry ({row}, {col}) is outside an {size}x{size} pattern")]
    EntryOutOfRange { row: usize, col: usize, size: usize },

    #[error("accumulators have different layouts")]
    LayoutMismatch,

    #[error("invalid breakpoint time: {0}")]
    InvalidBreakpoint(f64),
}

pub type Result<T> = std::result::Result<T, Error>;
