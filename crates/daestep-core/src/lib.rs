//! Core data structures for the daestep DAE solver.
//!
//! This crate provides the pieces every other layer agrees on:
//!
//! - **Stamps**: the fixed (row, column) pattern each device declares, and the
//!   binding of that pattern to global rows and Jacobian arena offsets
//! - **Sparse storage**: a shared CSR pattern with contiguous value arenas
//! - **DAE accumulators**: F, Q, dF/dx and dQ/dx with add-only device views
//! - **Breakpoints**: the ordered set of times the integrator must hit exactly

pub mod breakpoint;
pub mod dae;
pub mod error;
pub mod node;
pub mod sparse;
pub mod stamp;

pub use breakpoint::{Breakpoint, BreakpointKind, BreakpointSet};
pub use dae::{DaeSystem, JacobianAccumulator, ResidualAccumulator};
pub use error::{Error, Result};
pub use node::NodeId;
pub use sparse::{SparseMatrix, SparsityPattern};
pub use stamp::{DeviceBinding, StampPattern};
