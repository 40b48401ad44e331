//! Device contribution interface and built-in device models for daestep.
//!
//! This crate provides:
//! - The [`Device`] capability trait the assembler drives
//! - Passive elements: R, C, L
//! - Independent V and I sources with time-varying waveforms
//! - A junction diode with SPICE voltage limiting
//! - [`DeviceRegistry`], mapping kind identifiers to factories

pub mod device;
pub mod diode;
pub mod error;
pub mod passive;
pub mod registry;
pub mod sources;
pub mod waveforms;

pub use device::{AnalysisMode, BoxedDevice, Device, EvalContext, StateStatus};
pub use diode::{Diode, DiodeParams};
pub use error::{Error, Result};
pub use passive::{Capacitor, Inductor, Resistor};
pub use registry::{DeviceFactory, DeviceRegistry, DeviceSpec};
pub use sources::{CurrentSource, VoltageSource};
pub use waveforms::Waveform;
