//! Contribution assembler.
//!
//! The [`Loader`] owns every device instance, fixes the global unknown
//! layout once at construction, and assembles F, Q, dF/dx and dQ/dx for a
//! candidate solution on request.
//!
//! # Layout
//!
//! Node `k > 0` is unknown `k - 1`. Device-internal unknowns follow all node
//! unknowns, in device order. The Jacobian pattern is the union of every
//! declared stamp plus the full diagonal.
//!
//! # Partitions
//!
//! Devices may be split into contiguous partitions. Each partition is loaded
//! on the rayon pool into its own [`DaeSystem`], and the partial systems are
//! then summed into the shared one.

use std::ops::Range;
use std::sync::Arc;

use daestep_core::{Breakpoint, DaeSystem, DeviceBinding, SparsityPattern, StampPattern};
use daestep_devices::{AnalysisMode, BoxedDevice, Device, EvalContext, StateStatus};
use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Convergence flags gathered during one assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyStatus {
    /// No device reported limiting or a `false` load.
    pub devices_converged: bool,
    /// No nested device solve failed.
    pub inner_converged: bool,
}

impl AssemblyStatus {
    pub const CONVERGED: AssemblyStatus = AssemblyStatus {
        devices_converged: true,
        inner_converged: true,
    };

    /// Combine the flags of two partial assemblies.
    pub fn and(self, other: AssemblyStatus) -> AssemblyStatus {
        AssemblyStatus {
            devices_converged: self.devices_converged && other.devices_converged,
            inner_converged: self.inner_converged && other.inner_converged,
        }
    }

    fn record(&mut self, status: StateStatus) {
        match status {
            StateStatus::Converged => {}
            StateStatus::NotConverged => self.devices_converged = false,
            StateStatus::InnerSolveFailed => {
                self.devices_converged = false;
                self.inner_converged = false;
            }
        }
    }
}

impl Default for AssemblyStatus {
    fn default() -> Self {
        Self::CONVERGED
    }
}

/// Owner of all devices and of the shared DAE accumulators.
#[derive(Debug)]
pub struct Loader {
    devices: Vec<BoxedDevice>,
    num_nodes: usize,
    size: usize,
    pattern: Arc<SparsityPattern>,
    system: DaeSystem,
    partitions: Vec<Range<usize>>,
    /// Per-partition accumulators, empty when assembling serially.
    partials: Vec<DaeSystem>,
    residual_loads: u64,
    jacobian_loads: u64,
}

impl Loader {
    /// Build a serial loader over `devices` and `num_nodes` non-ground nodes.
    pub fn new(devices: Vec<BoxedDevice>, num_nodes: usize) -> Result<Self> {
        Self::with_partitions(devices, num_nodes, 1)
    }

    /// Build a loader assembling `partitions` device groups in parallel.
    pub fn with_partitions(
        mut devices: Vec<BoxedDevice>,
        num_nodes: usize,
        partitions: usize,
    ) -> Result<Self> {
        let mut next_unknown = num_nodes;
        let mut layouts = Vec::with_capacity(devices.len());

        for device in &devices {
            let rows = local_rows(device.as_ref(), num_nodes, &mut next_unknown)?;
            let stamp = device.declare_stamp();
            if stamp != device.declare_stamp() {
                return Err(daestep_core::Error::UnstableStamp(device.name().to_string()).into());
            }
            stamp.check_range(device.name(), device.num_locals())?;
            layouts.push((rows, stamp));
        }

        let size = next_unknown;
        let entries = layouts
            .iter()
            .flat_map(|(rows, stamp)| global_entries(rows, stamp))
            .chain((0..size).map(|i| (i, i)));
        let pattern = Arc::new(SparsityPattern::from_entries(size, entries)?);

        for (device, (rows, stamp)) in devices.iter_mut().zip(layouts) {
            let offsets = stamp
                .entries()
                .iter()
                .map(|&(r, c)| match (rows[r], rows[c]) {
                    (Some(gr), Some(gc)) => pattern.offset(gr, gc),
                    _ => None,
                })
                .collect();
            let binding = DeviceBinding::new(rows, offsets);
            binding.check_against(device.name(), &stamp)?;
            device.bind_offsets(binding);
        }

        let partitions = split_ranges(devices.len(), partitions.max(1));
        let partials = if partitions.len() > 1 {
            partitions
                .iter()
                .map(|_| DaeSystem::new(pattern.clone()))
                .collect()
        } else {
            Vec::new()
        };

        log::info!(
            "loader: {} devices, {} unknowns ({} nodes), {} nonzeros, {} partition(s)",
            devices.len(),
            size,
            num_nodes,
            pattern.nnz(),
            partitions.len().max(1)
        );

        Ok(Self {
            devices,
            num_nodes,
            size,
            system: DaeSystem::new(pattern.clone()),
            pattern,
            partitions,
            partials,
            residual_loads: 0,
            jacobian_loads: 0,
        })
    }

    /// Total number of unknowns.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of non-ground node unknowns; they occupy rows `0..num_nodes`.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    /// The most recently assembled system.
    pub fn system(&self) -> &DaeSystem {
        &self.system
    }

    pub fn devices(&self) -> &[BoxedDevice] {
        &self.devices
    }

    /// Look up a device by instance name.
    pub fn device(&self, name: &str) -> Option<&dyn Device> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len().max(1)
    }

    /// Assemble F and Q, and the Jacobians if `with_jacobian`, at `x`.
    pub fn assemble(
        &mut self,
        x: &DVector<f64>,
        time: f64,
        mode: AnalysisMode,
        with_jacobian: bool,
    ) -> Result<AssemblyStatus> {
        if x.len() != self.size {
            return Err(Error::DimensionMismatch {
                expected: self.size,
                actual: x.len(),
            });
        }

        self.system.clear();
        let ctx = EvalContext::new(x.as_slice(), time, mode);

        let status = if self.partials.is_empty() {
            load_devices(&mut self.devices, &mut self.system, &ctx, with_jacobian)
        } else {
            let partitions = &self.partitions;
            let mut groups: Vec<&mut [BoxedDevice]> = Vec::with_capacity(partitions.len());
            let mut rest = self.devices.as_mut_slice();
            for range in partitions {
                let (head, tail) = rest.split_at_mut(range.len());
                groups.push(head);
                rest = tail;
            }
            let status = groups
                .into_par_iter()
                .zip(self.partials.par_iter_mut())
                .map(|(group, partial)| {
                    partial.clear();
                    load_devices(group, partial, &ctx, with_jacobian)
                })
                .reduce(AssemblyStatus::default, AssemblyStatus::and);
            for partial in &self.partials {
                self.system.accumulate(partial)?;
            }
            status
        };

        self.residual_loads += 1;
        if with_jacobian {
            self.jacobian_loads += 1;
        }
        Ok(status)
    }

    /// Device breakpoints in `(from, to]`, unsorted.
    pub fn breakpoints(&self, from: f64, to: f64) -> Vec<Breakpoint> {
        self.devices
            .iter()
            .flat_map(|d| d.breakpoints(from, to))
            .collect()
    }

    /// Smallest step cap any device asks for.
    pub fn max_time_step(&self) -> Option<f64> {
        self.devices
            .iter()
            .filter_map(|d| d.max_time_step())
            .reduce(f64::min)
    }

    /// Let every device commit its state for the accepted solution `x`.
    pub fn accept_step(&mut self, x: &DVector<f64>, time: f64, mode: AnalysisMode) {
        let ctx = EvalContext::new(x.as_slice(), time, mode);
        for device in &mut self.devices {
            device.accept_step(&ctx);
        }
    }

    /// Assemblies performed since construction or the last reset.
    pub fn residual_loads(&self) -> u64 {
        self.residual_loads
    }

    /// Assemblies that included the Jacobians.
    pub fn jacobian_loads(&self) -> u64 {
        self.jacobian_loads
    }

    pub fn reset_counters(&mut self) {
        self.residual_loads = 0;
        self.jacobian_loads = 0;
    }
}

fn load_devices(
    devices: &mut [BoxedDevice],
    system: &mut DaeSystem,
    ctx: &EvalContext<'_>,
    with_jacobian: bool,
) -> AssemblyStatus {
    let mut status = AssemblyStatus::default();
    for device in devices.iter_mut() {
        if device.is_masked() {
            continue;
        }
        status.record(device.update_state(ctx));
        let (mut res, mut jac) = system.accumulators();
        if !device.load_residual(ctx, &mut res) {
            status.devices_converged = false;
        }
        if with_jacobian && !device.load_jacobian(ctx, &mut jac) {
            status.devices_converged = false;
        }
    }
    status
}

/// Global rows of a device's locals, allocating its internal unknowns.
fn local_rows(
    device: &dyn Device,
    num_nodes: usize,
    next_unknown: &mut usize,
) -> Result<Vec<Option<usize>>> {
    let mut rows = Vec::with_capacity(device.num_locals());
    for node in device.terminals() {
        match node.unknown() {
            Some(k) if k >= num_nodes => {
                return Err(Error::UnknownNode {
                    device: device.name().to_string(),
                    node: node.as_u32(),
                    num_nodes,
                })
            }
            row => rows.push(row),
        }
    }
    for _ in 0..device.num_internal_unknowns() {
        rows.push(Some(*next_unknown));
        *next_unknown += 1;
    }
    Ok(rows)
}

fn global_entries<'a>(
    rows: &'a [Option<usize>],
    stamp: &'a StampPattern,
) -> impl Iterator<Item = (usize, usize)> + 'a {
    stamp
        .entries()
        .iter()
        .filter_map(move |&(r, c)| Some((rows[r]?, rows[c]?)))
}

/// Split `0..total` into at most `parts` contiguous, non-empty ranges.
fn split_ranges(total: usize, parts: usize) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let chunk = total.div_ceil(parts);
    (0..total)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(total))
        .collect()
}
