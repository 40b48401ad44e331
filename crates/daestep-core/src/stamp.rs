//! Device stamps and their resolved global offsets.
//!
//! A device declares its [`StampPattern`] once, in terms of *local* unknown
//! indices: terminals first, then any internal unknowns the device owns.
//! After the global layout is fixed the assembler hands back a
//! [`DeviceBinding`] holding, for every local unknown, its global row, and for
//! every stamp slot, the offset into the shared Jacobian value arena.
//!
//! Slots are numbered in declaration order, so a device that declared
//! `(0, 0)` first writes that entry through `binding.offset(0)`.

use crate::error::{Error, Result};

/// Fixed set of `(local_row, local_col)` pairs a device may write to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StampPattern {
    entries: Vec<(usize, usize)>,
}

impl StampPattern {
    /// Create an empty pattern.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pattern of a two-terminal branch between locals `a` and `b`.
    ///
    /// Slots: 0 = (a, a), 1 = (a, b), 2 = (b, a), 3 = (b, b).
    pub fn two_terminal(a: usize, b: usize) -> Self {
        let mut pattern = Self::new();
        pattern.push_block(a, b);
        pattern
    }

    /// Append one entry and return its slot.
    pub fn push(&mut self, row: usize, col: usize) -> usize {
        self.entries.push((row, col));
        self.entries.len() - 1
    }

    /// Append the four entries of a conductance-like block, returning the
    /// first slot. See [`StampPattern::two_terminal`] for the slot order.
    pub fn push_block(&mut self, a: usize, b: usize) -> usize {
        let base = self.entries.len();
        self.entries.extend_from_slice(&[(a, a), (a, b), (b, a), (b, b)]);
        base
    }

    /// Declared entries in slot order.
    pub fn entries(&self) -> &[(usize, usize)] {
        &self.entries
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the device writes no Jacobian entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify every local index is one the device owns.
    pub fn check_range(&self, device: &str, owned: usize) -> Result<()> {
        for &(row, col) in &self.entries {
            let local = row.max(col);
            if local >= owned {
                return Err(Error::LocalIndexOutOfRange {
                    device: device.to_string(),
                    local,
                    owned,
                });
            }
        }
        Ok(())
    }
}

/// Global rows and Jacobian offsets resolved for one device instance.
///
/// `None` marks a ground row or an entry touching ground; writes through it
/// are dropped by the accumulators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBinding {
    rows: Vec<Option<usize>>,
    offsets: Vec<Option<usize>>,
}

impl DeviceBinding {
    /// Create a binding from per-local rows and per-slot offsets.
    pub fn new(rows: Vec<Option<usize>>, offsets: Vec<Option<usize>>) -> Self {
        Self { rows, offsets }
    }

    /// Global row of a local unknown.
    pub fn row(&self, local: usize) -> Option<usize> {
        self.rows.get(local).copied().flatten()
    }

    /// Jacobian arena offset of a stamp slot.
    pub fn offset(&self, slot: usize) -> Option<usize> {
        self.offsets.get(slot).copied().flatten()
    }

    /// All rows, indexed by local unknown.
    pub fn rows(&self) -> &[Option<usize>] {
        &self.rows
    }

    /// All offsets, indexed by slot.
    pub fn offsets(&self) -> &[Option<usize>] {
        &self.offsets
    }

    /// Value of a local unknown in `solution`; ground reads as zero.
    pub fn value(&self, solution: &[f64], local: usize) -> f64 {
        self.row(local).map_or(0.0, |row| solution[row])
    }

    /// Difference `x[a] - x[b]` between two local unknowns.
    pub fn difference(&self, solution: &[f64], a: usize, b: usize) -> f64 {
        self.value(solution, a) - self.value(solution, b)
    }

    /// Verify the binding has one offset per declared slot.
    pub fn check_against(&self, device: &str, pattern: &StampPattern) -> Result<()> {
        if self.offsets.len() != pattern.len() {
            return Err(Error::BindingMismatch {
                device: device.to_string(),
                expected: pattern.len(),
                actual: self.offsets.len(),
            });
        }
        Ok(())
    }
}
