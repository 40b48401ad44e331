//! Ordered set of future times the integrator must land on exactly.

use crate::error::{Error, Result};

/// How the integrator treats a breakpoint once it lands on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakpointKind {
    /// Land exactly, restart the integration history, keep going.
    #[default]
    Simple,
    /// Land exactly and hand control back to the caller.
    Pause,
}

/// A single breakpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakpoint {
    pub time: f64,
    pub kind: BreakpointKind,
}

impl Breakpoint {
    pub fn simple(time: f64) -> Self {
        Self {
            time,
            kind: BreakpointKind::Simple,
        }
    }

    pub fn pause(time: f64) -> Self {
        Self {
            time,
            kind: BreakpointKind::Pause,
        }
    }

    pub fn is_pause(&self) -> bool {
        self.kind == BreakpointKind::Pause
    }

    /// Merge two coincident breakpoints: earlier time, pause wins.
    fn merged(self, other: Breakpoint) -> Breakpoint {
        let kind = if self.is_pause() || other.is_pause() {
            BreakpointKind::Pause
        } else {
            BreakpointKind::Simple
        };
        Breakpoint {
            time: self.time.min(other.time),
            kind,
        }
    }
}

/// Breakpoints sorted by time, with entries closer than `tolerance` merged.
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    points: Vec<Breakpoint>,
    tolerance: f64,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current merge tolerance.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Change the merge tolerance and re-merge existing entries.
    pub fn set_tolerance(&mut self, tolerance: f64) {
        if tolerance == self.tolerance {
            return;
        }
        self.tolerance = tolerance.max(0.0);
        let points = std::mem::take(&mut self.points);
        for bp in points {
            self.insert_merged(bp);
        }
    }

    /// Insert a breakpoint, merging with any entry within tolerance.
    pub fn insert(&mut self, bp: Breakpoint) -> Result<()> {
        if !bp.time.is_finite() {
            return Err(Error::InvalidBreakpoint(bp.time));
        }
        self.insert_merged(bp);
        Ok(())
    }

    fn insert_merged(&mut self, bp: Breakpoint) {
        let pos = self.points.partition_point(|p| p.time < bp.time);
        let tol = self.tolerance;
        if pos > 0 && (bp.time - self.points[pos - 1].time).abs() <= tol {
            self.points[pos - 1] = self.points[pos - 1].merged(bp);
        } else if pos < self.points.len() && (self.points[pos].time - bp.time).abs() <= tol {
            self.points[pos] = self.points[pos].merged(bp);
        } else {
            self.points.insert(pos, bp);
        }
    }

    /// Drop every breakpoint strictly before `time`.
    pub fn discard_before(&mut self, time: f64) {
        let keep_from = self.points.partition_point(|p| p.time < time);
        self.points.drain(..keep_from);
    }

    /// First breakpoint strictly after `time`, beyond tolerance.
    pub fn next_after(&self, time: f64) -> Option<Breakpoint> {
        let limit = time + self.tolerance;
        let pos = self.points.partition_point(|p| p.time <= limit);
        self.points.get(pos).copied()
    }

    /// Breakpoint coinciding with `time` within tolerance, if any.
    pub fn find(&self, time: f64) -> Option<Breakpoint> {
        let pos = self.points.partition_point(|p| p.time < time - self.tolerance);
        self.points
            .get(pos)
            .filter(|p| (p.time - time).abs() <= self.tolerance)
            .copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}
