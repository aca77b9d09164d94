//! Per-block usage markers
//!
//! A marker decides whether the block it guards may go back to a pool when
//! the allocation context that produced it closes. Markers only move forward:
//!
//! ```text
//! Unused -> Used -> ContextOutput -> GlobalOutput
//! ```
//!
//! Views share the marker cells of the array they were cut from, so promoting
//! a view to an output also pins the parent's blocks.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum UsageMarker {
    /// Freshly drawn from a pool or newly allocated
    Unused = 0,
    /// Written or read during computation, still reclaimable
    Used = 1,
    /// Declared output of the current invocation
    ContextOutput = 2,
    /// Escapes into caller-held state, never recycled
    GlobalOutput = 3,
}

impl UsageMarker {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => UsageMarker::Unused,
            1 => UsageMarker::Used,
            2 => UsageMarker::ContextOutput,
            _ => UsageMarker::GlobalOutput,
        }
    }

    /// `Unused` and `Used` blocks may be returned to a pool
    pub fn is_reclaimable(self) -> bool {
        matches!(self, UsageMarker::Unused | UsageMarker::Used)
    }

    pub fn is_output(self) -> bool {
        !self.is_reclaimable()
    }
}

impl fmt::Display for UsageMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageMarker::Unused => write!(f, "Unused"),
            UsageMarker::Used => write!(f, "Used"),
            UsageMarker::ContextOutput => write!(f, "ContextOutput"),
            UsageMarker::GlobalOutput => write!(f, "GlobalOutput"),
        }
    }
}

/// Atomically updated marker, shared by every array that references the block
#[derive(Debug)]
pub struct MarkerCell(AtomicU8);

impl MarkerCell {
    pub fn new(marker: UsageMarker) -> Self {
        MarkerCell(AtomicU8::new(marker as u8))
    }

    pub fn get(&self) -> UsageMarker {
        UsageMarker::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move the marker forward to `to`.
    ///
    /// Returns `true` if the state changed. Requests that would move the
    /// marker backward, or repeat the current state, leave it untouched.
    pub fn advance(&self, to: UsageMarker) -> bool {
        let previous = self.0.fetch_max(to as u8, Ordering::AcqRel);
        previous < to as u8
    }

    pub fn is_reclaimable(&self) -> bool {
        self.get().is_reclaimable()
    }
}

impl Default for MarkerCell {
    fn default() -> Self {
        MarkerCell::new(UsageMarker::Unused)
    }
}
