//! Collection: pauses, evacuation, refinement, marking and the full GC.

pub mod cset;
pub mod dirty_card_queue;
pub(crate) mod evac_failure;
pub(crate) mod evacuate;
pub mod full_gc;
pub mod gc_locker;
pub mod marking;
pub(crate) mod pause;
pub mod policy;
pub(crate) mod references;
pub(crate) mod refine;
pub(crate) mod scan_state;
pub mod suspendible;
pub mod sync;
pub mod terminator;
pub mod worklist;

use std::fmt;

/// Why a collection was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    /// Eden is exhausted and a mutator allocation failed.
    AllocationFailure,
    /// A humongous allocation pushed old occupancy over the marking
    /// threshold.
    HumongousAllocation,
    /// The last critical section ended after a refused pause.
    GcLocker,
    /// Requested through [`Heap::collect`](crate::Heap::collect).
    Explicit,
    /// A pause started to kick off concurrent marking.
    MarkingInitiated,
    /// The incremental pause could not satisfy an allocation.
    FullAllocationFailure,
    /// Requested through [`Heap::full_collect`](crate::Heap::full_collect).
    ExplicitFull,
}

impl GcCause {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllocationFailure => "allocation failure",
            Self::HumongousAllocation => "humongous allocation",
            Self::GcLocker => "gc locker",
            Self::Explicit => "explicit",
            Self::MarkingInitiated => "marking initiated",
            Self::FullAllocationFailure => "allocation failure (full)",
            Self::ExplicitFull => "explicit (full)",
        }
    }

    /// Whether the cause asks for a full collection.
    pub const fn is_full(self) -> bool {
        matches!(self, Self::FullAllocationFailure | Self::ExplicitFull)
    }
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_display() {
        assert_eq!(GcCause::GcLocker.to_string(), "gc locker");
        assert!(GcCause::ExplicitFull.is_full());
        assert!(!GcCause::Explicit.is_full());
    }
}
