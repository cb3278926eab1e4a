//! A region-based, incremental, parallel copying garbage collector core.
//!
//! `region-gc` manages a reserved address range split into fixed-size
//! regions. Mutators bump-allocate into eden regions; evacuation pauses copy
//! the live objects of a chosen collection set into survivor and old regions
//! with a pool of worker threads, while card-based remembered sets, kept up
//! to date by a post-write barrier and concurrent refinement, supply the
//! roots from outside the collection set. A concurrent marker computes old
//! region liveness so later pauses can evacuate the emptiest old regions
//! too, and a sliding full collection is the last resort.
//!
//! # Features
//!
//! - **Regions**: eden, survivor, old and humongous regions of one
//!   configurable size, committed and uncommitted on demand
//! - **Pause-time targets**: the young generation and collection set are
//!   sized from decaying predictions of per-region cost
//! - **Parallel evacuation**: work stealing over per-worker queues, with
//!   per-worker promotion buffers and graceful evacuation failure
//! - **No globals**: every heap is an independent [`Heap`] value
//!
//! # Quick Start
//!
//! ```
//! use region_gc::{Collaborators, Heap, HeapConfig, ObjectShape};
//!
//! let config = HeapConfig::default()
//!     .with_region_size(1024 * 1024)
//!     .with_max_heap_size(16 * 1024 * 1024);
//! let heap = Heap::new(config, Collaborators::default()).unwrap();
//!
//! let mut mutator = heap.attach();
//! let node = mutator.allocate(ObjectShape::plain(1, 1)).unwrap();
//! mutator.write_word(node, 0, 42);
//! let root = mutator.root(node);
//!
//! // Objects may move at any safepoint; reload them from roots.
//! mutator.safepoint_poll();
//! let node = root.get(&mutator).unwrap();
//! assert_eq!(mutator.read_word(node, 0), 42);
//! ```
//!
//! # Threads
//!
//! A thread attached through [`Heap::attach`] holds the heap's safepoint
//! lock in shared mode. Pauses take it exclusively, so every attached
//! mutator must poll, allocate or detach for a pause to make progress.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
mod error;
pub mod gc;
pub mod heap;
mod metrics;
mod mutator;
mod object;
mod roots;
pub mod tracing;
pub mod vm;

pub use config::HeapConfig;
pub use error::{AllocError, HeapError};
pub use gc::full_gc::{CompactingFullCollector, FullCollector};
pub use gc::gc_locker::{CriticalSection, CriticalSections, GcLocker};
pub use gc::marking::{ConcurrentMarking, LivenessMarker};
pub use gc::GcCause;
pub use heap::region::{Membership, RegionInfo, RegionKind};
pub use heap::{Collaborators, Heap};
pub use metrics::{HeapMetrics, PauseHistory, PauseKind, PauseMetrics, WorkerStats};
pub use mutator::Mutator;
pub use object::{ObjectRef, ObjectShape, ReferenceStrength, MIN_OBJECT_WORDS, WORD_SIZE};
pub use roots::Root;
pub use crate::tracing::{GcId, LogTags, TraceTime};
pub use vm::{Detached, SafepointContext, SafepointExecutor, SafepointLock, VmOperation};

#[cfg(feature = "test-util")]
pub use gc::pause::PausePhase;

/// Hooks for integration tests that drive region handoffs by hand.
#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::Heap;

    /// Take up to `n` regions off the free list without using them, as if
    /// marking cleanup were about to hand them back.
    pub fn take_free_regions(heap: &Heap, n: usize) -> Vec<u32> {
        let mut free = heap.free_list.lock();
        std::iter::from_fn(|| free.remove_region(true, &heap.regions))
            .take(n)
            .collect()
    }

    /// Announce that regions are about to arrive on the secondary free list.
    pub fn announce_free_regions(heap: &Heap) {
        heap.secondary_free_list.set_free_regions_coming();
    }

    /// Append regions taken by [`take_free_regions`] to the secondary free
    /// list.
    pub fn append_free_regions(heap: &Heap, batch: &[u32]) {
        heap.secondary_free_list.append(batch, &heap.regions);
    }

    /// Announce that no more regions are coming.
    pub fn finish_free_regions(heap: &Heap) {
        heap.secondary_free_list.reset_free_regions_coming();
    }
}
