//! Collection requests packaged as VM operations.

use super::Heap;
use crate::gc::GcCause;
use crate::vm::{SafepointContext, VmOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Evacuation pause, then allocate.
    Incremental(GcCause),
    /// The failed-allocation escalation chain.
    Escalate,
}

/// A pause requested on behalf of an allocation (or explicitly, with a zero
/// request).
///
/// The prologue refuses to run if another collection happened since the
/// requester looked at the collection count: that collection may already
/// have made room.
pub(crate) struct VmCollectForAllocation<'h> {
    heap: &'h Heap,
    mode: Mode,
    words: usize,
    gc_count_before: u32,
    result: Option<usize>,
    prologue_succeeded: bool,
    pause_succeeded: bool,
}

impl<'h> VmCollectForAllocation<'h> {
    pub(crate) const fn incremental(
        heap: &'h Heap,
        words: usize,
        gc_count_before: u32,
        cause: GcCause,
    ) -> Self {
        Self::new(heap, Mode::Incremental(cause), words, gc_count_before)
    }

    pub(crate) const fn escalate(heap: &'h Heap, words: usize, gc_count_before: u32) -> Self {
        Self::new(heap, Mode::Escalate, words, gc_count_before)
    }

    const fn new(heap: &'h Heap, mode: Mode, words: usize, gc_count_before: u32) -> Self {
        Self {
            heap,
            mode,
            words,
            gc_count_before,
            result: None,
            prologue_succeeded: false,
            pause_succeeded: false,
        }
    }

    pub(crate) const fn result(&self) -> Option<usize> {
        self.result
    }

    pub(crate) const fn prologue_succeeded(&self) -> bool {
        self.prologue_succeeded
    }

    pub(crate) const fn pause_succeeded(&self) -> bool {
        self.pause_succeeded
    }
}

impl VmOperation for VmCollectForAllocation<'_> {
    fn name(&self) -> &'static str {
        match self.mode {
            Mode::Incremental(_) => "incremental collection pause",
            Mode::Escalate => "collect for allocation",
        }
    }

    fn doit_prologue(&mut self) -> bool {
        self.prologue_succeeded = self.gc_count_before == self.heap.total_collections();
        self.prologue_succeeded
    }

    fn doit(&mut self) {
        let heap = self.heap;
        let _safepoint = heap.enter_safepoint();
        let _heap_lock = heap.heap_lock.lock();
        match self.mode {
            Mode::Incremental(cause) => {
                if self.words > 0 {
                    self.result = heap.attempt_allocation_at_safepoint(self.words);
                    if self.result.is_some() {
                        self.pause_succeeded = true;
                        return;
                    }
                }
                self.pause_succeeded = heap.do_collection_pause_at_safepoint(cause);
                if self.pause_succeeded && self.words > 0 {
                    self.result = heap.attempt_allocation_at_safepoint(self.words);
                }
            }
            Mode::Escalate => {
                let (result, succeeded) = heap.satisfy_failed_allocation(self.words);
                self.result = result;
                self.pause_succeeded = succeeded;
            }
        }
    }
}

/// An explicitly requested full collection.
pub(crate) struct VmCollectFull<'h> {
    heap: &'h Heap,
    clear_soft_refs: bool,
    gc_count_before: u32,
    succeeded: bool,
}

impl VmOperation for VmCollectFull<'_> {
    fn name(&self) -> &'static str {
        "full collection"
    }

    fn doit_prologue(&mut self) -> bool {
        self.gc_count_before == self.heap.total_collections()
    }

    fn doit(&mut self) {
        let heap = self.heap;
        let _safepoint = heap.enter_safepoint();
        let _heap_lock = heap.heap_lock.lock();
        self.succeeded = heap.do_full_collection(self.clear_soft_refs, GcCause::ExplicitFull);
    }
}

impl Heap {
    /// Run an evacuation pause for `cause` from a thread described by
    /// `ctx`. Returns whether a pause ran.
    pub(crate) fn collect_in<C: SafepointContext>(&self, ctx: &mut C, cause: GcCause) -> bool {
        if cause.is_full() {
            return self.full_collect_in(ctx, false);
        }
        if cause == GcCause::MarkingInitiated {
            self.policy.lock().set_initiate_conc_mark_if_possible();
        }
        let gc_count_before = self.total_collections();
        let mut op = VmCollectForAllocation::incremental(self, 0, gc_count_before, cause);
        self.execute_vm_op(ctx, &mut op);
        op.prologue_succeeded() && op.pause_succeeded()
    }

    /// Run a full collection from a thread described by `ctx`.
    pub(crate) fn full_collect_in<C: SafepointContext>(&self, ctx: &mut C, clear_soft_refs: bool) -> bool {
        let mut op = VmCollectFull {
            heap: self,
            clear_soft_refs,
            gc_count_before: self.total_collections(),
            succeeded: false,
        };
        self.execute_vm_op(ctx, &mut op);
        op.succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::heap::Collaborators;
    use crate::vm::Detached;

    fn heap() -> std::sync::Arc<Heap> {
        let config = HeapConfig::default()
            .with_region_size(256 * 1024)
            .with_initial_heap_size(2 * 1024 * 1024)
            .with_max_heap_size(2 * 1024 * 1024)
            .with_initiating_heap_occupancy_percent(100)
            .with_refinement_threads(0)
            .with_parallel_gc_threads(1);
        Heap::new(config, Collaborators::default()).unwrap()
    }

    #[test]
    fn test_stale_request_is_skipped() {
        let heap = heap();
        let mut op = VmCollectForAllocation::incremental(&heap, 0, 7, GcCause::Explicit);
        heap.execute_vm_op(&mut Detached, &mut op);
        assert!(!op.prologue_succeeded());
        assert_eq!(heap.total_collections(), 0);
    }

    #[test]
    fn test_request_allocates_without_collecting_when_space_exists() {
        let heap = heap();
        let mut op = VmCollectForAllocation::incremental(&heap, 8, 0, GcCause::AllocationFailure);
        heap.execute_vm_op(&mut Detached, &mut op);
        assert!(op.prologue_succeeded() && op.pause_succeeded());
        assert!(op.result().is_some());
        assert_eq!(heap.total_collections(), 0);
    }

    #[test]
    fn test_explicit_collections_count() {
        let heap = heap();
        assert!(heap.collect(GcCause::Explicit));
        assert!(heap.full_collect(false));
        assert_eq!(heap.total_collections(), 2);
        assert_eq!(heap.total_full_collections(), 1);
    }
}
