//! Mutator allocation.
//!
//! Small objects go through the mutator allocation region: a lock-free bump
//! in the current eden region, then the slow path under the heap lock which
//! may replace the region, then an evacuation pause. Humongous objects skip
//! the young generation and take whole regions. Both slow paths are the same
//! retry loop, parameterized by [`AllocKind`]; they differ only in the locked
//! attempt, the GC locker eden expansion and the marking pre-check done
//! before a humongous allocation.
//!
//! Every level returns `Option<usize>`: `None` is the failure sentinel that
//! the caller either retries or hands up. Only the public mutator entry point
//! turns it into [`AllocError`](crate::AllocError).

use std::sync::atomic::Ordering;

use super::alloc_region::AllocPurpose;
use super::vm_ops::VmCollectForAllocation;
use super::Heap;
use crate::gc::policy::MIN_EXPAND_BYTES;
use crate::gc::GcCause;
use crate::object::WORD_SIZE;
use crate::tracing::events;
use crate::vm::SafepointContext;

/// Which of the two allocation state machines is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocKind {
    Young,
    Humongous,
}

impl AllocKind {
    const fn cause(self) -> GcCause {
        match self {
            Self::Young => GcCause::AllocationFailure,
            Self::Humongous => GcCause::HumongousAllocation,
        }
    }
}

/// Bookkeeping carried across the retries of one allocation request.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AllocRetry {
    /// Collection count observed when a pause was last requested.
    pub gc_count_before: u32,
    /// Times the request stalled on the GC locker.
    pub gclocker_retries: u32,
}

impl Heap {
    // ---------------------------------------------------------------------
    // Allocation region owner hooks
    // ---------------------------------------------------------------------

    pub(crate) fn new_mutator_alloc_region(&self, words: usize, force: bool) -> Option<u32> {
        let young_len = self.young_list.lock().length();
        let allowed = {
            let policy = self.policy.lock();
            if force {
                policy.can_expand_young_list(young_len)
            } else {
                policy.should_allocate_mutator_region(young_len)
            }
        };
        if !allowed {
            return None;
        }
        let index = self.new_region(words, false, false)?;
        let region = self.region(index);
        region.set_eden();
        region.record_timestamp(self.total_collections());
        self.young_list.lock().push_eden(region);
        Some(index)
    }

    pub(crate) fn retire_mutator_alloc_region(&self, index: u32, allocated_bytes: usize) {
        let region = self.region(index);
        let predicted = self.policy.lock().predict_region_time_ms(
            true,
            region.used(),
            None,
            region.rem_set().occupied(),
        );
        self.cset.lock().add_young_region(region, predicted);
        self.summary_used
            .fetch_add(allocated_bytes, Ordering::AcqRel);
    }

    pub(crate) fn new_gc_alloc_region(&self, purpose: AllocPurpose, words: usize) -> Option<u32> {
        let index = match purpose {
            AllocPurpose::Survivor => {
                let cap = self.policy.lock().max_survivor_regions();
                if self.survivor_gc_alloc_region.count() >= cap {
                    return None;
                }
                let index = self.new_region(words, false, true)?;
                self.region(index).set_survivor();
                index
            }
            AllocPurpose::Old => {
                let index = self.new_region(words, true, true)?;
                self.region(index).set_old();
                index
            }
            AllocPurpose::Mutator => return None,
        };
        self.region(index)
            .record_timestamp(self.total_collections());
        Some(index)
    }

    pub(crate) fn retire_gc_alloc_region(
        &self,
        purpose: AllocPurpose,
        index: u32,
        allocated_bytes: usize,
    ) {
        let region = self.region(index);
        self.summary_used
            .fetch_add(allocated_bytes, Ordering::AcqRel);
        match purpose {
            AllocPurpose::Survivor => self.young_list.lock().add_survivor(region),
            AllocPurpose::Old => self.sets.lock().old.add(region),
            AllocPurpose::Mutator => debug_assert!(false, "mutator region retired as GC region"),
        }
    }

    /// Allocate `words` for a copy during a pause, outside any PLAB.
    pub(crate) fn par_allocate_during_gc(&self, purpose: AllocPurpose, words: usize) -> Option<usize> {
        let alloc_region = match purpose {
            AllocPurpose::Survivor => &self.survivor_gc_alloc_region,
            AllocPurpose::Old => &self.old_gc_alloc_region,
            AllocPurpose::Mutator => return None,
        };
        alloc_region.attempt_allocation(self, words).or_else(|| {
            let _lock = self.par_gc_alloc_lock.lock();
            alloc_region.attempt_allocation_locked(self, words)
        })
    }

    // ---------------------------------------------------------------------
    // Mutator state machine
    // ---------------------------------------------------------------------

    /// Allocate `words` for a mutator, collecting as needed. `None` means
    /// out of memory.
    pub(crate) fn mem_allocate<C: SafepointContext>(&self, ctx: &mut C, words: usize) -> Option<usize> {
        let mut retry = AllocRetry::default();
        for try_count in 1u32.. {
            let result = if self.is_humongous(words) {
                self.attempt_allocation_humongous(ctx, words, &mut retry)
            } else {
                self.attempt_allocation(ctx, words, &mut retry)
            };
            if result.is_some() {
                return result;
            }

            let mut op = VmCollectForAllocation::escalate(self, words, retry.gc_count_before);
            self.execute_vm_op(ctx, &mut op);
            if op.prologue_succeeded() && op.pause_succeeded() {
                return op.result();
            }
            if retry.gclocker_retries > self.config.gc_locker_retry_allocation_count {
                return None;
            }
            self.warn_if_looping(words, try_count);
        }
        None
    }

    /// Fast path in the current mutator region, then the slow path.
    pub(crate) fn attempt_allocation<C: SafepointContext>(
        &self,
        ctx: &mut C,
        words: usize,
        retry: &mut AllocRetry,
    ) -> Option<usize> {
        debug_assert!(!self.is_humongous(words));
        self.mutator_alloc_region
            .attempt_allocation(self, words)
            .or_else(|| self.attempt_allocation_slow(ctx, words, retry))
    }

    pub(crate) fn attempt_allocation_slow<C: SafepointContext>(
        &self,
        ctx: &mut C,
        words: usize,
        retry: &mut AllocRetry,
    ) -> Option<usize> {
        self.allocation_retry_loop(ctx, words, AllocKind::Young, retry)
    }

    /// Humongous allocation. Checks the marking threshold before allocating
    /// so that a large request cannot outrun the liveness data needed to
    /// reclaim old space.
    pub(crate) fn attempt_allocation_humongous<C: SafepointContext>(
        &self,
        ctx: &mut C,
        words: usize,
        retry: &mut AllocRetry,
    ) -> Option<usize> {
        debug_assert!(self.is_humongous(words));
        if self.need_to_start_conc_mark(words * WORD_SIZE) {
            self.policy.lock().set_initiate_conc_mark_if_possible();
            self.collect_in(ctx, GcCause::HumongousAllocation);
        }
        self.allocation_retry_loop(ctx, words, AllocKind::Humongous, retry)
    }

    fn allocation_retry_loop<C: SafepointContext>(
        &self,
        ctx: &mut C,
        words: usize,
        kind: AllocKind,
        retry: &mut AllocRetry,
    ) -> Option<usize> {
        for try_count in 1u32.. {
            let should_try_gc;
            {
                let _heap = self.heap_lock.lock();
                let result = match kind {
                    AllocKind::Young => self
                        .mutator_alloc_region
                        .attempt_allocation_locked(self, words),
                    AllocKind::Humongous => self.humongous_obj_allocate_locked(words),
                };
                if result.is_some() {
                    return result;
                }

                if self.gc_locker.is_active_and_needs_gc() {
                    // A pause would be refused. Let eden grow a little
                    // instead, then fall back to waiting.
                    if kind == AllocKind::Young && self.can_expand_young_list() {
                        let forced = self
                            .mutator_alloc_region
                            .attempt_allocation_force(self, words);
                        if forced.is_some() {
                            return forced;
                        }
                    }
                    should_try_gc = false;
                } else if self.gc_locker.needs_gc() {
                    should_try_gc = false;
                } else {
                    retry.gc_count_before = self.total_collections();
                    should_try_gc = true;
                }
            }

            if should_try_gc {
                let (result, succeeded) =
                    self.do_collection_pause(ctx, words, retry.gc_count_before, kind.cause());
                if result.is_some() {
                    return result;
                }
                if succeeded {
                    // The pause ran and still could not satisfy the request;
                    // the caller escalates.
                    retry.gc_count_before = self.total_collections();
                    return None;
                }
            } else {
                if retry.gclocker_retries > self.config.gc_locker_retry_allocation_count {
                    return None;
                }
                ctx.blocking(|| self.gc_locker.stall_until_clear());
                retry.gclocker_retries += 1;
            }

            // Another thread may have collected or the locker cleared; the
            // region may have space again.
            if kind == AllocKind::Young {
                if let Some(addr) = self.mutator_alloc_region.attempt_allocation(self, words) {
                    return Some(addr);
                }
            }
            self.warn_if_looping(words, try_count);
        }
        None
    }

    fn can_expand_young_list(&self) -> bool {
        let young_len = self.young_list.lock().length();
        self.policy.lock().can_expand_young_list(young_len)
    }

    fn warn_if_looping(&self, words: usize, try_count: u32) {
        let every = self.config.queued_allocation_warning_count;
        if every > 0 && try_count % every == 0 {
            self.metrics().record_allocation_retry_warning();
            events::allocation_retries(words, try_count);
        }
    }

    /// Schedule an incremental pause that also tries to allocate `words`.
    /// Returns the allocation and whether the pause ran.
    fn do_collection_pause<C: SafepointContext>(
        &self,
        ctx: &mut C,
        words: usize,
        gc_count_before: u32,
        cause: GcCause,
    ) -> (Option<usize>, bool) {
        let mut op = VmCollectForAllocation::incremental(self, words, gc_count_before, cause);
        self.execute_vm_op(ctx, &mut op);
        (op.result(), op.prologue_succeeded() && op.pause_succeeded())
    }

    // ---------------------------------------------------------------------
    // At a safepoint
    // ---------------------------------------------------------------------

    /// Allocate with every mutator stopped. Humongous allocations may arm
    /// marking initiation for the next pause.
    pub(crate) fn attempt_allocation_at_safepoint(&self, words: usize) -> Option<usize> {
        if !self.is_humongous(words) {
            return self.mutator_alloc_region.attempt_allocation_locked(self, words);
        }
        let result = self.humongous_obj_allocate_locked(words);
        if result.is_some() && self.need_to_start_conc_mark(0) {
            self.policy.lock().set_initiate_conc_mark_if_possible();
        }
        result
    }

    /// Grow the heap by at least the request and allocate.
    pub(crate) fn expand_and_allocate(&self, words: usize) -> Option<usize> {
        let bytes = (words * WORD_SIZE).max(MIN_EXPAND_BYTES);
        if self.expand(bytes) {
            self.attempt_allocation_at_safepoint(words)
        } else {
            None
        }
    }

    /// Last resort after an incremental pause failed to make room: allocate,
    /// expand, full collection, full collection clearing soft references.
    /// Returns the allocation and whether every collection attempted ran.
    pub(crate) fn satisfy_failed_allocation(&self, words: usize) -> (Option<usize>, bool) {
        if let Some(addr) = self.attempt_allocation_at_safepoint(words) {
            return (Some(addr), true);
        }
        if let Some(addr) = self.expand_and_allocate(words) {
            return (Some(addr), true);
        }
        for clear_soft_refs in [false, true] {
            if !self.do_full_collection(clear_soft_refs, GcCause::FullAllocationFailure) {
                return (None, false);
            }
            if let Some(addr) = self.attempt_allocation_at_safepoint(words) {
                return (Some(addr), true);
            }
        }
        (None, true)
    }

    // ---------------------------------------------------------------------
    // Marking initiation
    // ---------------------------------------------------------------------

    /// Bytes in old and humongous regions.
    pub(crate) fn non_young_used(&self) -> usize {
        let sets = self.sets.lock();
        sets.old.total_used(&self.regions) + sets.humongous.total_used(&self.regions)
    }

    /// Whether old occupancy plus `alloc_bytes` crosses the marking
    /// threshold while no cycle runs.
    pub(crate) fn need_to_start_conc_mark(&self, alloc_bytes: usize) -> bool {
        let non_young = self.non_young_used();
        let during_cycle = self.marking.in_progress();
        self.policy
            .lock()
            .need_to_start_conc_mark(non_young, alloc_bytes, self.capacity(), during_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::heap::region::RegionKind;
    use crate::heap::Collaborators;
    use crate::vm::Detached;

    const REGION: usize = 256 * 1024;

    fn heap(regions: usize, young: u32) -> std::sync::Arc<Heap> {
        let config = HeapConfig::default()
            .with_region_size(REGION)
            .with_initial_heap_size(regions * REGION)
            .with_max_heap_size(regions * REGION)
            .with_young_list_target_length(young)
            .with_initiating_heap_occupancy_percent(100)
            .with_refinement_threads(0)
            .with_parallel_gc_threads(1);
        Heap::new(config, Collaborators::default()).unwrap()
    }

    #[test]
    fn test_mutator_region_joins_young_list() {
        let heap = heap(8, 4);
        let mut retry = AllocRetry::default();
        let a = heap.attempt_allocation(&mut Detached, 4, &mut retry).unwrap();
        let region = heap.region_containing(a);
        assert_eq!(region.kind(), RegionKind::Eden);
        assert_eq!(heap.young_list_length(), 1);
        assert_eq!(heap.used(), 4 * WORD_SIZE);
    }

    #[test]
    fn test_young_target_limits_mutator_regions() {
        let heap = heap(8, 2);
        assert!(heap.new_mutator_alloc_region(4, false).is_some());
        assert!(heap.new_mutator_alloc_region(4, false).is_some());
        assert!(heap.new_mutator_alloc_region(4, false).is_none());
        // The locker expansion allows a bit more than the target.
        assert!(heap.new_mutator_alloc_region(4, true).is_some());
    }

    #[test]
    fn test_survivor_cap_stops_survivor_regions() {
        let config = HeapConfig::default()
            .with_region_size(REGION)
            .with_initial_heap_size(8 * REGION)
            .with_max_heap_size(8 * REGION)
            .with_max_survivor_regions(0)
            .with_refinement_threads(0);
        let heap = Heap::new(config, Collaborators::default()).unwrap();
        assert!(heap.par_allocate_during_gc(AllocPurpose::Survivor, 4).is_none());
        let old = heap.par_allocate_during_gc(AllocPurpose::Old, 4).unwrap();
        assert_eq!(heap.region_containing(old).kind(), RegionKind::Old);
        heap.old_gc_alloc_region.release(&*heap);
        assert_eq!(heap.old_regions().len(), 1);
    }

    #[test]
    fn test_mem_allocate_collects_when_eden_is_full() {
        let heap = heap(8, 2);
        let words = REGION / WORD_SIZE / 4;
        for _ in 0..32 {
            let addr = heap.mem_allocate(&mut Detached, words).unwrap();
            // SAFETY: freshly allocated, owned by the test.
            unsafe { crate::object::raw::fill(addr, words) };
        }
        assert!(heap.total_collections() > 0);
    }

    #[test]
    fn test_humongous_request_takes_regions() {
        let heap = heap(8, 2);
        let words = REGION / WORD_SIZE + 1;
        let addr = heap.mem_allocate(&mut Detached, words).unwrap();
        assert_eq!(heap.region_containing(addr).kind(), RegionKind::StartsHumongous);
        assert_eq!(heap.humongous_regions().len(), 2);
    }

    /// A locker whose critical section never ends; stalls return at once.
    #[derive(Default)]
    struct StuckLocker {
        stalls: std::sync::atomic::AtomicU32,
    }

    impl crate::gc::gc_locker::GcLocker for StuckLocker {
        fn is_active(&self) -> bool {
            true
        }

        fn is_active_and_needs_gc(&self) -> bool {
            true
        }

        fn needs_gc(&self) -> bool {
            true
        }

        fn stall_until_clear(&self) {
            self.stalls.fetch_add(1, Ordering::Relaxed);
        }

        fn check_active_before_gc(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_locker_stalls_warn_every_n_tries_then_fail() {
        let locker = std::sync::Arc::new(StuckLocker::default());
        let config = HeapConfig::default()
            .with_region_size(REGION)
            .with_initial_heap_size(8 * REGION)
            .with_max_heap_size(8 * REGION)
            .with_initiating_heap_occupancy_percent(100)
            .with_refinement_threads(0)
            .with_parallel_gc_threads(1)
            .with_gc_locker_retry_allocation_count(5)
            .with_queued_allocation_warning_count(2);
        let heap = Heap::new(
            config,
            Collaborators::default().with_gc_locker(locker.clone()),
        )
        .unwrap();

        // Larger than the heap, so every locked attempt fails and every
        // pause is refused.
        let words = 9 * REGION / WORD_SIZE;
        assert_eq!(heap.mem_allocate(&mut Detached, words), None);

        // Tries 1 through 6 stall; the seventh gives up.
        assert_eq!(locker.stalls.load(Ordering::Relaxed), 6);
        assert_eq!(heap.metrics().allocation_retry_warnings(), 3);
        assert_eq!(heap.total_collections(), 0);
    }
}
