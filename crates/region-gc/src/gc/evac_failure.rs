//! Evacuation failure.
//!
//! When no destination space is left for an object the worker forwards the
//! object to itself instead. The forwarding happens under one global lock,
//! which also records the displaced mark word if it carries state and
//! pushes the object on a scan stack; the failing worker drains that stack
//! into its own queue. After the parallel phase
//! [`Heap::remove_self_forwarding_pointers`] turns every failed region into
//! an ordinary old region again.

use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::heap::region::HeapRegion;
use crate::heap::Heap;
use crate::object::{raw, HeaderState, MarkWord, WORD_SIZE};

#[derive(Debug, Default)]
struct Inner {
    preserved_marks: Vec<(usize, MarkWord)>,
    scan_stack: Vec<usize>,
    failed_regions: Vec<u32>,
}

/// Evacuation failure bookkeeping of one pause.
#[derive(Debug)]
pub(crate) struct EvacFailure {
    inner: OrderedMutex<Inner>,
}

/// What repairing the failed regions found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RepairSummary {
    pub regions: usize,
    pub objects: usize,
}

impl EvacFailure {
    pub(crate) fn new() -> Self {
        Self {
            inner: OrderedMutex::new(LockOrder::EvacFailure, Inner::default()),
        }
    }

    /// Forward `obj`, whose header was `mark`, to itself. Returns the
    /// object's final location: itself, or wherever a racing worker managed
    /// to copy it.
    pub(crate) fn self_forward(&self, heap: &Heap, obj: usize, mark: MarkWord) -> Result<usize, usize> {
        let mut inner = self.inner.lock();
        // SAFETY: `obj` is an object in a collection set region.
        match unsafe { raw::cas_header(obj, HeaderState::Normal(mark), HeaderState::Forwarded(obj)) } {
            Ok(()) => {}
            Err(HeaderState::Forwarded(to)) => return Err(to),
            Err(other) => {
                debug_assert!(false, "unexpected header {other:?} at {obj:#x}");
                return Err(obj);
            }
        }
        if mark.must_be_preserved() {
            inner.preserved_marks.push((obj, mark));
        }
        inner.scan_stack.push(obj);
        let region = heap.region_containing(obj);
        if region.set_evacuation_failed() {
            inner.failed_regions.push(region.index());
        }
        Ok(obj)
    }

    /// Take the objects waiting to be scanned.
    pub(crate) fn take_scan_stack(&self) -> Vec<usize> {
        std::mem::take(&mut self.inner.lock().scan_stack)
    }

    /// Regions that kept at least one object, in failure order.
    pub(crate) fn failed_regions(&self) -> Vec<u32> {
        self.inner.lock().failed_regions.clone()
    }

    fn take_preserved_marks(&self) -> Vec<(usize, MarkWord)> {
        std::mem::take(&mut self.inner.lock().preserved_marks)
    }
}

impl Heap {
    /// Repair every region that kept self-forwarded objects.
    ///
    /// Self-forwarded objects get a normal header back (the preserved mark
    /// word if one was saved). Everything else below top is dead, either
    /// never reached or copied elsewhere, and is covered with fillers. The
    /// block offset table and the outgoing remembered set entries of the
    /// region are rebuilt, since the region stays in the heap as an old
    /// region.
    pub(crate) fn remove_self_forwarding_pointers(&self, failure: &EvacFailure) -> RepairSummary {
        let mut summary = RepairSummary::default();
        for index in failure.failed_regions() {
            let region = self.region(index);
            let objects = self.repair_region(region);
            region.clear_evacuation_failed();
            summary.regions += 1;
            summary.objects += objects;
        }
        for (obj, mark) in failure.take_preserved_marks() {
            // SAFETY: `obj` is a live object in a repaired region.
            unsafe { raw::set_header(obj, HeaderState::Normal(mark)) };
        }
        summary
    }

    /// Returns the number of objects kept in place.
    fn repair_region(&self, region: &HeapRegion) -> usize {
        let bottom = region.bottom();
        let top = region.top();
        let from = region.index();
        region.bot().reset();

        let mut objects = 0;
        let mut live = 0;
        let mut dead_start = None;
        let mut obj = bottom;
        while obj < top {
            // SAFETY: the region is parsable from bottom to top: objects,
            // fillers and the forwarded originals of copied objects.
            let (words, kept) = unsafe {
                match raw::header(obj) {
                    HeaderState::Forwarded(to) if to == obj => (raw::size_words(obj), true),
                    HeaderState::Forwarded(to) => (raw::size_words(to), false),
                    HeaderState::Normal(_) => (raw::size_words(obj), false),
                    HeaderState::Uninitialized => {
                        debug_assert!(false, "uninitialized object at {obj:#x}");
                        ((top - obj) / WORD_SIZE, false)
                    }
                }
            };
            let end = obj + words * WORD_SIZE;
            if kept {
                if let Some(start) = dead_start.take() {
                    self.fill_dead_range(region, start, obj);
                }
                // SAFETY: as above.
                unsafe { raw::set_header(obj, HeaderState::Normal(MarkWord::PROTOTYPE)) };
                region.bot().record_block(bottom, obj, end);
                let card_base = self.geometry.card_index(bottom);
                // SAFETY: `obj` now has a normal header.
                let shape = unsafe { raw::shape(obj) };
                for i in 0..shape.ref_slots() {
                    let slot = raw::slot_addr(obj, i);
                    self.record_reference(from, self.geometry.card_index(slot) - card_base, slot);
                }
                objects += 1;
                live += words * WORD_SIZE;
            } else if dead_start.is_none() {
                dead_start = Some(obj);
            }
            obj = end;
        }
        if let Some(start) = dead_start {
            self.fill_dead_range(region, start, top);
        }
        region.set_live_bytes(live);
        objects
    }

    /// Cover `[start, end)` of `region` with one filler.
    pub(crate) fn fill_dead_range(&self, region: &HeapRegion, start: usize, end: usize) {
        // SAFETY: the range holds only dead objects and is owned by the
        // caller at a safepoint.
        unsafe { raw::fill(start, (end - start) / WORD_SIZE) };
        region.bot().record_block(region.bottom(), start, end);
    }
}
