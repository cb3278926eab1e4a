//! Concurrent marking.
//!
//! Marking computes the live bytes of every old and humongous region so
//! mixed pauses can pick the regions with the most garbage, and frees the
//! regions it finds completely dead.
//!
//! A cycle is started by an initial-mark pause, which snapshots the
//! survivor regions as marking roots and wakes the marking thread. The
//! thread then
//!
//! 1. scans the root regions outside the suspendible thread set (pauses
//!    wait for this step, see
//!    [`wait_for_root_region_scan`](ConcurrentMarking::wait_for_root_region_scan)),
//! 2. marks the old objects reachable from them, yielding to pauses,
//! 3. finishes marking from the roots in a remark safepoint, clears weak
//!    references whose referent is unmarked, records per-region live bytes
//!    and turns dead objects of old regions into fillers,
//! 4. frees dead regions and ranks the remaining old regions in a cleanup
//!    safepoint, then hands the freed regions to allocators through the
//!    secondary free list.
//!
//! Objects allocated in old regions after remark (through promotion) sit
//! above the recorded top-at-mark-start and are never considered dead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::cset::Candidate;
use super::suspendible::StsJoin;
use crate::heap::region::{HeapRegion, RegionKind};
use crate::heap::Heap;
use crate::object::{raw, HeaderState, ObjectShape, ReferenceStrength, WORD_SIZE};
use crate::tracing::{events, trace_marking, GcId, LogTags, TraceTime};
use crate::vm::{Detached, VmOperation};

/// How long the idle marking thread sleeps before checking whether its
/// heap is gone.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Regions freed by cleanup are handed to the secondary free list in
/// batches of this many.
const FREE_BATCH: usize = 8;

/// Liveness computation for old regions.
pub trait ConcurrentMarking: Send + Sync {
    /// Start background threads. Called once by [`Heap::new`].
    fn start(&self, heap: &Arc<Heap>);

    /// Stop background threads. Does not wait for them.
    fn shutdown(&self);

    /// Whether a cycle is running.
    fn in_progress(&self) -> bool;

    /// Called at the end of an initial-mark pause, at the safepoint.
    fn notify_initial_mark(&self, heap: &Heap, gc_id: GcId);

    /// Wait up to `timeout` for root region scanning to finish. Returns
    /// whether it did.
    fn wait_for_root_region_scan(&self, timeout: Duration) -> bool;

    /// Ask the running cycle to stop, waiting up to `timeout` for the
    /// marking thread to acknowledge. Returns whether it did.
    fn abort(&self, timeout: Duration) -> bool;

    /// Live bytes of `region` according to the last completed cycle.
    fn live_bytes(&self, region: &HeapRegion) -> Option<usize> {
        region.live_bytes()
    }
}

// ============================================================================
// Mark bitmap
// ============================================================================

/// One bit per two heap words over the reserved range.
pub(crate) struct MarkBitmap {
    base: usize,
    bits: Box<[AtomicU64]>,
}

impl MarkBitmap {
    const SHIFT: u32 = (2 * WORD_SIZE).trailing_zeros();

    pub(crate) fn new(base: usize, bytes: usize) -> Self {
        let bits = (bytes >> Self::SHIFT).div_ceil(64);
        Self {
            base,
            bits: (0..bits).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn locate(&self, addr: usize) -> (usize, u64) {
        let bit = (addr - self.base) >> Self::SHIFT;
        (bit / 64, 1 << (bit % 64))
    }

    /// Set the bit for `addr`. Returns whether it was clear before.
    pub(crate) fn mark(&self, addr: usize) -> bool {
        let (word, mask) = self.locate(addr);
        self.bits[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    pub(crate) fn is_marked(&self, addr: usize) -> bool {
        let (word, mask) = self.locate(addr);
        self.bits[word].load(Ordering::Acquire) & mask != 0
    }

    pub(crate) fn clear(&self) {
        for w in &*self.bits {
            w.store(0, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Which objects a [`Tracer`] marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkScope {
    /// Only objects in old and humongous regions. Used concurrently.
    OldOnly,
    /// Every object. Used at a safepoint.
    Everything,
}

/// Depth-first marker over a [`MarkBitmap`].
pub(crate) struct Tracer<'h> {
    heap: &'h Heap,
    bitmap: &'h MarkBitmap,
    scope: MarkScope,
    /// Whether soft referents are traced like ordinary references.
    trace_soft: bool,
    stack: Vec<usize>,
    /// Reference objects whose referent was not traced.
    pub(crate) discovered: Vec<usize>,
    pub(crate) marked: usize,
}

impl<'h> Tracer<'h> {
    pub(crate) fn new(heap: &'h Heap, bitmap: &'h MarkBitmap, scope: MarkScope, trace_soft: bool) -> Self {
        Self {
            heap,
            bitmap,
            scope,
            trace_soft,
            stack: Vec::new(),
            discovered: Vec::new(),
            marked: 0,
        }
    }

    /// Mark `obj` and queue it for scanning if it was not marked yet.
    pub(crate) fn mark_object(&mut self, obj: usize) {
        if obj == 0 || !self.heap.is_in_reserved(obj) {
            return;
        }
        let region = self.heap.region_containing(obj);
        if !region.is_committed() || region.is_free() {
            return;
        }
        if self.scope == MarkScope::OldOnly && !region.is_old_or_humongous() {
            return;
        }
        if self.bitmap.mark(obj) {
            self.marked += 1;
            self.stack.push(obj);
        }
    }

    /// Queue an already marked object for scanning.
    pub(crate) fn push_marked(&mut self, obj: usize) {
        self.stack.push(obj);
    }

    /// Mark whatever every root slot points to.
    pub(crate) fn mark_roots(&mut self) {
        let mut targets = Vec::new();
        self.heap
            .roots
            .for_each_slot(|slot| targets.push(slot.load(Ordering::Acquire)));
        for obj in targets {
            self.mark_object(obj);
        }
    }

    /// Mark the targets of the reference slots of `obj`.
    fn scan(&mut self, obj: usize) {
        // SAFETY: `obj` is a marked object in a committed, non-free region;
        // mutators only write its slots atomically.
        let shape = match unsafe { raw::header(obj) } {
            // Published later by its allocating mutator; remark rescans it.
            HeaderState::Uninitialized => return,
            HeaderState::Forwarded(to) => {
                debug_assert!(false, "forwarded object {obj:#x} -> {to:#x} while marking");
                return;
            }
            // SAFETY: as above.
            HeaderState::Normal(_) => unsafe { raw::shape(obj) },
        };
        match shape {
            ObjectShape::Reference { strength, .. } => {
                let traced = strength == ReferenceStrength::Soft && self.trace_soft;
                if traced {
                    // SAFETY: slot 0 of a reference object is its referent.
                    let referent = unsafe { raw::load(raw::slot_addr(obj, 0)) };
                    self.mark_object(referent);
                } else if self.scope == MarkScope::Everything {
                    self.discovered.push(obj);
                }
            }
            _ => {
                for i in 0..shape.ref_slots() {
                    // SAFETY: `i` is below the slot count of `obj`.
                    let value = unsafe { raw::load(raw::slot_addr(obj, i)) };
                    self.mark_object(value);
                }
            }
        }
    }

    /// Scan until the stack is empty. `should_stop` runs before every
    /// object; returns `false` if it stopped the drain early.
    pub(crate) fn drain(&mut self, mut should_stop: impl FnMut() -> bool) -> bool {
        while let Some(obj) = self.stack.pop() {
            if should_stop() {
                return false;
            }
            self.scan(obj);
        }
        true
    }

    /// Clear the referent of every discovered reference whose referent is
    /// unmarked. Returns how many were cleared.
    pub(crate) fn clear_unmarked_referents(&mut self) -> usize {
        let mut cleared = 0;
        for reference in std::mem::take(&mut self.discovered) {
            let slot = raw::slot_addr(reference, 0);
            // SAFETY: called at a safepoint on live reference objects.
            let referent = unsafe { raw::load(slot) };
            if referent != 0 && !self.bitmap.is_marked(referent) {
                // SAFETY: as above.
                unsafe { raw::store(slot, 0) };
                cleared += 1;
            }
        }
        cleared
    }
}

/// Visit `(address, words)` of every object in `region`: the objects and
/// fillers of an old or young region, or the one object a humongous run
/// starts with. Continues-humongous regions have no objects of their own.
/// Only valid when the region is parsable, at a safepoint.
pub(crate) fn walk_objects(region: &HeapRegion, mut f: impl FnMut(usize, usize)) {
    match region.kind() {
        RegionKind::Free | RegionKind::ContinuesHumongous => {}
        RegionKind::StartsHumongous => {
            let obj = region.bottom();
            // SAFETY: a humongous run starts with its object.
            if let HeaderState::Normal(_) = unsafe { raw::header(obj) } {
                // SAFETY: as above.
                f(obj, unsafe { raw::size_words(obj) });
            }
        }
        RegionKind::Eden | RegionKind::Survivor | RegionKind::Old => {
            let top = region.top();
            let mut obj = region.bottom();
            while obj < top {
                // SAFETY: objects are laid out back to back below top.
                let words = match unsafe { raw::header(obj) } {
                    HeaderState::Normal(_) => unsafe { raw::size_words(obj) },
                    _ => {
                        debug_assert!(false, "unparsable object at {obj:#x}");
                        return;
                    }
                };
                f(obj, words);
                obj += words * WORD_SIZE;
            }
        }
    }
}

// ============================================================================
// LivenessMarker
// ============================================================================

#[derive(Debug, Default)]
struct Control {
    requested: Option<(GcId, Vec<u32>)>,
    root_scan_done: bool,
    running: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    control: Mutex<Control>,
    cv: Condvar,
    in_progress: AtomicBool,
    abort_requested: AtomicBool,
}

impl Shared {
    fn aborted(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    fn root_scan_finished(&self) {
        self.control.lock().root_scan_done = true;
        self.cv.notify_all();
    }

    fn cycle_finished(&self) {
        let mut c = self.control.lock();
        c.root_scan_done = true;
        self.in_progress.store(false, Ordering::Release);
        drop(c);
        self.cv.notify_all();
    }
}

/// The built-in [`ConcurrentMarking`]: one background thread running the
/// cycle described in the module documentation.
#[derive(Debug, Default)]
pub struct LivenessMarker {
    shared: Arc<Shared>,
}

impl LivenessMarker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConcurrentMarking for LivenessMarker {
    fn start(&self, heap: &Arc<Heap>) {
        let shared = Arc::clone(&self.shared);
        let weak = Arc::downgrade(heap);
        shared.control.lock().running = true;
        let spawned = std::thread::Builder::new()
            .name("region-gc-marker".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || marking_thread_loop(&shared, &weak)
            });
        if spawned.is_err() {
            // Without the thread initial-mark pauses start nothing.
            shared.control.lock().running = false;
        }
    }

    fn shutdown(&self) {
        self.shared.control.lock().shutdown = true;
        self.shared.abort_requested.store(true, Ordering::Release);
        self.shared.cv.notify_all();
    }

    fn in_progress(&self) -> bool {
        self.shared.in_progress.load(Ordering::Acquire)
    }

    fn notify_initial_mark(&self, heap: &Heap, gc_id: GcId) {
        let mut c = self.shared.control.lock();
        if c.shutdown || !c.running || self.in_progress() {
            return;
        }
        let roots = heap.survivor_regions();
        events::marking_started(gc_id, roots.len());
        c.requested = Some((gc_id, roots));
        c.root_scan_done = false;
        self.shared.abort_requested.store(false, Ordering::Release);
        self.shared.in_progress.store(true, Ordering::Release);
        drop(c);
        self.shared.cv.notify_all();
    }

    fn wait_for_root_region_scan(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut c = self.shared.control.lock();
        while !c.root_scan_done && self.in_progress() {
            if self.shared.cv.wait_until(&mut c, deadline).timed_out() {
                return c.root_scan_done || !self.in_progress();
            }
        }
        true
    }

    fn abort(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        let mut c = shared.control.lock();
        if !self.in_progress() {
            return true;
        }
        shared.abort_requested.store(true, Ordering::Release);
        shared.cv.notify_all();
        // Root region scanning runs outside the suspendible set, so the
        // caller cannot touch the heap before it has stopped.
        while !c.root_scan_done && self.in_progress() {
            shared.cv.wait(&mut c);
        }
        let deadline = Instant::now() + timeout;
        while self.in_progress() {
            if shared.cv.wait_until(&mut c, deadline).timed_out() {
                break;
            }
        }
        let acknowledged = !self.in_progress();
        drop(c);
        events::marking_aborted(acknowledged);
        acknowledged
    }
}

fn marking_thread_loop(shared: &Shared, heap: &Weak<Heap>) {
    let mut bitmap: Option<MarkBitmap> = None;
    loop {
        let (gc_id, roots) = {
            let mut c = shared.control.lock();
            loop {
                if c.shutdown {
                    c.running = false;
                    if c.requested.take().is_some() {
                        drop(c);
                        shared.cycle_finished();
                    }
                    return;
                }
                if let Some(request) = c.requested.take() {
                    break request;
                }
                shared.cv.wait_for(&mut c, IDLE_WAIT);
                if heap.strong_count() == 0 {
                    c.running = false;
                    return;
                }
            }
        };
        let Some(heap) = heap.upgrade() else {
            shared.control.lock().running = false;
            shared.cycle_finished();
            return;
        };
        let bitmap = bitmap.get_or_insert_with(|| {
            MarkBitmap::new(heap.geometry.base, heap.max_capacity())
        });
        let completed = MarkingCycle {
            heap: &heap,
            shared,
            bitmap,
            gc_id,
        }
        .run(&roots);
        if !completed {
            heap.metrics().record_marking_abort();
        }
        shared.cycle_finished();
    }
}

/// Everything remark hands to cleanup.
#[derive(Debug, Default)]
struct RemarkOutcome {
    /// Top at remark of every old region and humongous head.
    tams: Vec<(u32, usize)>,
    live_bytes: usize,
}

struct MarkingCycle<'a> {
    heap: &'a Heap,
    shared: &'a Shared,
    bitmap: &'a MarkBitmap,
    gc_id: GcId,
}

impl MarkingCycle<'_> {
    /// Returns whether the cycle completed.
    fn run(&self, root_regions: &[u32]) -> bool {
        let heap = self.heap;
        let tags = heap.config.trace_tags;
        let _timer = TraceTime::for_tags("concurrent mark cycle", LogTags::MARKING, tags);
        self.bitmap.clear();

        let mut tracer = Tracer::new(heap, self.bitmap, MarkScope::OldOnly, true);
        let scanned = {
            let _span = trace_marking("root_region_scan", self.gc_id);
            self.scan_root_regions(&mut tracer, root_regions)
        };
        self.shared.root_scan_finished();
        if !scanned {
            return false;
        }

        {
            let _span = trace_marking("concurrent_mark", self.gc_id);
            let join = heap.sts.join();
            if !tracer.drain(|| self.yield_or_abort(&join)) {
                return false;
            }
        }

        let mut remark = None;
        let mut op = MarkingPause {
            name: "remark",
            heap,
            shared: self.shared,
            work: |heap: &Heap| {
                let _span = trace_marking("remark", self.gc_id);
                remark = Some(self.remark(heap));
            },
        };
        heap.execute_vm_op(&mut Detached, &mut op);
        let Some(remark) = remark else {
            return false;
        };

        let mut freed = Vec::new();
        let mut candidates = 0;
        let mut ran = false;
        let mut op = MarkingPause {
            name: "cleanup",
            heap,
            shared: self.shared,
            work: |heap: &Heap| {
                let _span = trace_marking("cleanup", self.gc_id);
                (freed, candidates) = cleanup(heap, &remark.tams);
                ran = true;
            },
        };
        heap.execute_vm_op(&mut Detached, &mut op);
        if !ran {
            return false;
        }

        {
            let _span = trace_marking("free_regions", self.gc_id);
            for batch in freed.chunks(FREE_BATCH) {
                heap.secondary_free_list.append(batch, &heap.regions);
            }
            heap.secondary_free_list.reset_free_regions_coming();
        }

        heap.metrics().record_marking_cycle();
        events::marking_finished(self.gc_id, remark.live_bytes, freed.len(), candidates);
        true
    }

    fn yield_or_abort(&self, join: &StsJoin<'_>) -> bool {
        if join.should_yield() {
            join.yield_now();
        }
        self.shared.aborted() || self.heap.is_shutting_down()
    }

    /// Mark the old objects the survivor regions point to.
    fn scan_root_regions(&self, tracer: &mut Tracer<'_>, root_regions: &[u32]) -> bool {
        for &index in root_regions {
            let region = self.heap.region(index);
            let top = region.top();
            let mut obj = region.bottom();
            while obj < top {
                if self.shared.aborted() {
                    return false;
                }
                // SAFETY: survivor regions stay parsable and in place until
                // the next pause, which waits for this scan.
                let shape = match unsafe { raw::header(obj) } {
                    HeaderState::Normal(_) => unsafe { raw::shape(obj) },
                    _ => break,
                };
                for i in 0..shape.ref_slots() {
                    // SAFETY: as above.
                    let value = unsafe { raw::load(raw::slot_addr(obj, i)) };
                    tracer.mark_object(value);
                }
                obj += shape.size_words() * WORD_SIZE;
            }
        }
        true
    }

    fn remark(&self, heap: &Heap) -> RemarkOutcome {
        let mut tracer = Tracer::new(heap, self.bitmap, MarkScope::Everything, true);
        let old: Vec<u32> = {
            let sets = heap.sets.lock();
            sets.old.iter().chain(sets.humongous.iter()).collect()
        };

        // Marked objects may have been written since they were scanned.
        for &index in &old {
            walk_objects(heap.region(index), |obj, _| {
                if self.bitmap.is_marked(obj) {
                    tracer.push_marked(obj);
                }
            });
        }
        tracer.mark_roots();
        tracer.drain(|| false);
        tracer.clear_unmarked_referents();

        let mut outcome = RemarkOutcome::default();
        for &index in &old {
            let region = heap.region(index);
            match region.kind() {
                RegionKind::Old => {
                    let live = self.scrub_region(heap, region);
                    region.set_live_bytes(live);
                    outcome.live_bytes += live;
                    outcome.tams.push((index, region.top()));
                }
                RegionKind::StartsHumongous => {
                    let live = self.bitmap.is_marked(region.bottom());
                    for r in heap.humongous_run(index) {
                        let bytes = if live { r.used() } else { 0 };
                        r.set_live_bytes(bytes);
                        outcome.live_bytes += bytes;
                    }
                    outcome.tams.push((index, region.top()));
                }
                _ => {}
            }
        }
        outcome
    }

    /// Sum the marked objects of `region` and replace every run of dead
    /// objects with one filler.
    fn scrub_region(&self, heap: &Heap, region: &HeapRegion) -> usize {
        let bottom = region.bottom();
        let mut objects = Vec::new();
        walk_objects(region, |obj, words| objects.push((obj, words)));

        region.bot().reset();
        let mut live = 0;
        let mut dead_start = None;
        for (obj, words) in objects {
            let end = obj + words * WORD_SIZE;
            if self.bitmap.is_marked(obj) {
                if let Some(start) = dead_start.take() {
                    heap.fill_dead_range(region, start, obj);
                }
                region.bot().record_block(bottom, obj, end);
                live += words * WORD_SIZE;
            } else if dead_start.is_none() {
                dead_start = Some(obj);
            }
        }
        if let Some(start) = dead_start {
            heap.fill_dead_range(region, start, region.top());
        }
        live
    }
}

/// Free the regions remark found dead and rank the rest. Returns the freed
/// regions, cleared and on no list, and the number of candidates.
fn cleanup(heap: &Heap, tams: &[(u32, usize)]) -> (Vec<u32>, usize) {
    let region_bytes = heap.region_size();
    let threshold = heap.config.mixed_gc_live_threshold_percent as usize;

    let mut freed = Vec::new();
    let mut candidates = Vec::new();
    let policy = heap.policy.lock();
    for &(index, top_at_remark) in tams {
        let region = heap.region(index);
        let Some(live) = region.live_bytes() else {
            continue;
        };
        match region.kind() {
            RegionKind::StartsHumongous if live == 0 => {
                freed.extend(heap.humongous_run(index).map(HeapRegion::index));
            }
            RegionKind::Old if region.top() == top_at_remark => {
                let used = region.used();
                if live == 0 {
                    freed.push(index);
                } else if live * 100 < region_bytes * threshold && used > live {
                    let predicted = policy.predict_region_time_ms(
                        false,
                        used,
                        Some(live),
                        region.rem_set().occupied(),
                    );
                    candidates.push(Candidate::new(index, used - live, predicted));
                }
            }
            _ => {}
        }
    }
    drop(policy);

    if !freed.is_empty() {
        let mut released = 0;
        let mut sets = heap.sets.lock();
        for &index in &freed {
            let region = heap.region(index);
            if !sets.old.remove(region) {
                sets.humongous.remove(region);
            }
            released += region.used();
            region.hr_clear();
        }
        drop(sets);
        let _ = heap
            .summary_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                Some(u.saturating_sub(released))
            });
        heap.secondary_free_list.set_free_regions_coming();
    }

    let n = candidates.len();
    let mut chooser = heap.chooser.lock();
    chooser.build(candidates);
    heap.policy.lock().record_concurrent_mark_cleanup_end(n);
    drop(chooser);
    (freed, n)
}

/// A marking step that must run at a safepoint. Skipped once the cycle is
/// aborted.
struct MarkingPause<'a, F: FnMut(&Heap)> {
    name: &'static str,
    heap: &'a Heap,
    shared: &'a Shared,
    work: F,
}

impl<F: FnMut(&Heap)> VmOperation for MarkingPause<'_, F> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn doit_prologue(&mut self) -> bool {
        !self.shared.aborted()
    }

    fn doit(&mut self) {
        let heap = self.heap;
        let _safepoint = heap.enter_safepoint();
        let _heap_lock = heap.heap_lock.lock();
        if self.shared.aborted() {
            return;
        }
        (self.work)(heap);
        heap.verify_or_panic(self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_mark_once() {
        let base = 0x4000_0000;
        let bitmap = MarkBitmap::new(base, 1 << 20);
        let obj = base + 64 * WORD_SIZE;
        assert!(!bitmap.is_marked(obj));
        assert!(bitmap.mark(obj));
        assert!(!bitmap.mark(obj));
        assert!(bitmap.is_marked(obj));
        assert!(!bitmap.is_marked(obj + 2 * WORD_SIZE));
        bitmap.clear();
        assert!(!bitmap.is_marked(obj));
    }

    #[test]
    fn test_bitmap_last_granule() {
        let base = 0x4000_0000;
        let bytes = 1 << 16;
        let bitmap = MarkBitmap::new(base, bytes);
        let last = base + bytes - 2 * WORD_SIZE;
        assert!(bitmap.mark(last));
        assert!(bitmap.is_marked(last));
    }

    #[test]
    fn test_idle_marker_aborts_immediately() {
        let marker = LivenessMarker::new();
        assert!(!marker.in_progress());
        assert!(marker.abort(Duration::from_millis(1)));
        assert!(marker.wait_for_root_region_scan(Duration::from_millis(1)));
    }
}
