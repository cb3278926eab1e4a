//! Per-worker evacuation state.
//!
//! Each pause worker owns a [`ParScanThreadState`]: its task queue, one
//! PLAB per destination, an age table and its statistics. The copying
//! itself is lock free apart from PLAB refills and evacuation failure: a
//! worker allocates the copy in its own buffer, fills it in and then races
//! to install the forwarding pointer. The loser undoes its allocation and
//! uses the winner's copy.

use super::evacuate::EvacuationContext;
use super::policy::AgeTable;
use super::terminator::TerminationStats;
use super::worklist::{ScanTask, WorkerQueue};
use crate::heap::alloc_region::AllocPurpose;
use crate::heap::plab::Plab;
use crate::metrics::WorkerStats;
use crate::object::{raw, HeaderState, MarkWord, ObjectShape, WORD_SIZE};

/// Objects larger than this fraction of a PLAB are copied straight into
/// the shared GC allocation region.
const DIRECT_ALLOCATION_DIVISOR: usize = 4;

pub(crate) struct ParScanThreadState<'a> {
    ctx: &'a EvacuationContext<'a>,
    worker: usize,
    queue: WorkerQueue<'a>,
    survivor_plab: Plab,
    old_plab: Plab,
    pub(crate) age_table: AgeTable,
    pub(crate) stats: WorkerStats,
    pub(crate) surviving_young_words: usize,
    /// Reference objects found while scanning copies, at their new address.
    pub(crate) discovered: Vec<usize>,
}

impl<'a> ParScanThreadState<'a> {
    pub(crate) fn new(ctx: &'a EvacuationContext<'a>, worker: usize) -> Self {
        Self {
            ctx,
            worker,
            queue: WorkerQueue::new(ctx.queues.queue(worker)),
            survivor_plab: Plab::new(),
            old_plab: Plab::new(),
            age_table: AgeTable::new(),
            stats: WorkerStats::default(),
            surviving_young_words: 0,
            discovered: Vec::new(),
        }
    }

    pub(crate) const fn worker(&self) -> usize {
        self.worker
    }

    /// Evacuate whatever the reference at `slot` points to, if it is in the
    /// collection set, and keep remembered sets up to date for the slot.
    pub(crate) fn do_slot(&mut self, slot: usize) {
        let heap = self.ctx.heap;
        // SAFETY: `slot` is a root slot or a reference slot of a live
        // object; nothing else writes it during the pause.
        let value = unsafe { raw::load(slot) };
        if value == 0 {
            return;
        }
        debug_assert!(heap.is_in_reserved(value), "wild reference {value:#x} at {slot:#x}");
        if heap.region_containing(value).in_collection_set() {
            let to = self.copy_to_survivor_space(value);
            // SAFETY: as above.
            unsafe { raw::store(slot, to) };
        }
        self.update_rs(slot);
    }

    /// Record the reference at `slot` in the target's remembered set unless
    /// the slot lives in a young region, which every pause scans anyway.
    fn update_rs(&self, slot: usize) {
        if self.ctx.heap.is_in_reserved(slot) {
            self.ctx.heap.record_reference_from_slot(slot);
        }
    }

    /// Copy `obj` out of the collection set, or find where another worker
    /// already copied it. Returns the new address (the old one if the
    /// object had to stay in place).
    pub(crate) fn copy_to_survivor_space(&mut self, obj: usize) -> usize {
        let heap = self.ctx.heap;
        // SAFETY: `obj` is a live object in a collection set region.
        let mark = match unsafe { raw::header(obj) } {
            HeaderState::Forwarded(to) => return to,
            HeaderState::Normal(mark) => mark,
            HeaderState::Uninitialized => {
                debug_assert!(false, "uninitialized object {obj:#x} reached");
                return obj;
            }
        };
        // SAFETY: as above; the descriptor is only rewritten by the winner
        // of the forwarding race, never in place.
        let shape = unsafe { raw::shape(obj) };
        let words = shape.size_words();
        let from_young = heap.region_containing(obj).is_young();

        let mut purpose = if from_young && mark.age() < self.ctx.tenuring_threshold {
            AllocPurpose::Survivor
        } else {
            AllocPurpose::Old
        };
        let mut to = self.allocate_copy(purpose, words);
        if to.is_none() && purpose == AllocPurpose::Survivor {
            purpose = AllocPurpose::Old;
            to = self.allocate_copy(purpose, words);
        }
        let Some(to) = to else {
            return self.handle_evacuation_failure(obj, mark, from_young, words);
        };

        let new_mark = if purpose == AllocPurpose::Survivor {
            mark.incr_age()
        } else {
            mark
        };
        // SAFETY: `to` is fresh space owned by this worker until the
        // forwarding pointer publishes it.
        unsafe {
            raw::copy_body(obj, to, words);
            raw::set_header(to, HeaderState::Normal(new_mark));
        }
        // SAFETY: `obj` is a collection set object.
        if let Err(found) =
            unsafe { raw::cas_header(obj, HeaderState::Normal(mark), HeaderState::Forwarded(to)) }
        {
            self.undo_copy(purpose, to, words);
            return match found {
                HeaderState::Forwarded(winner) => winner,
                _ => obj,
            };
        }

        self.stats.objects_copied += 1;
        self.stats.bytes_copied += words * WORD_SIZE;
        if purpose == AllocPurpose::Survivor {
            self.age_table.add(new_mark.age(), words);
        }
        if from_young {
            self.surviving_young_words += words;
        }

        match shape {
            ObjectShape::RefArray { len } if len > self.ctx.array_chunk => {
                // The from-space elements are dead now; the first one holds
                // the index of the next chunk to scan.
                // SAFETY: the original is only read by losers of the race
                // above, which discard what they copied.
                unsafe { raw::store(raw::slot_addr(obj, 0), self.ctx.array_chunk) };
                self.queue.push(ScanTask::PartialArray(obj));
                self.push_slots(to, 0, self.ctx.array_chunk);
            }
            _ => self.push_contents(to, shape),
        }
        to
    }

    /// Queue the reference slots of `obj`, or record it as discovered if it
    /// is a reference object.
    fn push_contents(&mut self, obj: usize, shape: ObjectShape) {
        if matches!(shape, ObjectShape::Reference { .. }) && self.ctx.discover_references {
            self.discovered.push(obj);
            return;
        }
        self.push_slots(obj, 0, shape.ref_slots());
    }

    /// Queue `slot` if it points into the collection set. Used for slots
    /// found through remembered sets, whose entries are already recorded.
    pub(crate) fn push_slot(&mut self, slot: usize) {
        // SAFETY: `slot` is a reference slot of a parsed old object.
        let value = unsafe { raw::load(slot) };
        if value != 0 && self.ctx.heap.region_containing(value).in_collection_set() {
            self.queue.push(ScanTask::Slot(slot));
        }
    }

    /// Queue slots `start..end` of `obj` that point into the collection
    /// set and update remembered sets for the others right away.
    fn push_slots(&mut self, obj: usize, start: usize, end: usize) {
        let heap = self.ctx.heap;
        for i in start..end {
            let slot = raw::slot_addr(obj, i);
            // SAFETY: `slot` is within `obj`, which this worker owns.
            let value = unsafe { raw::load(slot) };
            if value == 0 {
                continue;
            }
            if heap.region_containing(value).in_collection_set() {
                self.queue.push(ScanTask::Slot(slot));
            } else {
                self.update_rs(slot);
            }
        }
    }

    fn process_partial_array(&mut self, from: usize) {
        // SAFETY: `from` is the forwarded original of a large array.
        let HeaderState::Forwarded(to) = (unsafe { raw::header(from) }) else {
            debug_assert!(false, "partial array task for unforwarded {from:#x}");
            return;
        };
        // SAFETY: `to` is the completed copy.
        let len = unsafe { raw::shape(to) }.ref_slots();
        let progress = raw::slot_addr(from, 0);
        // SAFETY: only the task holder touches the progress word.
        let start = unsafe { raw::load(progress) };
        let end = (start + self.ctx.array_chunk).min(len);
        if end < len {
            // SAFETY: as above.
            unsafe { raw::store(progress, end) };
            self.queue.push(ScanTask::PartialArray(from));
        }
        self.push_slots(to, start, end);
    }

    fn allocate_copy(&mut self, purpose: AllocPurpose, words: usize) -> Option<usize> {
        let heap = self.ctx.heap;
        let plab_words = self.ctx.plab_words;
        let plab = match purpose {
            AllocPurpose::Old => &mut self.old_plab,
            _ => &mut self.survivor_plab,
        };
        if let Some(addr) = plab.allocate(words) {
            return Some(addr);
        }
        if words * DIRECT_ALLOCATION_DIVISOR > plab_words {
            return heap.par_allocate_during_gc(purpose, words);
        }
        // Keep the old buffer if no new one can be had: it may still fit a
        // smaller object.
        let buf = heap.par_allocate_during_gc(purpose, plab_words)?;
        let wasted = plab.retire();
        plab.set_buf(buf, plab_words);
        let addr = plab.allocate(words);
        self.stats.plab_waste_words += wasted;
        addr
    }

    fn undo_copy(&mut self, purpose: AllocPurpose, addr: usize, words: usize) {
        let plab = match purpose {
            AllocPurpose::Old => &mut self.old_plab,
            _ => &mut self.survivor_plab,
        };
        if plab.contains(addr) {
            plab.undo_allocation(addr, words);
            return;
        }
        if !self.ctx.heap.region_containing(addr).par_undo(addr, words) {
            // SAFETY: the copy was never published.
            unsafe { raw::fill(addr, words) };
            self.stats.undo_waste_words += words;
        }
    }

    fn handle_evacuation_failure(&mut self, obj: usize, mark: MarkWord, from_young: bool, words: usize) -> usize {
        match self.ctx.evac_failure.self_forward(self.ctx.heap, obj, mark) {
            Ok(obj) => {
                self.stats.failed_objects += 1;
                if from_young {
                    self.surviving_young_words += words;
                }
                self.drain_evac_failure_scan_stack();
                obj
            }
            Err(to) => to,
        }
    }

    /// Scan the self-forwarded objects waiting on the failure stack in
    /// place.
    fn drain_evac_failure_scan_stack(&mut self) {
        for obj in self.ctx.evac_failure.take_scan_stack() {
            // SAFETY: the object stays where it is and keeps its shape.
            let shape = unsafe { raw::shape(obj) };
            self.push_contents(obj, shape);
        }
    }

    fn process_task(&mut self, task: ScanTask) {
        match task {
            ScanTask::Slot(slot) => self.do_slot(slot),
            ScanTask::PartialArray(from) => self.process_partial_array(from),
        }
    }

    /// Process local tasks until the queue is empty.
    pub(crate) fn drain_queue(&mut self) {
        while let Some(task) = self.queue.pop() {
            self.process_task(task);
        }
    }

    /// Drain, steal and offer termination until every worker is done.
    pub(crate) fn evacuate_followers(&mut self) {
        let mut termination = TerminationStats::default();
        loop {
            self.drain_queue();
            if let Some(raw_task) = self.ctx.queues.steal(self.worker) {
                self.stats.steals += 1;
                self.process_task(ScanTask::decode(raw_task));
                continue;
            }
            if self
                .ctx
                .terminator
                .offer_termination(&self.ctx.queues, &mut termination)
            {
                break;
            }
        }
        self.stats.termination_time += termination.time;
        self.stats.termination_attempts += termination.attempts;
    }

    /// Fill the unused PLAB tails. Called once the pause is done copying.
    pub(crate) fn retire_plabs(&mut self) {
        self.stats.plab_waste_words += self.survivor_plab.retire() + self.old_plab.retire();
        self.stats.undo_waste_words +=
            self.survivor_plab.undo_wasted_words() + self.old_plab.undo_wasted_words();
    }
}
