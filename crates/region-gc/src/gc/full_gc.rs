//! Full collection.
//!
//! The heap falls back to a full collection when incremental pauses cannot
//! free enough space. [`Heap::do_full_collection`] owns the entry and exit
//! contract: it stops marking, empties the young generation and the
//! collection set, runs the [`FullCollector`] and rebuilds the allocation
//! state and the policy afterwards. The collector itself only has to leave
//! every live object in an old or humongous region, with region sets, free
//! list and remembered sets consistent.
//!
//! The built-in [`CompactingFullCollector`] is a single threaded
//! mark-compact: it marks from the roots, slides live objects towards the
//! bottom of the lowest non-humongous regions, frees dead humongous objects
//! and rebuilds block offset tables and remembered sets.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::marking::{walk_objects, MarkBitmap, MarkScope, Tracer};
use super::GcCause;
use crate::heap::region::{HeapRegion, RegionKind};
use crate::heap::Heap;
use crate::metrics::{PauseKind, PauseMetrics};
use crate::object::{raw, WORD_SIZE};
use crate::tracing::{events, trace_gc_pause, trace_phase, LogTags, TraceTime};

/// Whole-heap collection run at a safepoint.
pub trait FullCollector: Send + Sync {
    /// Collect the whole heap. `clear_soft_refs` asks for every soft
    /// reference whose referent is otherwise unreachable to be cleared.
    /// Returns whether the collection ran.
    fn collect(&self, heap: &Heap, clear_soft_refs: bool) -> bool;
}

/// The built-in sliding mark-compact collector.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactingFullCollector;

impl CompactingFullCollector {
    pub const fn new() -> Self {
        Self
    }
}

/// One object to move, planned before anything moves.
#[derive(Debug, Clone, Copy)]
struct Move {
    from: usize,
    to: usize,
    words: usize,
}

impl FullCollector for CompactingFullCollector {
    fn collect(&self, heap: &Heap, clear_soft_refs: bool) -> bool {
        let bitmap = MarkBitmap::new(heap.geometry.base, heap.max_capacity());
        {
            let _phase = trace_phase("full_mark");
            let mut tracer = Tracer::new(heap, &bitmap, MarkScope::Everything, !clear_soft_refs);
            tracer.mark_roots();
            tracer.drain(|| false);
            tracer.clear_unmarked_referents();
        }

        // Every region that can be compacted, in index order. Objects only
        // ever slide to lower addresses.
        let compactable: Vec<u32> = heap
            .regions
            .iter()
            .filter(|r| {
                r.is_committed() && matches!(r.kind(), RegionKind::Eden | RegionKind::Survivor | RegionKind::Old)
            })
            .map(HeapRegion::index)
            .collect();

        let _phase = trace_phase("full_compact");
        let (moves, new_tops) = plan(heap, &bitmap, &compactable);
        let forwarding: HashMap<usize, usize> = moves
            .iter()
            .filter(|m| m.from != m.to)
            .map(|m| (m.from, m.to))
            .collect();
        let live_humongous = sweep_humongous(heap, &bitmap);

        // Adjust every reference before anything moves.
        let forward = |slot: usize| {
            // SAFETY: `slot` is a reference slot of a live object or a root.
            let value = unsafe { raw::load(slot) };
            if let Some(&to) = forwarding.get(&value) {
                // SAFETY: as above.
                unsafe { raw::store(slot, to) };
            }
        };
        heap.roots.for_each_slot(|slot| {
            if let Some(&to) = forwarding.get(&slot.load(Ordering::Acquire)) {
                slot.store(to, Ordering::Release);
            }
        });
        for m in &moves {
            for_each_slot(m.from, &forward);
        }
        for &head in &live_humongous {
            for_each_slot(heap.region(head).bottom(), &forward);
        }

        for m in &moves {
            if m.from == m.to {
                continue;
            }
            // SAFETY: `to` lies below `from` and every object between them
            // has already moved; the header is read before the body is
            // copied over it.
            unsafe {
                let header = raw::header(m.from);
                raw::copy_body(m.from, m.to, m.words);
                raw::set_header(m.to, header);
            }
        }

        rebuild_regions(heap, &compactable, &new_tops);
        rebuild_rem_sets(heap);
        true
    }
}

/// Assign every marked object of `compactable` its new address. Returns
/// the moves in ascending source order and the new top of each region.
fn plan(heap: &Heap, bitmap: &MarkBitmap, compactable: &[u32]) -> (Vec<Move>, Vec<usize>) {
    let mut moves = Vec::new();
    let mut new_tops: Vec<usize> = compactable.iter().map(|&i| heap.region(i).bottom()).collect();
    let mut dest = 0;
    for &index in compactable {
        walk_objects(heap.region(index), |obj, words| {
            if !bitmap.is_marked(obj) {
                return;
            }
            let bytes = words * WORD_SIZE;
            while new_tops[dest] + bytes > heap.region(compactable[dest]).end() {
                dest += 1;
            }
            moves.push(Move {
                from: obj,
                to: new_tops[dest],
                words,
            });
            new_tops[dest] += bytes;
        });
    }
    (moves, new_tops)
}

/// Free every humongous object that was not marked. Returns the heads of
/// the live ones.
fn sweep_humongous(heap: &Heap, bitmap: &MarkBitmap) -> Vec<u32> {
    let heads: Vec<u32> = heap
        .regions
        .iter()
        .filter(|r| r.is_committed() && r.kind() == RegionKind::StartsHumongous)
        .map(HeapRegion::index)
        .collect();
    let mut live = Vec::new();
    for head in heads {
        if bitmap.is_marked(heap.region(head).bottom()) {
            live.push(head);
            continue;
        }
        let run: Vec<u32> = heap.humongous_run(head).map(HeapRegion::index).collect();
        for index in run {
            heap.free_region(index);
        }
    }
    live
}

fn for_each_slot(obj: usize, f: &impl Fn(usize)) {
    // SAFETY: `obj` is a live, initialized object.
    let shape = unsafe { raw::shape(obj) };
    for i in 0..shape.ref_slots() {
        f(raw::slot_addr(obj, i));
    }
}

/// Turn compacted regions into old regions, or free them if nothing moved
/// into them.
fn rebuild_regions(heap: &Heap, compactable: &[u32], new_tops: &[usize]) {
    let mut emptied = Vec::new();
    let mut sets = heap.sets.lock();
    for (&index, &top) in compactable.iter().zip(new_tops) {
        let region = heap.region(index);
        sets.old.remove(region);
        if top == region.bottom() {
            emptied.push(index);
            continue;
        }
        region.set_old();
        region.set_top(top);
        region.set_in_collection_set(false);
        region.set_young_index_in_cset(-1);
        region.reset_claim();
        region.save_scan_top();
        region.bot().reset();
        let bottom = region.bottom();
        walk_objects(region, |obj, words| {
            region.bot().record_block(bottom, obj, obj + words * WORD_SIZE);
        });
        sets.old.add(region);
    }
    drop(sets);
    heap.free_cleared_regions(&emptied);
}

/// Recompute every remembered set from the surviving objects.
fn rebuild_rem_sets(heap: &Heap) {
    for region in heap.regions.iter().filter(|r| r.is_committed()) {
        region.rem_set().clear();
    }
    for region in heap.regions.iter().filter(|r| r.is_committed() && r.is_old_or_humongous()) {
        region.clear_live_bytes();
        walk_objects(region, |obj, _| {
            for_each_slot(obj, &|slot| heap.record_reference_from_slot(slot));
        });
    }
}

impl Heap {
    /// Run a full collection at a safepoint. Returns `false` without
    /// collecting if a critical section is active or the collector refused.
    pub(crate) fn do_full_collection(&self, clear_soft_refs: bool, cause: GcCause) -> bool {
        if self.gc_locker.check_active_before_gc() {
            return false;
        }
        let start = Instant::now();
        let gc_id = self.gc_ids.next_id();
        let tags = self.config.trace_tags;
        let _span = trace_gc_pause(PauseKind::Full.as_str(), cause, gc_id);
        let _timer = TraceTime::for_tags("full collection", LogTags::GC, tags);

        let used_before = self.used();
        events::full_gc_start(gc_id, clear_soft_refs, used_before);
        self.verify_or_panic("before full collection");

        self.marking
            .abort(Duration::from_millis(self.config.marking_abort_wait_ms));
        self.merge_secondary_free_list(true);
        self.prepare_for_full_collection();

        let collected = self.full_collector.collect(self, clear_soft_refs);

        self.summary_used
            .store(self.recalculate_used(), Ordering::Release);
        let available = self.free_regions() + (self.max_regions() - self.committed_regions());
        {
            let mut policy = self.policy.lock();
            policy.reset_after_full();
            policy.update_young_list_target_length(available, 0, self.committed_regions());
        }
        self.cset.lock().start_incremental_building();
        if collected {
            self.resize_if_necessary_after_full_collection();
        }
        self.total_collections.fetch_add(1, Ordering::AcqRel);
        self.total_full_collections.fetch_add(1, Ordering::AcqRel);
        self.mutator_alloc_region.init();
        self.verify_or_panic("after full collection");

        let used_after = self.used();
        events::full_gc_end(gc_id, used_before, used_after);
        self.record_pause(PauseMetrics {
            gc_id: gc_id.0,
            kind: PauseKind::Full,
            cause: Some(cause),
            duration: start.elapsed(),
            used_before,
            used_after,
            ..PauseMetrics::default()
        });
        collected
    }

    /// Empty the young generation, the collection sets and the card
    /// queues so the collector sees only plain regions.
    fn prepare_for_full_collection(&self) {
        self.mutator_alloc_region.release(self);
        self.cset.lock().abandon(&self.regions);
        self.young_list.lock().take_all(&self.regions);
        self.chooser.lock().clear();
        self.dirty_card_queue.discard();
        self.clear_dirty_cards_regions();
        self.card_table.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::heap::Collaborators;
    use crate::object::ObjectShape;

    const REGION: usize = 256 * 1024;

    fn heap() -> std::sync::Arc<Heap> {
        let config = HeapConfig::default()
            .with_region_size(REGION)
            .with_initial_heap_size(8 * REGION)
            .with_max_heap_size(8 * REGION)
            .with_refinement_threads(0)
            .with_initiating_heap_occupancy_percent(100)
            .with_verify(true);
        Heap::new(config, Collaborators::default()).unwrap()
    }

    #[test]
    fn test_full_collection_compacts_live_objects() {
        let heap = heap();
        let mut m = heap.attach();
        let shape = ObjectShape::Plain { refs: 1, data: 1 };
        let mut kept = Vec::new();
        for i in 0..200 {
            let obj = m.allocate(shape).unwrap();
            if i % 10 == 0 {
                m.write_word(obj, 0, i);
                kept.push(m.root(obj));
            }
        }
        let head = kept[0].get(&m).unwrap();
        let tail = kept[1].get(&m).unwrap();
        m.write_ref(head, 0, Some(tail));
        drop(m);

        assert!(heap.full_collect(false));
        assert_eq!(heap.total_full_collections(), 1);
        assert_eq!(heap.young_list_length(), 0);
        assert_eq!(heap.old_regions().len(), 1);

        let m = heap.attach();
        for (i, root) in kept.iter().enumerate() {
            let obj = root.get(&m).unwrap();
            assert_eq!(m.read_word(obj, 0), i * 10);
        }
        let head = kept[0].get(&m).unwrap();
        assert_eq!(m.read_ref(head, 0), kept[1].get(&m));
        assert_eq!(heap.used(), kept.len() * shape.size_words() * WORD_SIZE);
    }

    #[test]
    fn test_full_collection_frees_dead_humongous() {
        let heap = heap();
        let mut m = heap.attach();
        let big = ObjectShape::Plain {
            refs: 0,
            data: u32::try_from(REGION / WORD_SIZE).unwrap(),
        };
        let dead = m.allocate(big).unwrap();
        let live = m.allocate(big).unwrap();
        let root = m.root(live);
        let dead_region = heap.region_containing(dead.addr()).index();
        drop(m);

        assert_eq!(heap.humongous_regions().len(), 4);
        assert!(heap.full_collect(false));
        assert_eq!(heap.humongous_regions().len(), 2);
        assert!(heap.region(dead_region).is_free());
        let m = heap.attach();
        assert_eq!(root.get(&m).map(|o| o.addr()), Some(live.addr()));
    }
}
