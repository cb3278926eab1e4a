//! Parallel evacuation of the collection set.
//!
//! Every worker scans its share of the roots, then claims collection set
//! regions one at a time and scans the cards their remembered sets name.
//! Slots that point into the collection set become tasks; the copying
//! itself happens in [`ParScanThreadState`]. Workers then drain their
//! queues, steal from each other and stop once the terminator sees all of
//! them idle.

use std::time::Instant;

use super::evac_failure::EvacFailure;
use super::refine::iterate_card_slots;
use super::scan_state::ParScanThreadState;
use super::terminator::ParallelTaskTerminator;
use super::worklist::QueueSet;
use crate::heap::card_table::CARD_SIZE;
use crate::heap::region::HeapRegion;
use crate::heap::Heap;
use crate::tracing::GcId;

/// Shared state of one evacuation pause.
pub(crate) struct EvacuationContext<'h> {
    pub(crate) heap: &'h Heap,
    pub(crate) queues: QueueSet,
    pub(crate) terminator: ParallelTaskTerminator,
    pub(crate) evac_failure: EvacFailure,
    pub(crate) cset: Vec<u32>,
    pub(crate) claim_value: u32,
    pub(crate) tenuring_threshold: u32,
    pub(crate) array_chunk: usize,
    pub(crate) plab_words: usize,
    pub(crate) discover_references: bool,
    workers: usize,
}

impl<'h> EvacuationContext<'h> {
    pub(crate) fn new(heap: &'h Heap, cset: Vec<u32>, gc_id: GcId, tenuring_threshold: u32) -> Self {
        let workers = heap.config.parallel_gc_threads.max(1);
        #[allow(clippy::cast_possible_truncation)]
        let claim_value = ((gc_id.0 as u32) & 0x7fff_ffff).max(1);
        Self {
            heap,
            queues: QueueSet::new(workers),
            terminator: ParallelTaskTerminator::new(workers),
            evac_failure: EvacFailure::new(),
            cset,
            claim_value,
            tenuring_threshold,
            array_chunk: heap.config.array_scan_chunk.max(1),
            plab_words: heap.config.plab_size_words,
            discover_references: true,
            workers,
        }
    }

    /// Run the parallel phase. Worker 0 runs on the calling thread.
    /// Returns the final state of every worker, in worker order.
    pub(crate) fn evacuate(&self) -> Vec<ParScanThreadState<'_>> {
        std::thread::scope(|s| {
            let handles: Vec<_> = (1..self.workers)
                .map(|worker| s.spawn(move || self.work(worker)))
                .collect();
            let mut states = Vec::with_capacity(self.workers);
            states.push(self.work(0));
            for handle in handles {
                match handle.join() {
                    Ok(state) => states.push(state),
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            states
        })
    }

    fn work(&self, worker: usize) -> ParScanThreadState<'_> {
        let mut pss = ParScanThreadState::new(self, worker);

        let start = Instant::now();
        self.scan_roots(&mut pss);
        pss.stats.root_scan_time = start.elapsed();

        let start = Instant::now();
        self.scan_rem_sets(&mut pss);
        pss.stats.rs_scan_time = start.elapsed();

        pss.evacuate_followers();
        pss
    }

    /// Process this worker's slice of the root table.
    fn scan_roots(&self, pss: &mut ParScanThreadState<'_>) {
        let chunks = self.heap.roots.chunks();
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let worker = pss.worker();
        let lo = worker * total / self.workers;
        let hi = (worker + 1) * total / self.workers;

        let mut offset = 0;
        for chunk in chunks {
            let chunk_end = offset + chunk.len();
            if chunk_end > lo && offset < hi {
                let from = lo.saturating_sub(offset);
                let to = (hi - offset).min(chunk.len());
                for slot in &chunk[from..to] {
                    pss.do_slot(std::ptr::from_ref(slot) as usize);
                }
            }
            offset = chunk_end;
            if offset >= hi {
                break;
            }
        }
    }

    /// Claim collection set regions and scan the old cards that point
    /// into them. Each worker starts at a different position so claims
    /// rarely collide.
    fn scan_rem_sets(&self, pss: &mut ParScanThreadState<'_>) {
        let len = self.cset.len();
        if len == 0 {
            return;
        }
        let start = pss.worker() * len / self.workers;
        for i in 0..len {
            let region = self.heap.region(self.cset[(start + i) % len]);
            if region.try_claim(self.claim_value) {
                self.scan_rem_set(region, pss);
            }
        }
    }

    fn scan_rem_set(&self, region: &HeapRegion, pss: &mut ParScanThreadState<'_>) {
        let heap = self.heap;
        for from in region.rem_set().source_regions() {
            let source = heap.region(from);
            if !source.is_committed()
                || source.is_free()
                || source.is_young()
                || source.in_collection_set()
            {
                continue;
            }
            let scan_top = source.scan_top();
            region.rem_set().for_each_card_from(from, |card| {
                let global = heap.geometry.global_card(from, card);
                if !heap.card_table.claim(global) {
                    return;
                }
                heap.dirty_cards_regions.push(source);
                let card_start = heap.geometry.card_start(global);
                if card_start >= scan_top {
                    return;
                }
                let card_end = (card_start + CARD_SIZE).min(scan_top);
                pss.stats.cards_scanned += 1;
                let parsed = iterate_card_slots(heap, source, card_start, card_end, |slot| {
                    pss.push_slot(slot);
                });
                debug_assert!(parsed, "unparsable card {global} during a pause");
            });
        }
    }
}
