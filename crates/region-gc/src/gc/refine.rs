//! Concurrent refinement.
//!
//! Mutators dirty a card when they store a cross-region reference into an
//! old or humongous object and queue the card. Refinement threads pop those
//! cards, clean them and record every outgoing reference found in the card
//! in the target region's remembered set. Pauses drain whatever is left
//! before they look at remembered sets.

use std::sync::Weak;
use std::time::Duration;

use crate::heap::card_table::CARD_SIZE;
use crate::heap::region::{HeapRegion, RegionKind};
use crate::heap::Heap;
use crate::object::{raw, HeaderState, WORD_SIZE};
use crate::tracing::events;

/// How long an idle refinement thread sleeps before it rechecks shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Body of refinement thread `worker`.
///
/// The thread only holds a strong heap reference while it works on a batch,
/// so dropping the last user handle is enough to stop it.
pub(crate) fn refinement_thread_loop(heap: &Weak<Heap>, worker: usize) {
    loop {
        let Some(heap) = heap.upgrade() else {
            return;
        };
        if heap.is_shutting_down() {
            return;
        }

        let refined = {
            let sts = heap.sts.join();
            let mut refined = 0;
            while refined < heap.config.refinement_batch && !sts.should_yield() {
                let Some(card) = heap.dirty_card_queue.pop() else {
                    break;
                };
                heap.refine_card(card, true);
                refined += 1;
            }
            refined
        };

        if refined > 0 {
            heap.metrics().record_cards_refined(refined);
            events::refinement_batch(worker, refined);
        } else {
            heap.dirty_card_queue.wait_for_cards(IDLE_WAIT);
        }
    }
}

/// Visit the address of every reference slot in `[start, end)` of `region`.
///
/// Parsing starts at the block covering `start`, found through the block
/// offset table (or at the head of a humongous object). Returns `false` if
/// the walk hit an object whose header is not initialized yet; the caller
/// must then treat the card as still dirty.
pub(crate) fn iterate_card_slots(
    heap: &Heap,
    region: &HeapRegion,
    start: usize,
    end: usize,
    mut f: impl FnMut(usize),
) -> bool {
    let mut obj = if region.kind() == RegionKind::ContinuesHumongous {
        match region.humongous_start_index() {
            Some(head) => heap.region(head).bottom(),
            None => return true,
        }
    } else {
        region.bot().block_start(region.bottom(), start)
    };

    while obj < end {
        // SAFETY: `obj` is a block start below top of a parsable region;
        // blocks are laid out back to back.
        let shape = match unsafe { raw::header(obj) } {
            HeaderState::Uninitialized => return false,
            HeaderState::Forwarded(to) if to != obj => unsafe { raw::shape(to) },
            _ => unsafe { raw::shape(obj) },
        };
        let size = shape.size_words();
        if size == 0 {
            debug_assert!(false, "zero sized block at {obj:#x}");
            return false;
        }
        let slots = shape.ref_slots();
        if slots > 0 {
            let first = raw::slot_addr(obj, 0);
            let lo = start.max(first);
            let hi = end.min(first + slots * WORD_SIZE);
            let mut slot = lo;
            while slot < hi {
                f(slot);
                slot += WORD_SIZE;
            }
        }
        obj += size * WORD_SIZE;
    }
    true
}

impl Heap {
    /// Refine one dirty card: clean it, then add its outgoing references to
    /// the remembered sets of the regions they point into.
    ///
    /// Cards of free, young or collection set regions are only cleaned:
    /// those regions are scanned completely whenever it matters. With
    /// `concurrent` set an unparsable card is dirtied and queued again.
    pub(crate) fn refine_card(&self, card: usize, concurrent: bool) {
        let region = self.region(self.geometry.region_of_card(card));
        self.card_table.clean(card);
        if !region.is_committed()
            || region.is_free()
            || region.is_young()
            || region.in_collection_set()
        {
            return;
        }
        let start = self.geometry.card_start(card);
        let top = region.top();
        if start >= top {
            return;
        }
        let end = (start + CARD_SIZE).min(top);
        let from = region.index();
        let card_in_region = self.geometry.card_in_region(card);
        let complete = iterate_card_slots(self, region, start, end, |slot| {
            self.record_reference(from, card_in_region, slot);
        });
        if !complete {
            debug_assert!(concurrent, "unparsable card {card} at a safepoint");
            if concurrent && self.card_table.mark_dirty(card) {
                self.dirty_card_queue.enqueue(card);
            }
        }
    }

    /// Record that card `card_in_region` of region `from` holds the
    /// reference stored at `slot`.
    #[inline]
    pub(crate) fn record_reference(&self, from: u32, card_in_region: usize, slot: usize) {
        // SAFETY: `slot` is a reference slot of a parsed object.
        let value = unsafe { raw::load(slot) };
        if value == 0 || !self.geometry.contains(value) {
            return;
        }
        let to = self.region_containing(value);
        if to.index() == from || to.is_humongous() {
            return;
        }
        to.rem_set().add_card(from, card_in_region);
    }

    /// Refine every queued card. Runs at a safepoint; returns the number of
    /// cards processed.
    pub(crate) fn drain_dirty_card_queue(&self) -> usize {
        let mut refined = 0;
        while let Some(card) = self.dirty_card_queue.pop() {
            self.refine_card(card, false);
            refined += 1;
        }
        // Every card is clean now; forget which regions had dirty ones.
        self.clear_dirty_cards_regions();
        refined
    }

    /// Reset the cards of every region on the dirty-cards list to clean.
    pub(crate) fn clear_dirty_cards_regions(&self) {
        for index in self.dirty_cards_regions.take_all(&self.regions) {
            let first = self.geometry.global_card(index, 0);
            self.card_table
                .clear_range(first, self.geometry.cards_per_region);
        }
    }
}
