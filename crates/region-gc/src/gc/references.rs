//! Reference processing at the end of an evacuation pause.
//!
//! Workers do not trace through the referent slot of reference objects they
//! copy; they hand the copies over here instead. Soft references keep their
//! referent alive, copying it out of the collection set if nobody else did.
//! Weak references are cleared when their referent was not reached
//! otherwise. Soft references are processed first since keeping a referent
//! alive can make the referents of weak references reachable.

use super::scan_state::ParScanThreadState;
use crate::heap::Heap;
use crate::object::{raw, HeaderState, ObjectShape, ReferenceStrength};

/// Outcome of one reference processing phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReferenceStats {
    pub discovered: usize,
    pub cleared: usize,
}

impl Heap {
    /// Process every reference object discovered by `states`. Keep-alive
    /// copying runs on the first worker's state, single threaded.
    pub(crate) fn process_discovered_references(
        &self,
        states: &mut [ParScanThreadState<'_>],
    ) -> ReferenceStats {
        let mut stats = ReferenceStats::default();
        let Some((keeper, others)) = states.split_first_mut() else {
            return stats;
        };

        let mut pending: Vec<usize> = others
            .iter_mut()
            .flat_map(|pss| std::mem::take(&mut pss.discovered))
            .collect();
        pending.append(&mut keeper.discovered);

        let mut weak = Vec::new();
        while !pending.is_empty() {
            for reference in std::mem::take(&mut pending) {
                stats.discovered += 1;
                if strength(reference) == Some(ReferenceStrength::Soft) {
                    keeper.do_slot(raw::slot_addr(reference, 0));
                } else {
                    weak.push(reference);
                }
            }
            keeper.drain_queue();
            pending.append(&mut keeper.discovered);
        }

        for reference in weak {
            if !self.process_weak(reference) {
                stats.cleared += 1;
            }
        }
        stats
    }

    /// Update or clear the referent of a weak reference. Returns whether
    /// the referent survived.
    fn process_weak(&self, reference: usize) -> bool {
        let slot = raw::slot_addr(reference, 0);
        // SAFETY: `reference` is a live reference object; its referent slot
        // is only touched by this thread now.
        let referent = unsafe { raw::load(slot) };
        if referent == 0 {
            return true;
        }
        let region = self.region_containing(referent);
        if region.in_collection_set() {
            // SAFETY: `referent` is an object in a collection set region.
            match unsafe { raw::header(referent) } {
                // SAFETY: the copy is complete; `slot` is owned as above.
                HeaderState::Forwarded(to) => unsafe { raw::store(slot, to) },
                _ => {
                    // SAFETY: as above.
                    unsafe { raw::store(slot, 0) };
                    return false;
                }
            }
        }
        self.record_reference_from_slot(slot);
        true
    }

    /// Record the reference at `slot` unless the slot is in a young region.
    pub(crate) fn record_reference_from_slot(&self, slot: usize) {
        let from = self.region_containing(slot);
        if from.is_young() {
            return;
        }
        let card = self.geometry.card_index(slot);
        self.record_reference(from.index(), self.geometry.card_in_region(card), slot);
    }
}

fn strength(reference: usize) -> Option<ReferenceStrength> {
    // SAFETY: discovered objects are live reference objects.
    match unsafe { raw::shape(reference) } {
        ObjectShape::Reference { strength, .. } => Some(strength),
        _ => None,
    }
}
