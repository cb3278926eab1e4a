//! Heap verification.
//!
//! A full consistency pass over the region table, the region containers and
//! every object. Run before and after pauses when
//! [`HeapConfig::verify`](crate::HeapConfig::verify) is set; also callable
//! directly, where it is only meaningful while no mutator runs.

use std::sync::atomic::Ordering;

use super::region::{HeapRegion, Membership, RegionKind};
use super::Heap;
use crate::object::{raw, HeaderState, ObjectShape, MIN_OBJECT_WORDS, WORD_SIZE};

impl Heap {
    /// Check the heap's invariants.
    ///
    /// # Errors
    ///
    /// Describes the first inconsistency found.
    pub fn verify(&self) -> Result<(), String> {
        self.verify_free_lists()?;
        {
            let sets = self.sets.lock();
            sets.old.verify(&self.regions)?;
            sets.humongous.verify(&self.regions)?;
        }
        self.young_list.lock().check_list_consistency(&self.regions)?;

        let in_transit = self.secondary_free_list.free_regions_coming();
        for region in self.regions.iter() {
            self.verify_region(region, in_transit)?;
        }

        let mut roots = Vec::new();
        self.roots
            .for_each_slot(|slot| roots.push(slot.load(Ordering::Acquire)));
        for value in roots {
            self.verify_reference(value)
                .map_err(|e| format!("root: {e}"))?;
        }
        Ok(())
    }

    fn verify_free_lists(&self) -> Result<(), String> {
        let free = self.free_list.lock();
        for index in free.iter() {
            let r = self.region(index);
            if !r.is_committed() || !r.is_free() || r.membership() != Membership::FreeList {
                return Err(format!(
                    "free list region {index} is {:?} tagged {:?} committed={}",
                    r.kind(),
                    r.membership(),
                    r.is_committed()
                ));
            }
        }
        let tagged = self
            .regions
            .iter()
            .filter(|r| r.membership() == Membership::FreeList)
            .count();
        if tagged != free.len() {
            return Err(format!(
                "{tagged} regions tagged free but free list length is {}",
                free.len()
            ));
        }
        drop(free);

        let secondary = self
            .regions
            .iter()
            .filter(|r| r.membership() == Membership::SecondaryFreeList)
            .count();
        let len = self.secondary_free_list.len();
        if secondary != len {
            return Err(format!(
                "{secondary} regions tagged secondary free but the list holds {len}"
            ));
        }
        Ok(())
    }

    fn verify_region(&self, region: &HeapRegion, in_transit: bool) -> Result<(), String> {
        let index = region.index();
        let top = region.top();
        if top < region.bottom() || top > region.end() {
            return Err(format!("region {index}: top {top:#x} out of range"));
        }
        if !region.is_committed() {
            if !region.is_free() || region.membership() != Membership::None {
                return Err(format!("uncommitted region {index} is in use"));
            }
            return Ok(());
        }

        let membership = region.membership();
        let expected = match region.kind() {
            RegionKind::Free => {
                let ok = matches!(membership, Membership::FreeList | Membership::SecondaryFreeList)
                    || (membership == Membership::None && in_transit);
                if !ok {
                    return Err(format!("free region {index} tagged {membership:?}"));
                }
                if top != region.bottom() {
                    return Err(format!("free region {index} has top above bottom"));
                }
                return Ok(());
            }
            RegionKind::Eden | RegionKind::Survivor => Membership::Young,
            RegionKind::Old => Membership::Old,
            RegionKind::StartsHumongous | RegionKind::ContinuesHumongous => Membership::Humongous,
        };
        if membership != expected {
            return Err(format!(
                "region {index} is {:?} but tagged {membership:?}",
                region.kind()
            ));
        }
        if region.in_collection_set() && !region.is_young() {
            return Err(format!("region {index} is in the collection set outside a pause"));
        }

        let cards = self.geometry.cards_per_region;
        for from in region.rem_set().source_regions() {
            if from as usize >= self.max_regions() {
                return Err(format!("region {index}: remembered set names region {from}"));
            }
            let mut bad = None;
            region.rem_set().for_each_card_from(from, |card| {
                if card >= cards {
                    bad = Some(card);
                }
            });
            if let Some(card) = bad {
                return Err(format!("region {index}: card {card} of region {from} out of range"));
            }
        }

        self.verify_objects(region)
    }

    /// Every object below top has a valid header and descriptor, and every
    /// reference it holds is valid. Dead young objects may still name
    /// regions that marking freed, so their references are only checked
    /// for range.
    fn verify_objects(&self, region: &HeapRegion) -> Result<(), String> {
        let index = region.index();
        let young = region.is_young();
        let (start, end) = match region.kind() {
            RegionKind::ContinuesHumongous => return Ok(()),
            RegionKind::StartsHumongous => {
                let obj = region.bottom();
                // SAFETY: a humongous run starts with its object.
                if unsafe { raw::header(obj) } == HeaderState::Uninitialized {
                    return Ok(());
                }
                // SAFETY: as above.
                let words = unsafe { raw::size_words(obj) };
                (obj, obj + words * WORD_SIZE)
            }
            _ => (region.bottom(), region.top()),
        };

        let mut obj = start;
        while obj < end {
            // SAFETY: the region is parsable below top outside pauses.
            match unsafe { raw::header(obj) } {
                HeaderState::Normal(_) => {}
                other => {
                    return Err(format!("region {index}: object {obj:#x} has header {other:?}"));
                }
            }
            // SAFETY: the header is valid.
            let shape = unsafe { raw::shape(obj) };
            let words = shape.size_words();
            if words < MIN_OBJECT_WORDS || obj + words * WORD_SIZE > end.max(region.end()) {
                return Err(format!("region {index}: object {obj:#x} has bad size {words}"));
            }
            if !matches!(shape, ObjectShape::Filler { .. }) {
                for i in 0..shape.ref_slots() {
                    // SAFETY: `i` is below the slot count of `obj`.
                    let value = unsafe { raw::load(raw::slot_addr(obj, i)) };
                    let checked = if young {
                        self.verify_in_range(value)
                    } else {
                        self.verify_reference(value)
                    };
                    checked.map_err(|e| format!("region {index}: slot {i} of {obj:#x}: {e}"))?;
                }
            }
            obj += words * WORD_SIZE;
        }
        if obj != end {
            return Err(format!("region {index}: last object overruns top"));
        }
        Ok(())
    }

    fn verify_in_range(&self, value: usize) -> Result<(), String> {
        if value != 0 && (!self.is_in_reserved(value) || value % WORD_SIZE != 0) {
            return Err(format!("wild reference {value:#x}"));
        }
        Ok(())
    }

    fn verify_reference(&self, value: usize) -> Result<(), String> {
        if value == 0 {
            return Ok(());
        }
        self.verify_in_range(value)?;
        let target = self.region_containing(value);
        if !target.is_committed() || target.is_free() {
            return Err(format!(
                "reference {value:#x} into free region {}",
                target.index()
            ));
        }
        if target.kind() == RegionKind::ContinuesHumongous {
            return Err(format!(
                "reference {value:#x} into the tail of a humongous object"
            ));
        }
        Ok(())
    }
}
