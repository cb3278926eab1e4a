//! Region sets: the free list, the secondary free list, and the old and
//! humongous sets.
//!
//! Sets hold region indices. Each region records which container holds it
//! in its [`Membership`] tag, which the sets keep up to date and
//! [`HeapRegionSet::verify`] cross-checks.

use std::collections::BTreeSet;

use parking_lot::Condvar;

use super::region::{HeapRegion, Membership, RegionKind};
use crate::gc::sync::{LockOrder, OrderedMutex};

/// Ordered free region list.
///
/// Young regions are taken from the low end of the index space and old
/// regions from the high end, which keeps long-lived data away from the
/// churn of eden.
#[derive(Debug, Default)]
pub struct FreeRegionList {
    regions: BTreeSet<u32>,
}

impl FreeRegionList {
    /// An empty list.
    pub const fn new() -> Self {
        Self {
            regions: BTreeSet::new(),
        }
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Whether `index` is on the list.
    pub fn contains(&self, index: u32) -> bool {
        self.regions.contains(&index)
    }

    /// Add a free region. Adding a region that is already on the list
    /// leaves the list unchanged.
    pub fn add(&mut self, region: &HeapRegion) {
        debug_assert_eq!(region.kind(), RegionKind::Free);
        debug_assert!(region.is_empty());
        region.set_membership(Membership::FreeList);
        self.regions.insert(region.index());
    }

    /// Take the lowest region (for young use) or the highest (for old use).
    pub fn remove_region(&mut self, from_head: bool, regions: &[HeapRegion]) -> Option<u32> {
        let index = if from_head {
            self.regions.pop_first()
        } else {
            self.regions.pop_last()
        }?;
        regions[index as usize].set_membership(Membership::None);
        Some(index)
    }

    /// Remove a specific region.
    pub fn remove(&mut self, index: u32, regions: &[HeapRegion]) -> bool {
        let removed = self.regions.remove(&index);
        if removed {
            regions[index as usize].set_membership(Membership::None);
        }
        removed
    }

    /// First index of a run of `n` consecutive free regions.
    pub fn find_contiguous(&self, n: usize) -> Option<u32> {
        let mut run_start = None;
        let mut run_len = 0;
        let mut prev = None;
        for &i in &self.regions {
            if prev.is_some_and(|p: u32| p + 1 == i) {
                run_len += 1;
            } else {
                run_start = Some(i);
                run_len = 1;
            }
            if run_len == n {
                return run_start;
            }
            prev = Some(i);
        }
        None
    }

    /// Remove `n` regions starting at `first`, all of which must be listed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn remove_range(&mut self, first: u32, n: usize, regions: &[HeapRegion]) {
        for i in first..first + n as u32 {
            let removed = self.remove(i, regions);
            debug_assert!(removed, "region {i} not on the free list");
        }
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.regions.iter().copied()
    }

    /// Highest listed index.
    pub fn last(&self) -> Option<u32> {
        self.regions.last().copied()
    }
}

/// A set of regions sharing a membership tag.
#[derive(Debug)]
pub struct HeapRegionSet {
    name: &'static str,
    membership: Membership,
    regions: BTreeSet<u32>,
}

impl HeapRegionSet {
    /// An empty set tagging its regions with `membership`.
    pub const fn new(name: &'static str, membership: Membership) -> Self {
        Self {
            name,
            membership,
            regions: BTreeSet::new(),
        }
    }

    /// Set name used in diagnostics.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Whether `index` is in the set.
    pub fn contains(&self, index: u32) -> bool {
        self.regions.contains(&index)
    }

    /// Add a region that belongs to no other container.
    pub fn add(&mut self, region: &HeapRegion) {
        debug_assert_eq!(
            region.membership(),
            Membership::None,
            "region {} added to {} while in {:?}",
            region.index(),
            self.name,
            region.membership()
        );
        region.set_membership(self.membership);
        self.regions.insert(region.index());
    }

    /// Remove a region.
    pub fn remove(&mut self, region: &HeapRegion) -> bool {
        let removed = self.regions.remove(&region.index());
        if removed {
            region.set_membership(Membership::None);
        }
        removed
    }

    /// Empty the set, untagging every region.
    pub fn clear(&mut self, regions: &[HeapRegion]) {
        for &i in &self.regions {
            regions[i as usize].set_membership(Membership::None);
        }
        self.regions.clear();
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.regions.iter().copied()
    }

    /// Sum of the used bytes of the member regions.
    pub fn total_used(&self, regions: &[HeapRegion]) -> usize {
        self.regions.iter().map(|&i| regions[i as usize].used()).sum()
    }

    /// Check that every member carries this set's tag and that the number of
    /// regions carrying the tag equals the set's length.
    ///
    /// # Errors
    ///
    /// Describes the first inconsistency.
    pub fn verify(&self, regions: &[HeapRegion]) -> Result<(), String> {
        for &i in &self.regions {
            let m = regions[i as usize].membership();
            if m != self.membership {
                return Err(format!(
                    "{}: region {i} is tagged {m:?}",
                    self.name
                ));
            }
        }
        let tagged = regions
            .iter()
            .filter(|r| r.membership() == self.membership)
            .count();
        if tagged != self.regions.len() {
            return Err(format!(
                "{}: {} regions tagged but set length is {}",
                self.name,
                tagged,
                self.regions.len()
            ));
        }
        Ok(())
    }
}

/// Old and humongous sets, locked together.
#[derive(Debug)]
pub struct RegionSets {
    /// Old regions.
    pub old: HeapRegionSet,
    /// Humongous regions, starts and continuations.
    pub humongous: HeapRegionSet,
}

impl RegionSets {
    pub const fn new() -> Self {
        Self {
            old: HeapRegionSet::new("old set", Membership::Old),
            humongous: HeapRegionSet::new("humongous set", Membership::Humongous),
        }
    }
}

#[derive(Debug, Default)]
struct SecondaryState {
    regions: Vec<u32>,
    free_regions_coming: bool,
}

/// Regions freed concurrently by marking cleanup.
///
/// The cleanup thread sets `free_regions_coming`, appends regions in
/// batches and clears the flag when done. Allocators that find the primary
/// list empty while the flag is set wait on the condition variable instead
/// of spinning or failing.
pub struct SecondaryFreeList {
    state: OrderedMutex<SecondaryState>,
    cv: Condvar,
}

impl SecondaryFreeList {
    pub fn new() -> Self {
        Self {
            state: OrderedMutex::new(LockOrder::SecondaryFreeList, SecondaryState::default()),
            cv: Condvar::new(),
        }
    }

    /// Announce that regions will be appended.
    pub fn set_free_regions_coming(&self) {
        self.state.lock().free_regions_coming = true;
    }

    /// Whether more regions are expected.
    pub fn free_regions_coming(&self) -> bool {
        self.state.lock().free_regions_coming
    }

    /// Append a batch and wake waiters.
    pub fn append(&self, batch: &[u32], regions: &[HeapRegion]) {
        let mut state = self.state.lock();
        for &i in batch {
            regions[i as usize].set_membership(Membership::SecondaryFreeList);
        }
        state.regions.extend_from_slice(batch);
        drop(state);
        self.cv.notify_all();
    }

    /// Announce that no more regions are coming and wake waiters.
    pub fn reset_free_regions_coming(&self) {
        self.state.lock().free_regions_coming = false;
        self.cv.notify_all();
    }

    /// Number of regions waiting to be merged.
    pub fn len(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Move every appended region to `free`, waiting first while the list
    /// is empty and regions are still coming. Returns the number moved.
    pub fn merge_into(
        &self,
        free: &OrderedMutex<FreeRegionList>,
        regions: &[HeapRegion],
        wait: bool,
    ) -> usize {
        let mut state = self.state.lock();
        while wait && state.regions.is_empty() && state.free_regions_coming {
            state.wait(&self.cv);
        }
        if state.regions.is_empty() {
            return 0;
        }
        let mut free = free.lock();
        let moved = state.regions.len();
        for i in state.regions.drain(..) {
            let region = &regions[i as usize];
            region.set_membership(Membership::None);
            free.add(region);
        }
        moved
    }

    /// Block until the cleanup thread has finished appending.
    pub fn wait_while_free_regions_coming(&self) {
        let mut state = self.state.lock();
        while state.free_regions_coming {
            state.wait(&self.cv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WORD_SIZE;

    fn regions(n: usize, store: &mut Vec<usize>) -> Vec<HeapRegion> {
        let words = 512;
        store.resize(n * words, 0);
        let base = store.as_mut_ptr() as usize;
        (0..n)
            .map(|i| {
                HeapRegion::new(
                    i as u32,
                    base + i * words * WORD_SIZE,
                    words * WORD_SIZE,
                    n,
                    words * WORD_SIZE / 512,
                )
            })
            .collect()
    }

    #[test]
    fn test_free_list_ends() {
        let mut store = Vec::new();
        let rs = regions(6, &mut store);
        let mut free = FreeRegionList::new();
        for r in &rs {
            free.add(r);
        }
        assert_eq!(free.remove_region(true, &rs), Some(0));
        assert_eq!(free.remove_region(false, &rs), Some(5));
        assert_eq!(rs[0].membership(), Membership::None);
        assert_eq!(rs[1].membership(), Membership::FreeList);
        assert_eq!(free.len(), 4);
    }

    #[test]
    fn test_free_list_add_is_idempotent() {
        let mut store = Vec::new();
        let rs = regions(3, &mut store);
        let mut free = FreeRegionList::new();
        free.add(&rs[1]);
        free.add(&rs[1]);
        assert_eq!(free.len(), 1);
        assert_eq!(free.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_find_contiguous() {
        let mut store = Vec::new();
        let rs = regions(10, &mut store);
        let mut free = FreeRegionList::new();
        for i in [0, 2, 3, 5, 6, 7, 8] {
            free.add(&rs[i]);
        }
        assert_eq!(free.find_contiguous(1), Some(0));
        assert_eq!(free.find_contiguous(2), Some(2));
        assert_eq!(free.find_contiguous(3), Some(5));
        assert_eq!(free.find_contiguous(4), Some(5));
        assert_eq!(free.find_contiguous(5), None);
        free.remove_range(5, 4, &rs);
        assert_eq!(free.iter().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn test_region_set_verify() {
        let mut store = Vec::new();
        let rs = regions(4, &mut store);
        let mut old = HeapRegionSet::new("old", Membership::Old);
        old.add(&rs[1]);
        old.add(&rs[3]);
        assert!(old.verify(&rs).is_ok());
        rs[2].set_membership(Membership::Old);
        assert!(old.verify(&rs).is_err());
        rs[2].set_membership(Membership::None);
        assert!(old.remove(&rs[1]));
        assert!(!old.remove(&rs[1]));
        assert_eq!(old.len(), 1);
        old.clear(&rs);
        assert!(old.verify(&rs).is_ok());
    }

    #[test]
    fn test_secondary_merge() {
        let mut store = Vec::new();
        let rs = regions(4, &mut store);
        let free = OrderedMutex::new(LockOrder::FreeList, FreeRegionList::new());
        let secondary = SecondaryFreeList::new();
        assert_eq!(secondary.merge_into(&free, &rs, true), 0);
        secondary.set_free_regions_coming();
        secondary.append(&[1, 2], &rs);
        assert_eq!(rs[1].membership(), Membership::SecondaryFreeList);
        assert_eq!(secondary.merge_into(&free, &rs, true), 2);
        assert_eq!(rs[1].membership(), Membership::FreeList);
        secondary.reset_free_regions_coming();
        assert!(!secondary.free_regions_coming());
        assert_eq!(free.lock().len(), 2);
    }
}
