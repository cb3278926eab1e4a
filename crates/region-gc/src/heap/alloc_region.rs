//! Allocation regions.
//!
//! An [`AllocRegion`] is the region currently being bump-allocated into for
//! one purpose: mutator (eden), survivor or old. The fast path is a
//! lock-free CAS on the region's top. Replacing the region is serialized by
//! the caller, the heap lock for the mutator region and the parallel GC
//! allocation lock for the two GC regions, and goes through an
//! [`AllocRegionOwner`] which decides whether a new region may be handed out.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::region::{HeapRegion, NO_REGION};
use crate::object::WORD_SIZE;

/// What an allocation region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPurpose {
    /// New objects allocated by mutators, in eden.
    Mutator,
    /// Young objects copied by a pause.
    Survivor,
    /// Objects promoted by a pause.
    Old,
}

impl AllocPurpose {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mutator => "mutator",
            Self::Survivor => "survivor",
            Self::Old => "old",
        }
    }

    /// Old regions keep their block offset table up to date because they
    /// are scanned card by card.
    const fn records_blocks(self) -> bool {
        matches!(self, Self::Old)
    }
}

/// Supplies and takes back regions for an [`AllocRegion`].
pub trait AllocRegionOwner {
    fn region(&self, index: u32) -> &HeapRegion;

    /// Hand out an empty region able to hold `words`, or `None` if the
    /// policy or the free list says no. `force` ignores the young length
    /// policy limit.
    fn new_alloc_region(&self, purpose: AllocPurpose, words: usize, force: bool) -> Option<u32>;

    /// Take back a region after `allocated_bytes` were allocated in it.
    fn retire_alloc_region(&self, purpose: AllocPurpose, index: u32, allocated_bytes: usize);
}

/// The current allocation region for one purpose.
#[derive(Debug)]
pub struct AllocRegion {
    purpose: AllocPurpose,
    current: AtomicU32,
    used_before: AtomicUsize,
    count: AtomicUsize,
}

impl AllocRegion {
    pub const fn new(purpose: AllocPurpose) -> Self {
        Self {
            purpose,
            current: AtomicU32::new(NO_REGION),
            used_before: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    pub const fn purpose(&self) -> AllocPurpose {
        self.purpose
    }

    /// Index of the current region, if any.
    pub fn current(&self) -> Option<u32> {
        let c = self.current.load(Ordering::Acquire);
        (c != NO_REGION).then_some(c)
    }

    /// Regions taken since [`init`](Self::init).
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Bytes allocated in the current region since it was installed.
    pub fn used_in_current<O: AllocRegionOwner + ?Sized>(&self, owner: &O) -> usize {
        self.current()
            .map_or(0, |i| owner.region(i).used() - self.used_before.load(Ordering::Relaxed))
    }

    /// Start a new allocation period.
    pub fn init(&self) {
        debug_assert!(self.current().is_none(), "{} alloc region still active", self.purpose.name());
        self.count.store(0, Ordering::Relaxed);
    }

    fn allocate_in<O: AllocRegionOwner + ?Sized>(
        &self,
        owner: &O,
        index: u32,
        words: usize,
    ) -> Option<usize> {
        let region = owner.region(index);
        let addr = region.par_allocate(words)?;
        if self.purpose.records_blocks() {
            region
                .bot()
                .record_block(region.bottom(), addr, addr + words * WORD_SIZE);
        }
        Some(addr)
    }

    /// Lock-free fast path.
    pub fn attempt_allocation<O: AllocRegionOwner + ?Sized>(
        &self,
        owner: &O,
        words: usize,
    ) -> Option<usize> {
        let index = self.current()?;
        self.allocate_in(owner, index, words)
    }

    /// Slow path. The caller holds the lock serializing region replacement.
    pub fn attempt_allocation_locked<O: AllocRegionOwner + ?Sized>(
        &self,
        owner: &O,
        words: usize,
    ) -> Option<usize> {
        if let Some(addr) = self.attempt_allocation(owner, words) {
            return Some(addr);
        }
        self.retire(owner, true);
        self.new_region_and_allocate(owner, words, false)
    }

    /// Replace the current region ignoring the policy limit. The caller
    /// holds the replacement lock.
    pub fn attempt_allocation_force<O: AllocRegionOwner + ?Sized>(
        &self,
        owner: &O,
        words: usize,
    ) -> Option<usize> {
        self.retire(owner, true);
        self.new_region_and_allocate(owner, words, true)
    }

    fn new_region_and_allocate<O: AllocRegionOwner + ?Sized>(
        &self,
        owner: &O,
        words: usize,
        force: bool,
    ) -> Option<usize> {
        let index = owner.new_alloc_region(self.purpose, words, force)?;
        let addr = self.allocate_in(owner, index, words);
        debug_assert!(addr.is_some(), "fresh region cannot hold {words} words");
        self.used_before
            .store(owner.region(index).used() - words * WORD_SIZE, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        // Publish only after the first allocation so racing fast paths never
        // see a region the owner has not finished setting up.
        self.current.store(index, Ordering::Release);
        addr
    }

    /// Hand the current region back to the owner. With `fill_up` the space
    /// above top is covered by a filler first so concurrent fast paths can
    /// no longer allocate there.
    pub fn retire<O: AllocRegionOwner + ?Sized>(&self, owner: &O, fill_up: bool) -> Option<u32> {
        let index = self.current.swap(NO_REGION, Ordering::AcqRel);
        if index == NO_REGION {
            return None;
        }
        let region = owner.region(index);
        if fill_up {
            if let Some((addr, words)) = region.fill_remaining() {
                if self.purpose.records_blocks() {
                    region
                        .bot()
                        .record_block(region.bottom(), addr, addr + words * WORD_SIZE);
                }
            }
        }
        let allocated = region.used() - self.used_before.load(Ordering::Relaxed);
        owner.retire_alloc_region(self.purpose, index, allocated);
        Some(index)
    }

    /// Retire without filling. Used at safepoints where no fast path can
    /// race.
    pub fn release<O: AllocRegionOwner + ?Sized>(&self, owner: &O) -> Option<u32> {
        self.retire(owner, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct TestOwner {
        regions: Vec<HeapRegion>,
        next: RefCell<u32>,
        retired: RefCell<Vec<(u32, usize)>>,
        _store: Vec<usize>,
    }

    impl TestOwner {
        fn new(n: u32) -> Self {
            let mut store = vec![0usize; n as usize * 64];
            let base = store.as_mut_ptr() as usize;
            let regions = (0..n)
                .map(|i| HeapRegion::new(i, base + i as usize * 64 * WORD_SIZE, 64 * WORD_SIZE, n as usize, 1))
                .collect();
            Self {
                regions,
                next: RefCell::new(0),
                retired: RefCell::new(Vec::new()),
                _store: store,
            }
        }
    }

    impl AllocRegionOwner for TestOwner {
        fn region(&self, index: u32) -> &HeapRegion {
            &self.regions[index as usize]
        }

        fn new_alloc_region(&self, _purpose: AllocPurpose, _words: usize, _force: bool) -> Option<u32> {
            let mut next = self.next.borrow_mut();
            if *next as usize == self.regions.len() {
                return None;
            }
            *next += 1;
            self.regions[*next as usize - 1].set_eden();
            Some(*next - 1)
        }

        fn retire_alloc_region(&self, _purpose: AllocPurpose, index: u32, bytes: usize) {
            self.retired.borrow_mut().push((index, bytes));
        }
    }

    #[test]
    fn test_fast_path_needs_region() {
        let owner = TestOwner::new(2);
        let ar = AllocRegion::new(AllocPurpose::Mutator);
        assert!(ar.attempt_allocation(&owner, 4).is_none());
        let a = ar.attempt_allocation_locked(&owner, 4).unwrap();
        let b = ar.attempt_allocation(&owner, 4).unwrap();
        assert_eq!(b, a + 4 * WORD_SIZE);
        assert_eq!(ar.current(), Some(0));
        assert_eq!(ar.used_in_current(&owner), 8 * WORD_SIZE);
    }

    #[test]
    fn test_replacement_retires_with_filler() {
        let owner = TestOwner::new(2);
        let ar = AllocRegion::new(AllocPurpose::Mutator);
        ar.attempt_allocation_locked(&owner, 40).unwrap();
        // Does not fit in the remaining 24 words.
        ar.attempt_allocation_locked(&owner, 40).unwrap();
        assert_eq!(ar.current(), Some(1));
        assert_eq!(*owner.retired.borrow(), vec![(0, 64 * WORD_SIZE)]);
        assert_eq!(owner.regions[0].top(), owner.regions[0].end());
        assert_eq!(ar.count(), 2);

        assert!(ar.attempt_allocation_locked(&owner, 40).is_none());
        assert_eq!(ar.current(), None);
    }

    #[test]
    fn test_release_does_not_fill() {
        let owner = TestOwner::new(1);
        let ar = AllocRegion::new(AllocPurpose::Mutator);
        ar.attempt_allocation_locked(&owner, 8).unwrap();
        assert_eq!(ar.release(&owner), Some(0));
        assert_eq!(*owner.retired.borrow(), vec![(0, 8 * WORD_SIZE)]);
        assert_eq!(owner.regions[0].used(), 8 * WORD_SIZE);
    }
}
