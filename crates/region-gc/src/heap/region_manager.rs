//! Region directory operations: taking regions off the free lists,
//! humongous allocation and returning regions.

use std::sync::atomic::{fence, Ordering};

use super::region::{HeapRegion, Membership};
use super::Heap;
use crate::object::{raw, HEADER_WORDS, WORD_SIZE};
use crate::tracing::events;

impl Heap {
    /// Words above which an object is humongous.
    pub const fn humongous_threshold_words(&self) -> usize {
        self.geometry.region_words() / 2
    }

    /// Whether an object of `words` words is humongous.
    #[inline]
    pub const fn is_humongous(&self, words: usize) -> bool {
        words > self.humongous_threshold_words()
    }

    fn take_free_region(&self, is_old: bool) -> Option<u32> {
        self.free_list.lock().remove_region(!is_old, &self.regions)
    }

    /// Take a free region able to hold `words` words.
    ///
    /// Young requests take the lowest free index, old requests the highest.
    /// The primary free list is tried first. Only when it is empty and
    /// concurrent cleanup announces that regions are coming does the call
    /// wait for them; with `do_expand` it finally tries to commit more
    /// memory. Returns `None` if nothing worked.
    pub fn new_region(&self, words: usize, is_old: bool, do_expand: bool) -> Option<u32> {
        debug_assert!(words <= self.geometry.region_words());
        let index = self
            .take_free_region(is_old)
            .or_else(|| {
                if !self.secondary_free_list.free_regions_coming() {
                    return None;
                }
                self.secondary_free_list
                    .merge_into(&self.free_list, &self.regions, true);
                self.take_free_region(is_old)
            })
            .or_else(|| {
                // Leftovers of a cleanup that already finished.
                let merged = self
                    .secondary_free_list
                    .merge_into(&self.free_list, &self.regions, false);
                (merged > 0).then(|| self.take_free_region(is_old)).flatten()
            })
            .or_else(|| {
                (do_expand && self.expand(words * WORD_SIZE))
                    .then(|| self.take_free_region(is_old))
                    .flatten()
            })?;
        let region = self.region(index);
        debug_assert!(region.is_free() && region.is_empty());
        debug_assert!(region.is_committed());
        Some(index)
    }

    /// Find and remove `n` contiguous free regions.
    fn take_contiguous(&self, n: usize, bytes: usize) -> Option<u32> {
        let mut expanded = false;
        loop {
            {
                let mut free = self.free_list.lock();
                if let Some(first) = free.find_contiguous(n) {
                    // Remove the whole run before initializing any of it so
                    // no other allocator can take a single region of it.
                    free.remove_range(first, n, &self.regions);
                    return Some(first);
                }
            }
            let waiting = self.secondary_free_list.free_regions_coming();
            if self
                .secondary_free_list
                .merge_into(&self.free_list, &self.regions, waiting)
                > 0
            {
                continue;
            }
            if expanded || !self.expand(bytes) {
                return None;
            }
            expanded = true;
        }
    }

    /// Allocate a humongous object of `words` words in fresh regions.
    /// Returns the object address with a zero header.
    pub fn humongous_obj_allocate(&self, words: usize) -> Option<usize> {
        let _heap = self.heap_lock.lock();
        self.humongous_obj_allocate_locked(words)
    }

    /// As [`humongous_obj_allocate`](Self::humongous_obj_allocate); the
    /// caller holds the heap lock or runs at a safepoint.
    pub(crate) fn humongous_obj_allocate_locked(&self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        let n = bytes.div_ceil(self.geometry.region_bytes);
        if n > self.max_regions() {
            return None;
        }
        let first = if n == 1 {
            self.new_region(words, true, true)?
        } else {
            self.take_contiguous(n, bytes)?
        };
        Some(self.humongous_initialize_regions(first, n, words))
    }

    fn humongous_initialize_regions(&self, first: u32, n: usize, words: usize) -> usize {
        let head = self.region(first);
        let obj = head.bottom();
        let obj_end = obj + words * WORD_SIZE;

        // A racing card scan must find an uninitialized header, never
        // whatever the previous occupant left here.
        // SAFETY: the regions are committed and owned by this call.
        unsafe { raw::zero(obj, HEADER_WORDS) };
        fence(Ordering::Release);

        head.bot()
            .record_block(head.bottom(), obj, obj_end.min(head.end()));
        head.set_starts_humongous();
        #[allow(clippy::cast_possible_truncation)]
        for i in 1..n as u32 {
            self.region(first + i).set_continues_humongous(first);
        }
        fence(Ordering::Release);

        let stamp = self.total_collections();
        #[allow(clippy::cast_possible_truncation)]
        for i in 0..n as u32 {
            let r = self.region(first + i);
            let top = if i as usize == n - 1 { obj_end } else { r.end() };
            r.set_top(top);
            r.record_timestamp(stamp);
        }

        let mut sets = self.sets.lock();
        #[allow(clippy::cast_possible_truncation)]
        for i in 0..n as u32 {
            sets.humongous.add(self.region(first + i));
        }
        drop(sets);

        self.summary_used
            .fetch_add(words * WORD_SIZE, Ordering::AcqRel);
        self.metrics().record_humongous_allocation();
        events::humongous_allocated(first, n, words);
        obj
    }

    /// Return a region to the free list, taking it out of the old or
    /// humongous set first. Freeing an already free region changes nothing.
    pub fn free_region(&self, index: u32) {
        let region = self.region(index);
        if !region.is_committed() {
            return;
        }
        let was_free = region.is_free();
        match region.membership() {
            Membership::Old => {
                self.sets.lock().old.remove(region);
            }
            Membership::Humongous => {
                self.sets.lock().humongous.remove(region);
            }
            _ => {}
        }
        if !was_free {
            let used = region.used();
            // The closure always returns `Some`, so the update cannot fail.
            self.summary_used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                    Some(u.saturating_sub(used))
                })
                .ok();
        }
        if region.membership() == Membership::SecondaryFreeList {
            return;
        }
        region.hr_clear();
        self.free_list.lock().add(region);
    }

    /// Every region of the humongous object starting at `first`.
    pub(crate) fn humongous_run(&self, first: u32) -> impl Iterator<Item = &HeapRegion> {
        let head = self.region(first);
        debug_assert!(head.is_humongous());
        std::iter::once(head).chain(
            self.regions[first as usize + 1..]
                .iter()
                .take_while(move |r| {
                    r.kind() == super::region::RegionKind::ContinuesHumongous
                        && r.humongous_start_index() == Some(first)
                }),
        )
    }

    /// Clear `indices`, which belong to no container, and put them on the
    /// free list.
    pub(crate) fn free_cleared_regions(&self, indices: &[u32]) {
        for &i in indices {
            self.region(i).hr_clear();
        }
        let mut free = self.free_list.lock();
        for &i in indices {
            free.add(self.region(i));
        }
    }

    /// Move whatever cleanup has appended to the secondary list onto the
    /// free list, waiting for an announced batch if `wait` is set.
    pub(crate) fn merge_secondary_free_list(&self, wait: bool) -> usize {
        if wait {
            self.secondary_free_list.wait_while_free_regions_coming();
        }
        self.secondary_free_list
            .merge_into(&self.free_list, &self.regions, false)
    }
}

#[cfg(test)]
mod tests {
    use super::super::region::RegionKind;
    use super::*;
    use crate::config::HeapConfig;
    use crate::heap::Collaborators;

    const REGION: usize = 256 * 1024;

    fn heap(regions: usize, committed: usize) -> std::sync::Arc<Heap> {
        let config = HeapConfig::default()
            .with_region_size(REGION)
            .with_initial_heap_size(committed * REGION)
            .with_max_heap_size(regions * REGION)
            .with_refinement_threads(0);
        Heap::new(config, Collaborators::default()).unwrap()
    }

    #[test]
    fn test_new_region_ends() {
        let heap = heap(4, 4);
        assert_eq!(heap.new_region(16, false, false), Some(0));
        assert_eq!(heap.new_region(16, true, false), Some(3));
        assert_eq!(heap.free_regions(), 2);
    }

    #[test]
    fn test_new_region_expands_on_demand() {
        let heap = heap(8, 1);
        assert_eq!(heap.new_region(16, false, false), Some(0));
        assert_eq!(heap.new_region(16, false, false), None);
        let expanded = heap.new_region(16, false, true);
        assert!(expanded.is_some());
        assert!(heap.committed_regions() > 1);
    }

    #[test]
    fn test_humongous_exact_used() {
        let heap = heap(8, 8);
        let words = (2 * REGION + 1000) / WORD_SIZE;
        let obj = heap.humongous_obj_allocate(words).unwrap();
        let first = heap.region_containing(obj);
        assert_eq!(first.kind(), RegionKind::StartsHumongous);
        assert_eq!(first.top(), first.end());
        let third = heap.region(first.index() + 2);
        assert_eq!(third.kind(), RegionKind::ContinuesHumongous);
        assert_eq!(third.used(), 1000);
        assert_eq!(heap.used(), words * WORD_SIZE);
        assert_eq!(heap.humongous_run(first.index()).count(), 3);
        assert_eq!(unsafe { raw::load(obj) }, 0);
    }

    #[test]
    fn test_free_region_twice_is_idempotent() {
        let heap = heap(4, 4);
        let obj = heap.humongous_obj_allocate(REGION / WORD_SIZE - 16).unwrap();
        let index = heap.region_containing(obj).index();
        heap.free_region(index);
        let once = heap.region_info(index);
        let free_once = heap.free_regions();
        heap.free_region(index);
        assert_eq!(heap.region_info(index), once);
        assert_eq!(heap.free_regions(), free_once);
        assert_eq!(heap.used(), 0);
        assert!(heap.humongous_regions().is_empty());
    }
}
