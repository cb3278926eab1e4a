//! Committing and uncommitting regions.

use super::region::Membership;
use super::Heap;
use crate::tracing::events;

impl Heap {
    /// Commit enough of the lowest uncommitted regions to cover `bytes` and
    /// put them on the free list. Returns whether anything was committed.
    ///
    /// Commit failures are logged; with `exit_on_expansion_failure` they
    /// abort the process.
    pub fn expand(&self, bytes: usize) -> bool {
        let _expand = self.expand_lock.lock();
        let region_bytes = self.geometry.region_bytes;
        let wanted = bytes.div_ceil(region_bytes).max(1);
        let mut committed = 0;
        for region in self.regions.iter().filter(|r| !r.is_committed()) {
            if committed == wanted {
                break;
            }
            let offset = region.bottom() - self.geometry.base;
            // SAFETY: `offset` is a region boundary inside the reservation.
            if let Err(error) = unsafe { self.reservation().commit(offset, region_bytes) } {
                events::expansion_failed(bytes, &error);
                if self.config.exit_on_expansion_failure {
                    events::expansion_failure_fatal(&format!(
                        "failed to commit {region_bytes} bytes for region {}: {error}",
                        region.index()
                    ));
                    std::process::abort();
                }
                break;
            }
            region.hr_clear();
            region.set_committed(true);
            self.free_list.lock().add(region);
            committed += 1;
        }
        if committed == 0 {
            return false;
        }
        let total = self
            .committed_regions
            .fetch_add(committed, std::sync::atomic::Ordering::AcqRel)
            + committed;
        self.metrics().record_expansion(committed);
        events::heap_expanded(committed, total);
        true
    }

    /// Uncommit up to `bytes` worth of free regions, highest index first,
    /// never going below the minimum heap size. Returns the bytes released.
    pub fn shrink(&self, bytes: usize) -> usize {
        let _expand = self.expand_lock.lock();
        let region_bytes = self.geometry.region_bytes;
        let min_regions = self
            .config
            .min_heap_size()
            .div_ceil(region_bytes)
            .clamp(1, self.max_regions());
        let committed = self.committed_regions();
        let wanted = (bytes / region_bytes).min(committed.saturating_sub(min_regions));
        if wanted == 0 {
            return 0;
        }

        let mut released = 0;
        let mut free = self.free_list.lock();
        for region in self.regions.iter().rev() {
            if released == wanted {
                break;
            }
            if !region.is_committed() || region.membership() != Membership::FreeList {
                continue;
            }
            free.remove(region.index(), &self.regions);
            let offset = region.bottom() - self.geometry.base;
            // SAFETY: the region is free, so nothing references its memory.
            if unsafe { self.reservation().uncommit(offset, region_bytes) }.is_err() {
                free.add(region);
                break;
            }
            region.set_committed(false);
            released += 1;
        }
        drop(free);

        let total = self
            .committed_regions
            .fetch_sub(released, std::sync::atomic::Ordering::AcqRel)
            - released;
        if released > 0 {
            self.metrics().record_shrink(released);
            events::heap_shrunk(released, total);
        }
        released * region_bytes
    }

    /// Grow the heap after a pause if recent GC overhead is too high.
    pub(crate) fn expand_after_pause(&self) {
        let capacity = self.capacity();
        let amount = self
            .policy
            .lock()
            .expansion_amount(capacity, self.max_capacity() - capacity);
        if amount > 0 {
            self.expand(amount);
        }
    }

    /// Bring free space back inside the `[min_free_ratio, max_free_ratio]`
    /// band after a full collection.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub(crate) fn resize_if_necessary_after_full_collection(&self) {
        let capacity = self.capacity();
        let used = self.used() as f64;
        let desired = |free_ratio: u32| -> usize {
            let free = f64::from(free_ratio) / 100.0;
            let bytes = if free >= 1.0 {
                self.max_capacity() as f64
            } else {
                used / (1.0 - free)
            };
            (bytes.ceil() as usize).clamp(
                self.config.min_heap_size().min(self.max_capacity()),
                self.max_capacity(),
            )
        };
        let minimum_desired = desired(self.config.min_free_ratio);
        let maximum_desired = desired(self.config.max_free_ratio);

        if capacity < minimum_desired {
            self.expand(minimum_desired - capacity);
        } else if capacity > maximum_desired {
            self.shrink(capacity - maximum_desired);
        }
        let after = self.capacity();
        if after != capacity {
            events::heap_resized(capacity, after, 1.0 - used / after as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::HeapConfig;
    use crate::heap::{Collaborators, Heap};
    use crate::object::WORD_SIZE;

    const REGION: usize = 256 * 1024;

    fn heap(config: HeapConfig) -> std::sync::Arc<Heap> {
        let config = config
            .with_region_size(REGION)
            .with_max_heap_size(16 * REGION)
            .with_refinement_threads(0)
            .with_initiating_heap_occupancy_percent(100);
        Heap::new(config, Collaborators::default()).unwrap()
    }

    #[test]
    fn test_expand_commits_whole_lowest_regions() {
        let heap = heap(HeapConfig::default().with_initial_heap_size(2 * REGION));
        assert!(heap.expand(REGION + 1));
        assert_eq!(heap.committed_regions(), 4);
        assert_eq!(heap.free_regions(), 4);
        assert!(heap.region_info(3).is_some_and(|r| r.committed));
        assert!(heap.region_info(4).is_some_and(|r| !r.committed));
        assert_eq!(heap.metrics().regions_expanded(), 2);
    }

    #[test]
    fn test_expand_stops_at_reservation() {
        let heap = heap(HeapConfig::default().with_initial_heap_size(16 * REGION));
        assert!(!heap.expand(REGION));
        assert_eq!(heap.committed_regions(), 16);
    }

    #[test]
    fn test_shrink_respects_min_heap() {
        let heap = heap(
            HeapConfig::default()
                .with_initial_heap_size(8 * REGION)
                .with_min_heap_size(6 * REGION),
        );
        assert_eq!(heap.shrink(8 * REGION), 2 * REGION);
        assert_eq!(heap.committed_regions(), 6);
        assert!(heap.region_info(7).is_some_and(|r| !r.committed));
        assert!(heap.region_info(5).is_some_and(|r| r.committed));
        assert_eq!(heap.free_regions(), 6);
    }

    #[test]
    fn test_resize_after_full_expands_when_free_space_is_low() {
        let heap = heap(
            HeapConfig::default()
                .with_initial_heap_size(4 * REGION)
                .with_free_ratios(40, 70),
        );
        heap.humongous_obj_allocate(3 * REGION / WORD_SIZE - 16)
            .unwrap();
        heap.resize_if_necessary_after_full_collection();
        assert_eq!(heap.committed_regions(), 5);
    }

    #[test]
    fn test_resize_after_full_shrinks_empty_heap() {
        let heap = heap(
            HeapConfig::default()
                .with_initial_heap_size(8 * REGION)
                .with_min_heap_size(2 * REGION)
                .with_free_ratios(40, 70),
        );
        heap.resize_if_necessary_after_full_collection();
        assert_eq!(heap.committed_regions(), 2);
    }

    /// Map a read-only shared file over region `index` so that committing
    /// it fails with `EACCES`.
    #[cfg(unix)]
    fn block_commit(heap: &Heap, index: u32) {
        use std::os::fd::AsRawFd;

        let path = std::env::temp_dir().join(format!(
            "region-gc-blocked-{}-{index}",
            std::process::id()
        ));
        std::fs::write(&path, vec![0u8; REGION]).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        // SAFETY: the region is uncommitted and lies inside the heap's own
        // reservation; the reservation unmaps it on drop.
        let mapped = unsafe {
            libc::mmap(
                heap.region(index).bottom() as *mut libc::c_void,
                REGION,
                libc::PROT_NONE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_raw_fd(),
                0,
            )
        };
        assert_ne!(mapped, libc::MAP_FAILED);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_commit_failure_is_logged_and_reported() {
        let heap = heap(HeapConfig::default().with_initial_heap_size(2 * REGION));
        block_commit(&heap, 3);

        // Region 2 commits, region 3 fails and stops the expansion.
        assert!(heap.expand(3 * REGION));
        assert_eq!(heap.committed_regions(), 3);
        assert!(heap.region_info(3).is_some_and(|r| !r.committed));

        assert!(!heap.expand(REGION));
        assert_eq!(heap.committed_regions(), 3);
        assert_eq!(heap.free_regions(), 3);
        assert_eq!(heap.metrics().regions_expanded(), 1);
    }
}
