//! The region-based heap.
//!
//! [`Heap`] is the single context object every component receives. It owns
//! the reserved address range, the region table, the card table, all region
//! containers and the collaborators (safepoint executor, GC locker,
//! concurrent marking, full collector). Nothing is global, so any number of
//! independent heaps can live in one process.

pub mod alloc_region;
pub(crate) mod allocation;
pub mod block_offset;
pub mod card_table;
pub mod plab;
pub mod region;
pub(crate) mod region_manager;
pub mod region_set;
pub mod remset;
pub(crate) mod sizing;
pub(crate) mod verify;
pub(crate) mod vm_ops;
pub mod young_list;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use sys_alloc::{Reservation, ReserveOptions};

use self::alloc_region::{AllocPurpose, AllocRegion, AllocRegionOwner};
use self::card_table::{CardTable, CARD_SHIFT, CARD_SIZE};
use self::region::{HeapRegion, RegionInfo};
use self::region_set::{FreeRegionList, RegionSets, SecondaryFreeList};
use self::young_list::YoungList;
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::gc::cset::{CollectionSet, CollectionSetChooser};
use crate::gc::dirty_card_queue::{DirtyCardQueue, DirtyCardsRegionList};
use crate::gc::full_gc::{CompactingFullCollector, FullCollector};
use crate::gc::gc_locker::{CriticalSections, GcLocker};
use crate::gc::marking::{ConcurrentMarking, LivenessMarker};
use crate::gc::policy::Policy;
use crate::gc::refine;
use crate::gc::suspendible::SuspendibleThreadSet;
use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::gc::GcCause;
use crate::metrics::{HeapMetrics, PauseHistory};
use crate::mutator::Mutator;
use crate::object::WORD_SIZE;
use crate::roots::RootTable;
use crate::tracing::GcIdSource;
use crate::vm::{Detached, SafepointExecutor, SafepointLock, VmOperation, WithHeapSafepoint};

/// Address arithmetic over the reserved range.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub base: usize,
    pub region_bytes: usize,
    pub region_shift: u32,
    pub num_regions: usize,
    pub cards_per_region: usize,
}

impl Geometry {
    fn new(base: usize, region_bytes: usize, num_regions: usize) -> Self {
        Self {
            base,
            region_bytes,
            region_shift: region_bytes.trailing_zeros(),
            num_regions,
            cards_per_region: region_bytes / CARD_SIZE,
        }
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.base + self.num_regions * self.region_bytes
    }

    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn region_index(&self, addr: usize) -> u32 {
        ((addr - self.base) >> self.region_shift) as u32
    }

    /// Global card index of `addr`.
    #[inline]
    pub const fn card_index(&self, addr: usize) -> usize {
        (addr - self.base) >> CARD_SHIFT
    }

    #[inline]
    pub const fn card_start(&self, card: usize) -> usize {
        self.base + (card << CARD_SHIFT)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn region_of_card(&self, card: usize) -> u32 {
        (card / self.cards_per_region) as u32
    }

    #[inline]
    pub const fn card_in_region(&self, card: usize) -> usize {
        card % self.cards_per_region
    }

    /// Global index of card `card` of region `region`.
    #[inline]
    pub const fn global_card(&self, region: u32, card: usize) -> usize {
        region as usize * self.cards_per_region + card
    }

    #[inline]
    pub const fn region_words(&self) -> usize {
        self.region_bytes / WORD_SIZE
    }
}

/// Optional external implementations of the heap's collaborators. Every
/// `None` selects the built-in one.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Runs pauses with all mutators suspended. Built-in: [`SafepointLock`].
    pub safepoint: Option<Arc<dyn SafepointExecutor>>,
    /// Critical section pinning. Built-in: [`CriticalSections`].
    pub gc_locker: Option<Arc<dyn GcLocker>>,
    /// Liveness computation. Built-in: [`LivenessMarker`].
    pub marking: Option<Arc<dyn ConcurrentMarking>>,
    /// Whole-heap fallback. Built-in: [`CompactingFullCollector`].
    pub full_collector: Option<Arc<dyn FullCollector>>,
}

impl Collaborators {
    #[must_use]
    pub fn with_safepoint(mut self, executor: Arc<dyn SafepointExecutor>) -> Self {
        self.safepoint = Some(executor);
        self
    }

    #[must_use]
    pub fn with_gc_locker(mut self, locker: Arc<dyn GcLocker>) -> Self {
        self.gc_locker = Some(locker);
        self
    }

    #[must_use]
    pub fn with_marking(mut self, marking: Arc<dyn ConcurrentMarking>) -> Self {
        self.marking = Some(marking);
        self
    }

    #[must_use]
    pub fn with_full_collector(mut self, full: Arc<dyn FullCollector>) -> Self {
        self.full_collector = Some(full);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("safepoint", &self.safepoint.is_some())
            .field("gc_locker", &self.gc_locker.is_some())
            .field("marking", &self.marking.is_some())
            .field("full_collector", &self.full_collector.is_some())
            .finish()
    }
}

/// A region-based, incrementally collected heap.
pub struct Heap {
    pub(crate) config: HeapConfig,
    reservation: Reservation,
    pub(crate) geometry: Geometry,
    pub(crate) regions: Box<[HeapRegion]>,
    pub(crate) card_table: CardTable,

    pub(crate) heap_lock: OrderedMutex<()>,
    pub(crate) expand_lock: OrderedMutex<()>,
    pub(crate) free_list: OrderedMutex<FreeRegionList>,
    pub(crate) secondary_free_list: SecondaryFreeList,
    pub(crate) sets: OrderedMutex<RegionSets>,
    pub(crate) young_list: OrderedMutex<YoungList>,
    pub(crate) cset: OrderedMutex<CollectionSet>,
    pub(crate) chooser: OrderedMutex<CollectionSetChooser>,
    pub(crate) policy: OrderedMutex<Policy>,

    pub(crate) mutator_alloc_region: AllocRegion,
    pub(crate) survivor_gc_alloc_region: AllocRegion,
    pub(crate) old_gc_alloc_region: AllocRegion,
    pub(crate) par_gc_alloc_lock: OrderedMutex<()>,

    pub(crate) summary_used: AtomicUsize,
    pub(crate) committed_regions: AtomicUsize,
    pub(crate) total_collections: AtomicU32,
    pub(crate) total_full_collections: AtomicU32,
    epoch: AtomicU32,

    pub(crate) roots: RootTable,
    pub(crate) dirty_card_queue: DirtyCardQueue,
    pub(crate) dirty_cards_regions: DirtyCardsRegionList,
    pub(crate) sts: SuspendibleThreadSet,

    pub(crate) safepoint: SafepointLock,
    executor: Option<Arc<dyn SafepointExecutor>>,
    pub(crate) gc_locker: Arc<dyn GcLocker>,
    pub(crate) marking: Arc<dyn ConcurrentMarking>,
    pub(crate) full_collector: Arc<dyn FullCollector>,

    metrics: HeapMetrics,
    history: PauseHistory,
    pub(crate) gc_ids: GcIdSource,

    threads: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) shutting_down: AtomicBool,
    this: Weak<Self>,
}

impl Heap {
    /// Reserve and commit a heap, then start its refinement and marking
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError`] if the configuration is invalid or the address
    /// range cannot be reserved or committed.
    pub fn new(config: HeapConfig, collaborators: Collaborators) -> Result<Arc<Self>, HeapError> {
        config.validate()?;

        let region_bytes = config.region_size;
        let num_regions = config.max_heap_size.div_ceil(region_bytes);
        let reserved = num_regions * region_bytes;
        // SAFETY: the range is only touched inside committed regions.
        let reservation = unsafe { ReserveOptions::new().len(reserved).reserve() }
            .map_err(|source| HeapError::Reserve {
                bytes: reserved,
                source,
            })?;
        let geometry = Geometry::new(reservation.base() as usize, region_bytes, num_regions);

        let initial = config
            .initial_heap_size
            .div_ceil(region_bytes)
            .clamp(1, num_regions);
        // SAFETY: region-multiple offsets are page aligned (validated).
        unsafe { reservation.commit(0, initial * region_bytes) }.map_err(|source| {
            HeapError::Commit {
                bytes: initial * region_bytes,
                source,
            }
        })?;

        #[allow(clippy::cast_possible_truncation)]
        let regions: Box<[HeapRegion]> = (0..num_regions)
            .map(|i| {
                HeapRegion::new(
                    i as u32,
                    geometry.base + i * region_bytes,
                    region_bytes,
                    num_regions,
                    geometry.cards_per_region,
                )
            })
            .collect();
        let mut free = FreeRegionList::new();
        for r in &regions[..initial] {
            r.set_committed(true);
            free.add(r);
        }

        let mut policy = Policy::new(&config);
        policy.update_young_list_target_length(initial, 0, initial);
        let mut cset = CollectionSet::new();
        cset.start_incremental_building();

        let gc_locker = collaborators
            .gc_locker
            .unwrap_or_else(|| Arc::new(CriticalSections::new()));
        let marking = collaborators
            .marking
            .unwrap_or_else(|| Arc::new(LivenessMarker::new()));
        let full_collector = collaborators
            .full_collector
            .unwrap_or_else(|| Arc::new(CompactingFullCollector::new()));
        let refine_threshold = config.refinement_batch;

        let heap = Arc::new_cyclic(|this| Self {
            card_table: CardTable::new(num_regions * geometry.cards_per_region),
            config,
            reservation,
            geometry,
            regions,

            heap_lock: OrderedMutex::new(LockOrder::Heap, ()),
            expand_lock: OrderedMutex::new(LockOrder::Expand, ()),
            free_list: OrderedMutex::new(LockOrder::FreeList, free),
            secondary_free_list: SecondaryFreeList::new(),
            sets: OrderedMutex::new(LockOrder::RegionSets, RegionSets::new()),
            young_list: OrderedMutex::new(LockOrder::YoungList, YoungList::new()),
            cset: OrderedMutex::new(LockOrder::CollectionSet, cset),
            chooser: OrderedMutex::new(LockOrder::CollectionSet, CollectionSetChooser::new()),
            policy: OrderedMutex::new(LockOrder::Policy, policy),

            mutator_alloc_region: AllocRegion::new(AllocPurpose::Mutator),
            survivor_gc_alloc_region: AllocRegion::new(AllocPurpose::Survivor),
            old_gc_alloc_region: AllocRegion::new(AllocPurpose::Old),
            par_gc_alloc_lock: OrderedMutex::new(LockOrder::ParGcAlloc, ()),

            summary_used: AtomicUsize::new(0),
            committed_regions: AtomicUsize::new(initial),
            total_collections: AtomicU32::new(0),
            total_full_collections: AtomicU32::new(0),
            epoch: AtomicU32::new(0),

            roots: RootTable::new(),
            dirty_card_queue: DirtyCardQueue::new(refine_threshold),
            dirty_cards_regions: DirtyCardsRegionList::new(),
            sts: SuspendibleThreadSet::new(),

            safepoint: SafepointLock::new(),
            executor: collaborators.safepoint,
            gc_locker,
            marking,
            full_collector,

            metrics: HeapMetrics::new(),
            history: PauseHistory::new(),
            gc_ids: GcIdSource::new(),

            threads: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            this: this.clone(),
        });

        heap.mutator_alloc_region.init();
        heap.start_background_threads();
        Ok(heap)
    }

    fn start_background_threads(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        for worker in 0..self.config.refinement_threads {
            let weak = Arc::downgrade(self);
            let handle = std::thread::Builder::new()
                .name(format!("region-gc-refine-{worker}"))
                .spawn(move || refine::refinement_thread_loop(&weak, worker));
            match handle {
                Ok(h) => threads.push(h),
                // Without refinement threads pauses drain the whole queue.
                Err(_) => break,
            }
        }
        drop(threads);
        self.marking.start(self);
    }

    /// A strong handle to this heap, if it is still alive.
    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    /// The configuration the heap was built with.
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Region size in bytes.
    pub const fn region_size(&self) -> usize {
        self.geometry.region_bytes
    }

    /// Number of regions in the reserved range.
    pub const fn max_regions(&self) -> usize {
        self.geometry.num_regions
    }

    /// Number of committed regions.
    pub fn committed_regions(&self) -> usize {
        self.committed_regions.load(Ordering::Acquire)
    }

    /// Committed bytes.
    pub fn capacity(&self) -> usize {
        self.committed_regions() * self.geometry.region_bytes
    }

    /// Reserved bytes.
    pub const fn max_capacity(&self) -> usize {
        self.geometry.num_regions * self.geometry.region_bytes
    }

    /// Bytes in use: every retired region plus the current mutator region.
    pub fn used(&self) -> usize {
        self.summary_used.load(Ordering::Acquire)
            + self.mutator_alloc_region.used_in_current(self)
    }

    /// Recompute used bytes from the region table. Only exact at a
    /// safepoint.
    pub(crate) fn recalculate_used(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.is_committed() && !r.is_free())
            .map(HeapRegion::used)
            .sum()
    }

    /// Regions on the primary free list.
    pub fn free_regions(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Whether `addr` lies in the reserved range.
    pub const fn is_in_reserved(&self, addr: usize) -> bool {
        self.geometry.contains(addr)
    }

    /// The region table entry for `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`max_regions`](Self::max_regions).
    pub fn region(&self, index: u32) -> &HeapRegion {
        &self.regions[index as usize]
    }

    /// The region containing `addr`, which must lie in the reserved range.
    #[inline]
    pub(crate) fn region_containing(&self, addr: usize) -> &HeapRegion {
        &self.regions[self.geometry.region_index(addr) as usize]
    }

    /// Snapshot of region `index`.
    pub fn region_info(&self, index: u32) -> Option<RegionInfo> {
        self.regions.get(index as usize).map(RegionInfo::from)
    }

    /// Snapshot of every region.
    pub fn regions_info(&self) -> Vec<RegionInfo> {
        self.regions.iter().map(RegionInfo::from).collect()
    }

    /// Eden plus survivor regions, including the current mutator region.
    pub fn young_list_length(&self) -> usize {
        self.young_list.lock().length()
    }

    /// Survivor regions produced by the last pause.
    pub fn survivor_regions(&self) -> Vec<u32> {
        self.young_list.lock().survivors().to_vec()
    }

    /// Members of the old set.
    pub fn old_regions(&self) -> Vec<u32> {
        self.sets.lock().old.iter().collect()
    }

    /// Members of the humongous set.
    pub fn humongous_regions(&self) -> Vec<u32> {
        self.sets.lock().humongous.iter().collect()
    }

    /// Cumulative statistics.
    pub const fn metrics(&self) -> &HeapMetrics {
        &self.metrics
    }

    /// Recent pauses.
    pub const fn history(&self) -> &PauseHistory {
        &self.history
    }

    /// Evacuation pauses and full collections so far.
    pub fn total_collections(&self) -> u32 {
        self.total_collections.load(Ordering::Acquire)
    }

    /// Full collections so far.
    pub fn total_full_collections(&self) -> u32 {
        self.total_full_collections.load(Ordering::Acquire)
    }

    /// Cards waiting for refinement.
    pub fn pending_cards(&self) -> usize {
        self.dirty_card_queue.len()
    }

    /// The heap's own safepoint lock.
    pub const fn safepoint_lock(&self) -> &SafepointLock {
        &self.safepoint
    }

    /// The marking implementation in use.
    pub fn marking(&self) -> &dyn ConcurrentMarking {
        &*self.marking
    }

    /// Safepoint epoch, bumped by every operation that may move objects.
    #[inline]
    pub(crate) fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Attach the calling thread as a mutator. A thread must not attach
    /// twice, nor call [`collect`](Self::collect) or
    /// [`full_collect`](Self::full_collect) while attached.
    pub fn attach(&self) -> Mutator<'_> {
        Mutator::new(self)
    }

    /// Run an evacuation pause. Returns whether it ran; the GC locker can
    /// refuse it.
    pub fn collect(&self, cause: GcCause) -> bool {
        self.collect_in(&mut Detached, cause)
    }

    /// Run a full collection. Returns whether it ran.
    pub fn full_collect(&self, clear_soft_refs: bool) -> bool {
        self.full_collect_in(&mut Detached, clear_soft_refs)
    }

    /// Enter a safepoint from inside an operation's `doit`.
    pub(crate) fn enter_safepoint(&self) -> SafepointScope<'_> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.sts.synchronize();
        SafepointScope { heap: self }
    }

    /// Run `op` through the configured executor. The caller's safepoint
    /// access is released for the duration.
    pub(crate) fn execute_vm_op<C: crate::vm::SafepointContext>(
        &self,
        ctx: &mut C,
        op: &mut dyn VmOperation,
    ) {
        ctx.blocking(|| match &self.executor {
            Some(executor) => {
                let mut wrapped = WithHeapSafepoint {
                    lock: &self.safepoint,
                    op,
                };
                executor.execute(&mut wrapped);
            }
            None => self.safepoint.execute(op),
        });
    }

    /// Stop background threads and wait for them. Pauses still work
    /// afterwards but nothing refines or marks concurrently.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dirty_card_queue.notify_all();
        self.marking.shutdown();
        let current = std::thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            if t.thread().id() != current {
                let _ = t.join();
            }
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) const fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub(crate) fn record_pause(&self, metrics: crate::metrics::PauseMetrics) {
        self.metrics.record_pause(&metrics);
        self.history.push(metrics);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        self.dirty_card_queue.notify_all();
        self.marking.shutdown();
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &format_args!("{:#x}", self.geometry.base))
            .field("regions", &self.geometry.num_regions)
            .field("committed", &self.committed_regions())
            .field("used", &self.used())
            .field("collections", &self.total_collections())
            .finish_non_exhaustive()
    }
}

/// Marks the heap as being at a safepoint; background threads in the
/// suspendible set stay parked until it is dropped.
pub(crate) struct SafepointScope<'a> {
    heap: &'a Heap,
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        self.heap.sts.desynchronize();
    }
}

impl AllocRegionOwner for Heap {
    fn region(&self, index: u32) -> &HeapRegion {
        &self.regions[index as usize]
    }

    fn new_alloc_region(&self, purpose: AllocPurpose, words: usize, force: bool) -> Option<u32> {
        match purpose {
            AllocPurpose::Mutator => self.new_mutator_alloc_region(words, force),
            AllocPurpose::Survivor | AllocPurpose::Old => self.new_gc_alloc_region(purpose, words),
        }
    }

    fn retire_alloc_region(&self, purpose: AllocPurpose, index: u32, allocated_bytes: usize) {
        match purpose {
            AllocPurpose::Mutator => self.retire_mutator_alloc_region(index, allocated_bytes),
            AllocPurpose::Survivor | AllocPurpose::Old => {
                self.retire_gc_alloc_region(purpose, index, allocated_bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_card_math() {
        let g = Geometry::new(0x1000_0000, 1 << 20, 4);
        assert_eq!(g.cards_per_region, 2048);
        assert_eq!(g.region_index(0x1000_0000 + (1 << 20) + 5), 1);
        let card = g.card_index(0x1000_0000 + (1 << 20) + 3 * CARD_SIZE + 8);
        assert_eq!(g.region_of_card(card), 1);
        assert_eq!(g.card_in_region(card), 3);
        assert_eq!(g.global_card(1, 3), card);
        assert_eq!(g.card_start(card), 0x1000_0000 + (1 << 20) + 3 * CARD_SIZE);
        assert!(!g.contains(g.end()));
    }

    #[test]
    fn test_new_heap_commits_initial_regions() {
        let config = HeapConfig::default()
            .with_region_size(256 * 1024)
            .with_initial_heap_size(1024 * 1024)
            .with_max_heap_size(4 * 1024 * 1024)
            .with_refinement_threads(0);
        let heap = Heap::new(config, Collaborators::default()).unwrap();
        assert_eq!(heap.max_regions(), 16);
        assert_eq!(heap.committed_regions(), 4);
        assert_eq!(heap.free_regions(), 4);
        assert_eq!(heap.capacity(), 1024 * 1024);
        assert_eq!(heap.used(), 0);
        assert!(heap.region_info(15).is_some_and(|r| !r.committed));
        assert!(heap.region_info(16).is_none());
        heap.shutdown();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = HeapConfig::default().with_region_size(1000);
        assert!(matches!(
            Heap::new(config, Collaborators::default()),
            Err(HeapError::InvalidConfig(_))
        ));
    }
}
