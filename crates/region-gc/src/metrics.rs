//! GC metrics and statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::gc::GcCause;

/// Kind of stop-the-world collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PauseKind {
    /// No collection has run yet.
    #[default]
    None,
    /// Young regions only.
    Young,
    /// Young regions plus old candidates.
    Mixed,
    /// Young pause that also starts a marking cycle.
    InitialMark,
    /// Whole heap collection.
    Full,
}

impl PauseKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Young => "young",
            Self::Mixed => "mixed",
            Self::InitialMark => "initial-mark",
            Self::Full => "full",
        }
    }
}

/// Statistics of one pause worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Objects this worker copied.
    pub objects_copied: usize,
    /// Bytes this worker copied.
    pub bytes_copied: usize,
    /// Time spent scanning its share of the roots.
    pub root_scan_time: Duration,
    /// Time spent scanning remembered set cards.
    pub rs_scan_time: Duration,
    /// Cards this worker claimed and scanned.
    pub cards_scanned: usize,
    /// Time spent in the termination protocol.
    pub termination_time: Duration,
    /// Number of termination offers.
    pub termination_attempts: usize,
    /// Tasks taken from other workers.
    pub steals: usize,
    /// Words filled at PLAB retirement.
    pub plab_waste_words: usize,
    /// Words filled after losing a forwarding race.
    pub undo_waste_words: usize,
    /// Objects this worker self-forwarded.
    pub failed_objects: usize,
}

impl WorkerStats {
    /// Fold another worker's numbers into these.
    pub fn merge(&mut self, other: &Self) {
        self.objects_copied += other.objects_copied;
        self.bytes_copied += other.bytes_copied;
        self.root_scan_time += other.root_scan_time;
        self.rs_scan_time += other.rs_scan_time;
        self.cards_scanned += other.cards_scanned;
        self.termination_time += other.termination_time;
        self.termination_attempts += other.termination_attempts;
        self.steals += other.steals;
        self.plab_waste_words += other.plab_waste_words;
        self.undo_waste_words += other.undo_waste_words;
        self.failed_objects += other.failed_objects;
    }
}

/// Statistics from one collection.
#[derive(Debug, Clone, Default)]
pub struct PauseMetrics {
    /// Collection id.
    pub gc_id: u64,
    /// What kind of collection ran.
    pub kind: PauseKind,
    /// Why it ran.
    pub cause: Option<GcCause>,
    /// Wall time of the whole pause.
    pub duration: Duration,
    /// Time draining the dirty card queue.
    pub update_rs_time: Duration,
    /// Time choosing the collection set.
    pub cset_time: Duration,
    /// Time in the parallel evacuation phase.
    pub evacuate_time: Duration,
    /// Time processing references.
    pub ref_proc_time: Duration,
    /// Time repairing evacuation failures.
    pub evac_failure_time: Duration,
    /// Time freeing the collection set and resetting state.
    pub cleanup_time: Duration,
    /// Eden regions collected.
    pub eden_regions: usize,
    /// Survivor regions collected.
    pub survivor_regions: usize,
    /// Old regions collected.
    pub old_regions: usize,
    /// Predicted pause time in milliseconds.
    pub predicted_ms: f64,
    /// Cards drained from the dirty card queue.
    pub cards_refined: usize,
    /// Summed per-worker statistics.
    pub totals: WorkerStats,
    /// Per-worker statistics.
    pub workers: Vec<WorkerStats>,
    /// Regions that kept self-forwarded objects.
    pub failed_regions: usize,
    /// Heap bytes in use before the pause.
    pub used_before: usize,
    /// Heap bytes in use after the pause.
    pub used_after: usize,
    /// Regions returned to the free list.
    pub regions_freed: usize,
    /// Weak references cleared.
    pub refs_cleared: usize,
}

impl PauseMetrics {
    /// Bytes released by this collection.
    #[must_use]
    pub const fn bytes_reclaimed(&self) -> usize {
        self.used_before.saturating_sub(self.used_after)
    }

    /// Whether any object stayed in place because copying failed.
    #[must_use]
    pub const fn evacuation_failed(&self) -> bool {
        self.failed_regions > 0
    }
}

/// Cumulative statistics of a heap.
#[derive(Debug, Default)]
pub struct HeapMetrics {
    young_pauses: AtomicUsize,
    mixed_pauses: AtomicUsize,
    full_collections: AtomicUsize,
    evacuation_failures: AtomicUsize,
    allocation_retry_warnings: AtomicUsize,
    humongous_allocations: AtomicUsize,
    marking_cycles: AtomicUsize,
    marking_aborts: AtomicUsize,
    regions_expanded: AtomicUsize,
    regions_shrunk: AtomicUsize,
    cards_refined: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
}

macro_rules! counter {
    ($(#[$doc:meta])* $get:ident, $field:ident) => {
        $(#[$doc])*
        #[inline]
        #[must_use]
        pub fn $get(&self) -> usize {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl HeapMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            young_pauses: AtomicUsize::new(0),
            mixed_pauses: AtomicUsize::new(0),
            full_collections: AtomicUsize::new(0),
            evacuation_failures: AtomicUsize::new(0),
            allocation_retry_warnings: AtomicUsize::new(0),
            humongous_allocations: AtomicUsize::new(0),
            marking_cycles: AtomicUsize::new(0),
            marking_aborts: AtomicUsize::new(0),
            regions_expanded: AtomicUsize::new(0),
            regions_shrunk: AtomicUsize::new(0),
            cards_refined: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    counter!(
        /// Young and initial-mark pauses.
        young_pauses, young_pauses
    );
    counter!(
        /// Pauses that also collected old regions.
        mixed_pauses, mixed_pauses
    );
    counter!(
        /// Full collections.
        full_collections, full_collections
    );
    counter!(
        /// Pauses with at least one self-forwarded object.
        evacuation_failures, evacuation_failures
    );
    counter!(
        /// Allocation retry-storm warnings.
        allocation_retry_warnings, allocation_retry_warnings
    );
    counter!(
        /// Humongous objects allocated.
        humongous_allocations, humongous_allocations
    );
    counter!(
        /// Completed marking cycles.
        marking_cycles, marking_cycles
    );
    counter!(
        /// Aborted marking cycles.
        marking_aborts, marking_aborts
    );
    counter!(
        /// Regions committed after startup.
        regions_expanded, regions_expanded
    );
    counter!(
        /// Regions uncommitted.
        regions_shrunk, regions_shrunk
    );
    counter!(
        /// Cards refined concurrently or at pause start.
        cards_refined, cards_refined
    );
    counter!(
        /// Bytes released by all collections.
        total_bytes_reclaimed, bytes_reclaimed
    );

    /// Total number of collections of any kind.
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.young_pauses() + self.mixed_pauses() + self.full_collections()
    }

    /// Total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn record_pause(&self, metrics: &PauseMetrics) {
        match metrics.kind {
            PauseKind::Young | PauseKind::InitialMark => {
                self.young_pauses.fetch_add(1, Ordering::Relaxed);
            }
            PauseKind::Mixed => {
                self.mixed_pauses.fetch_add(1, Ordering::Relaxed);
            }
            PauseKind::Full => {
                self.full_collections.fetch_add(1, Ordering::Relaxed);
            }
            PauseKind::None => {}
        }
        if metrics.evacuation_failed() {
            self.evacuation_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed(), Ordering::Relaxed);
        self.pause_ns.fetch_add(
            metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub(crate) fn record_allocation_retry_warning(&self) {
        self.allocation_retry_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_humongous_allocation(&self) {
        self.humongous_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_marking_cycle(&self) {
        self.marking_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_marking_abort(&self) {
        self.marking_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expansion(&self, regions: usize) {
        self.regions_expanded.fetch_add(regions, Ordering::Relaxed);
    }

    pub(crate) fn record_shrink(&self, regions: usize) {
        self.regions_shrunk.fetch_add(regions, Ordering::Relaxed);
    }

    pub(crate) fn record_cards_refined(&self, cards: usize) {
        self.cards_refined.fetch_add(cards, Ordering::Relaxed);
    }
}

/// Ring buffer size for pause history.
pub const HISTORY_SIZE: usize = 64;

/// The most recent [`HISTORY_SIZE`] collections of a heap, oldest first.
#[derive(Debug, Default)]
pub struct PauseHistory {
    entries: Mutex<VecDeque<PauseMetrics>>,
    total: AtomicUsize,
}

impl PauseHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(HISTORY_SIZE)),
            total: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, metrics: PauseMetrics) {
        let mut entries = self.entries.lock();
        if entries.len() == HISTORY_SIZE {
            entries.pop_front();
        }
        entries.push_back(metrics);
        self.total.fetch_add(1, Ordering::Release);
    }

    /// Number of collections ever recorded, including evicted ones.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// The newest entry.
    #[must_use]
    pub fn last(&self) -> Option<PauseMetrics> {
        self.entries.lock().back().cloned()
    }

    /// Up to `n` most recent entries, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<PauseMetrics> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Average duration of the last `n` collections.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(|m| m.duration).sum();
        total / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    /// Longest duration among the last `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pause(ms: u64, kind: PauseKind) -> PauseMetrics {
        PauseMetrics {
            kind,
            duration: Duration::from_millis(ms),
            used_before: 1000,
            used_after: 400,
            ..PauseMetrics::default()
        }
    }

    #[test]
    fn test_history_ring_evicts_oldest() {
        let history = PauseHistory::new();
        for i in 0..(HISTORY_SIZE as u64 + 6) {
            history.push(pause(i, PauseKind::Young));
        }
        assert_eq!(history.total_recorded(), HISTORY_SIZE + 6);
        let all = history.recent(usize::MAX);
        assert_eq!(all.len(), HISTORY_SIZE);
        assert_eq!(all[0].duration, Duration::from_millis(6));
        assert_eq!(
            history.last().map(|m| m.duration),
            Some(Duration::from_millis(HISTORY_SIZE as u64 + 5))
        );
    }

    #[test]
    fn test_history_averages() {
        let history = PauseHistory::new();
        assert_eq!(history.average_pause_time(10), Duration::ZERO);
        history.push(pause(10, PauseKind::Young));
        history.push(pause(30, PauseKind::Mixed));
        assert_eq!(history.average_pause_time(10), Duration::from_millis(20));
        assert_eq!(history.max_pause_time(10), Duration::from_millis(30));
        assert_eq!(history.max_pause_time(1), Duration::from_millis(30));
    }

    #[test]
    fn test_heap_metrics_record_pause() {
        let metrics = HeapMetrics::new();
        metrics.record_pause(&pause(5, PauseKind::Young));
        metrics.record_pause(&pause(5, PauseKind::Mixed));
        let mut failed = pause(5, PauseKind::Full);
        failed.failed_regions = 2;
        metrics.record_pause(&failed);
        assert_eq!(metrics.young_pauses(), 1);
        assert_eq!(metrics.mixed_pauses(), 1);
        assert_eq!(metrics.full_collections(), 1);
        assert_eq!(metrics.total_collections(), 3);
        assert_eq!(metrics.evacuation_failures(), 1);
        assert_eq!(metrics.total_bytes_reclaimed(), 1800);
        assert_eq!(metrics.total_pause_ns(), 15_000_000);
    }

    #[test]
    fn test_worker_stats_merge() {
        let mut total = WorkerStats::default();
        let w = WorkerStats {
            objects_copied: 3,
            bytes_copied: 96,
            termination_attempts: 2,
            ..WorkerStats::default()
        };
        total.merge(&w);
        total.merge(&w);
        assert_eq!(total.objects_copied, 6);
        assert_eq!(total.bytes_copied, 192);
        assert_eq!(total.termination_attempts, 4);
    }
}
