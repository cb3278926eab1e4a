//! Heap configuration.

use crate::error::HeapError;
use crate::tracing::LogTags;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Smallest supported region size.
pub const MIN_REGION_SIZE: usize = 64 * KIB;
/// Largest supported region size.
pub const MAX_REGION_SIZE: usize = 32 * MIB;

/// Operator-facing heap options.
///
/// Sizes are in bytes and are rounded up to whole regions when the heap is
/// built. Every option has a default; use the `with_*` setters to override.
///
/// ```
/// use region_gc::HeapConfig;
///
/// let config = HeapConfig::default()
///     .with_region_size(256 * 1024)
///     .with_max_heap_size(32 * 256 * 1024)
///     .with_parallel_gc_threads(2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Region size, a power of two between 64 KiB and 32 MiB.
    pub region_size: usize,
    /// Bytes committed at start.
    pub initial_heap_size: usize,
    /// Shrink floor. `None` means the initial size.
    pub min_heap_size: Option<usize>,
    /// Reserved address range.
    pub max_heap_size: usize,
    /// Expand after a full collection if less than this percent is free.
    pub min_free_ratio: u32,
    /// Shrink after a full collection if more than this percent is free.
    pub max_free_ratio: u32,
    /// Pause time budget in milliseconds.
    pub pause_time_target_ms: f64,
    /// Workers per evacuation pause.
    pub parallel_gc_threads: usize,
    /// How many times an allocation may stall on the GC locker.
    pub gc_locker_retry_allocation_count: u32,
    /// Warn every this many allocation retries.
    pub queued_allocation_warning_count: u32,
    /// Extra young regions allowed while the GC locker is active, in percent.
    pub gc_locker_eden_expansion_percent: u32,
    /// Survivor space is at most `young target / survivor_ratio` regions.
    pub survivor_ratio: u32,
    /// Explicit survivor region cap overriding `survivor_ratio`.
    pub max_survivor_regions: Option<u32>,
    /// Age at which survivors are promoted.
    pub max_tenuring_threshold: u32,
    /// Fixed young list length. `None` sizes the young list from the pause budget.
    pub young_list_target_length: Option<u32>,
    /// Start marking when non-young occupancy exceeds this percent.
    pub initiating_heap_occupancy_percent: u32,
    /// Stop mixed collections when reclaimable space drops below this percent.
    pub heap_waste_percent: u32,
    /// Old regions with more live data than this percent are never collected.
    pub mixed_gc_live_threshold_percent: u32,
    /// Spread candidate regions over this many mixed pauses.
    pub mixed_gc_count_target: u32,
    /// Upper bound on old regions per pause, in percent of all regions.
    pub old_cset_region_threshold_percent: u32,
    /// Grow by this percent of the uncommitted space when GC overhead is high.
    pub expand_by_percent_of_available: u32,
    /// Target GC overhead is `100 / (1 + gc_time_ratio)` percent.
    pub gc_time_ratio: u32,
    /// Array elements scanned per partial array task.
    pub array_scan_chunk: usize,
    /// Per-worker copy buffer size in words.
    pub plab_size_words: usize,
    /// Background refinement threads. Zero leaves all cards to pauses.
    pub refinement_threads: usize,
    /// Cards processed between yield checks.
    pub refinement_batch: usize,
    /// Abort the process instead of failing when the heap cannot expand.
    pub exit_on_expansion_failure: bool,
    /// Verify heap invariants before and after every pause.
    pub verify: bool,
    /// Tags whose [`TraceTime`](crate::TraceTime) guards are enabled.
    pub trace_tags: LogTags,
    /// How long a pause waits for the marking root region scan.
    pub root_scan_wait_ms: u64,
    /// How long an abort waits for the marking thread to acknowledge.
    pub marking_abort_wait_ms: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_size: MIB,
            initial_heap_size: 16 * MIB,
            min_heap_size: None,
            max_heap_size: 64 * MIB,
            min_free_ratio: 40,
            max_free_ratio: 70,
            pause_time_target_ms: 200.0,
            parallel_gc_threads: std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get)
                .min(8),
            gc_locker_retry_allocation_count: 2,
            queued_allocation_warning_count: 1000,
            gc_locker_eden_expansion_percent: 5,
            survivor_ratio: 8,
            max_survivor_regions: None,
            max_tenuring_threshold: 15,
            young_list_target_length: None,
            initiating_heap_occupancy_percent: 45,
            heap_waste_percent: 5,
            mixed_gc_live_threshold_percent: 85,
            mixed_gc_count_target: 8,
            old_cset_region_threshold_percent: 10,
            expand_by_percent_of_available: 20,
            gc_time_ratio: 9,
            array_scan_chunk: 50,
            plab_size_words: 1024,
            refinement_threads: 1,
            refinement_batch: 64,
            exit_on_expansion_failure: false,
            verify: false,
            trace_tags: LogTags::NONE,
            root_scan_wait_ms: 100,
            marking_abort_wait_ms: 100,
        }
    }
}

impl HeapConfig {
    /// Set the region size.
    #[must_use]
    pub const fn with_region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self
    }

    /// Set the initially committed size.
    #[must_use]
    pub const fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = bytes;
        self
    }

    /// Set the shrink floor.
    #[must_use]
    pub const fn with_min_heap_size(mut self, bytes: usize) -> Self {
        self.min_heap_size = Some(bytes);
        self
    }

    /// Set the reserved size.
    #[must_use]
    pub const fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = bytes;
        self
    }

    /// Set the free ratio band used after full collections.
    #[must_use]
    pub const fn with_free_ratios(mut self, min: u32, max: u32) -> Self {
        self.min_free_ratio = min;
        self.max_free_ratio = max;
        self
    }

    /// Set the pause time budget.
    #[must_use]
    pub const fn with_pause_time_target_ms(mut self, ms: f64) -> Self {
        self.pause_time_target_ms = ms;
        self
    }

    /// Set the number of pause workers.
    #[must_use]
    pub const fn with_parallel_gc_threads(mut self, n: usize) -> Self {
        self.parallel_gc_threads = n;
        self
    }

    /// Set the GC locker stall ceiling.
    #[must_use]
    pub const fn with_gc_locker_retry_allocation_count(mut self, n: u32) -> Self {
        self.gc_locker_retry_allocation_count = n;
        self
    }

    /// Set how often allocation retries are reported.
    #[must_use]
    pub const fn with_queued_allocation_warning_count(mut self, n: u32) -> Self {
        self.queued_allocation_warning_count = n;
        self
    }

    /// Set the eden growth allowed while the GC locker is active.
    #[must_use]
    pub const fn with_gc_locker_eden_expansion_percent(mut self, pct: u32) -> Self {
        self.gc_locker_eden_expansion_percent = pct;
        self
    }

    /// Set the survivor ratio.
    #[must_use]
    pub const fn with_survivor_ratio(mut self, ratio: u32) -> Self {
        self.survivor_ratio = ratio;
        self
    }

    /// Cap survivor regions explicitly.
    #[must_use]
    pub const fn with_max_survivor_regions(mut self, n: u32) -> Self {
        self.max_survivor_regions = Some(n);
        self
    }

    /// Set the promotion age.
    #[must_use]
    pub const fn with_max_tenuring_threshold(mut self, age: u32) -> Self {
        self.max_tenuring_threshold = age;
        self
    }

    /// Fix the young list length.
    #[must_use]
    pub const fn with_young_list_target_length(mut self, regions: u32) -> Self {
        self.young_list_target_length = Some(regions);
        self
    }

    /// Set the marking trigger.
    #[must_use]
    pub const fn with_initiating_heap_occupancy_percent(mut self, pct: u32) -> Self {
        self.initiating_heap_occupancy_percent = pct;
        self
    }

    /// Set the reclaimable space floor for mixed collections.
    #[must_use]
    pub const fn with_heap_waste_percent(mut self, pct: u32) -> Self {
        self.heap_waste_percent = pct;
        self
    }

    /// Set the liveness cutoff for old region candidates.
    #[must_use]
    pub const fn with_mixed_gc_live_threshold_percent(mut self, pct: u32) -> Self {
        self.mixed_gc_live_threshold_percent = pct;
        self
    }

    /// Set the number of mixed pauses candidates are spread over.
    #[must_use]
    pub const fn with_mixed_gc_count_target(mut self, n: u32) -> Self {
        self.mixed_gc_count_target = n;
        self
    }

    /// Set the per-pause old region cap.
    #[must_use]
    pub const fn with_old_cset_region_threshold_percent(mut self, pct: u32) -> Self {
        self.old_cset_region_threshold_percent = pct;
        self
    }

    /// Set the growth step used when GC overhead is high.
    #[must_use]
    pub const fn with_expand_by_percent_of_available(mut self, pct: u32) -> Self {
        self.expand_by_percent_of_available = pct;
        self
    }

    /// Set the GC overhead target.
    #[must_use]
    pub const fn with_gc_time_ratio(mut self, ratio: u32) -> Self {
        self.gc_time_ratio = ratio;
        self
    }

    /// Set the partial array chunk.
    #[must_use]
    pub const fn with_array_scan_chunk(mut self, elements: usize) -> Self {
        self.array_scan_chunk = elements;
        self
    }

    /// Set the copy buffer size.
    #[must_use]
    pub const fn with_plab_size_words(mut self, words: usize) -> Self {
        self.plab_size_words = words;
        self
    }

    /// Set the refinement pool size.
    #[must_use]
    pub const fn with_refinement_threads(mut self, n: usize) -> Self {
        self.refinement_threads = n;
        self
    }

    /// Set the refinement batch size.
    #[must_use]
    pub const fn with_refinement_batch(mut self, cards: usize) -> Self {
        self.refinement_batch = cards;
        self
    }

    /// Abort on expansion failure.
    #[must_use]
    pub const fn with_exit_on_expansion_failure(mut self, exit: bool) -> Self {
        self.exit_on_expansion_failure = exit;
        self
    }

    /// Verify heap invariants around pauses.
    #[must_use]
    pub const fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Enable timing guards for `tags`.
    #[must_use]
    pub const fn with_trace_tags(mut self, tags: LogTags) -> Self {
        self.trace_tags = tags;
        self
    }

    /// Set the root region scan wait.
    #[must_use]
    pub const fn with_root_scan_wait_ms(mut self, ms: u64) -> Self {
        self.root_scan_wait_ms = ms;
        self
    }

    /// Set the marking abort wait.
    #[must_use]
    pub const fn with_marking_abort_wait_ms(mut self, ms: u64) -> Self {
        self.marking_abort_wait_ms = ms;
        self
    }

    /// Shrink floor in bytes.
    #[must_use]
    pub fn min_heap_size(&self) -> usize {
        self.min_heap_size.unwrap_or(self.initial_heap_size)
    }

    /// Check that the options are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] describing the first bad option.
    pub fn validate(&self) -> Result<(), HeapError> {
        let invalid = |msg: String| Err(HeapError::InvalidConfig(msg));

        if !self.region_size.is_power_of_two()
            || self.region_size < MIN_REGION_SIZE
            || self.region_size > MAX_REGION_SIZE
        {
            return invalid(format!(
                "region_size {} must be a power of two in [{MIN_REGION_SIZE}, {MAX_REGION_SIZE}]",
                self.region_size
            ));
        }
        if self.region_size % sys_alloc::allocation_granularity() != 0 {
            return invalid(format!(
                "region_size {} is not a multiple of the allocation granularity",
                self.region_size
            ));
        }
        if self.max_heap_size < self.region_size {
            return invalid(format!(
                "max_heap_size {} is smaller than one region",
                self.max_heap_size
            ));
        }
        if self.initial_heap_size > self.max_heap_size {
            return invalid(format!(
                "initial_heap_size {} exceeds max_heap_size {}",
                self.initial_heap_size, self.max_heap_size
            ));
        }
        if self.min_heap_size() > self.max_heap_size {
            return invalid("min_heap_size exceeds max_heap_size".into());
        }
        if self.max_heap_size / self.region_size > u32::MAX as usize / 2 {
            return invalid("too many regions".into());
        }
        if self.min_free_ratio > 100
            || self.max_free_ratio > 100
            || self.min_free_ratio > self.max_free_ratio
        {
            return invalid(format!(
                "free ratios {}..{} are not a valid percent range",
                self.min_free_ratio, self.max_free_ratio
            ));
        }
        if !(self.pause_time_target_ms.is_finite() && self.pause_time_target_ms > 0.0) {
            return invalid("pause_time_target_ms must be positive".into());
        }
        if self.parallel_gc_threads == 0 {
            return invalid("parallel_gc_threads must be at least 1".into());
        }
        if self.survivor_ratio == 0 {
            return invalid("survivor_ratio must be at least 1".into());
        }
        if self.max_tenuring_threshold > crate::object::MarkWord::MAX_AGE {
            return invalid(format!(
                "max_tenuring_threshold must not exceed {}",
                crate::object::MarkWord::MAX_AGE
            ));
        }
        if self.mixed_gc_count_target == 0 {
            return invalid("mixed_gc_count_target must be at least 1".into());
        }
        for (name, pct) in [
            ("initiating_heap_occupancy_percent", self.initiating_heap_occupancy_percent),
            ("heap_waste_percent", self.heap_waste_percent),
            ("mixed_gc_live_threshold_percent", self.mixed_gc_live_threshold_percent),
            ("old_cset_region_threshold_percent", self.old_cset_region_threshold_percent),
            ("expand_by_percent_of_available", self.expand_by_percent_of_available),
        ] {
            if pct > 100 {
                return invalid(format!("{name} {pct} exceeds 100"));
            }
        }
        if self.array_scan_chunk == 0 {
            return invalid("array_scan_chunk must be at least 1".into());
        }
        let region_words = self.region_size / crate::object::WORD_SIZE;
        if self.plab_size_words < crate::object::MIN_OBJECT_WORDS
            || self.plab_size_words > region_words / 2
            || self.plab_size_words % crate::object::OBJECT_ALIGNMENT_WORDS != 0
        {
            return invalid(format!(
                "plab_size_words {} must be even and lie in [2, {}]",
                self.plab_size_words,
                region_words / 2
            ));
        }
        if self.refinement_batch == 0 {
            return invalid("refinement_batch must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        HeapConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_region_size_must_be_power_of_two() {
        let config = HeapConfig::default().with_region_size(3 * MIB);
        assert!(matches!(
            config.validate(),
            Err(HeapError::InvalidConfig(_))
        ));
        let config = HeapConfig::default().with_region_size(64 * MIB);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_exceeds_max() {
        let config = HeapConfig::default()
            .with_initial_heap_size(128 * MIB)
            .with_max_heap_size(64 * MIB);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_free_ratio_band() {
        assert!(HeapConfig::default().with_free_ratios(80, 20).validate().is_err());
        assert!(HeapConfig::default().with_free_ratios(10, 20).validate().is_ok());
    }

    #[test]
    fn test_min_heap_defaults_to_initial() {
        let config = HeapConfig::default().with_initial_heap_size(4 * MIB);
        assert_eq!(config.min_heap_size(), 4 * MIB);
        assert_eq!(config.with_min_heap_size(2 * MIB).min_heap_size(), 2 * MIB);
    }
}
