//! Pause-time policy.
//!
//! Owns the cost model (decaying averages of copy cost per byte, card scan
//! cost, fixed and per-region overheads and the young survival rate), sizes
//! the young generation against the pause budget, chooses the old part of
//! mixed collection sets, decides when to start concurrent marking and
//! how much to grow the heap after a pause.

use std::collections::VecDeque;
use std::time::Instant;

use super::cset::CollectionSetChooser;
use crate::config::HeapConfig;
use crate::metrics::{PauseKind, PauseMetrics};
use crate::object::{MarkWord, WORD_SIZE};

/// Smallest heap expansion, in bytes.
pub const MIN_EXPAND_BYTES: usize = 1024 * 1024;

const SIGMA: f64 = 0.5;
const DECAY: f64 = 0.7;
const TARGET_SURVIVOR_PERCENT: usize = 50;
const MIN_YOUNG_PERCENT: usize = 5;
const MAX_YOUNG_PERCENT: usize = 60;
const RESERVE_PERCENT: f64 = 10.0;
const RECENT_PAUSES: usize = 10;

/// Decaying average and variance, predicting pessimistically.
#[derive(Debug, Clone, Copy)]
pub struct DecayingSeq {
    davg: f64,
    dvariance: f64,
    count: usize,
    initial: f64,
}

impl DecayingSeq {
    pub const fn new(initial: f64) -> Self {
        Self {
            davg: 0.0,
            dvariance: 0.0,
            count: 0,
            initial,
        }
    }

    pub fn add(&mut self, v: f64) {
        if self.count == 0 {
            self.davg = v;
            self.dvariance = 0.0;
        } else {
            self.davg = (1.0 - DECAY).mul_add(v, DECAY * self.davg);
            let diff = v - self.davg;
            self.dvariance = (1.0 - DECAY).mul_add(diff * diff, DECAY * self.dvariance);
        }
        self.count += 1;
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    pub const fn davg(&self) -> f64 {
        if self.count == 0 {
            self.initial
        } else {
            self.davg
        }
    }

    /// Average plus half a standard deviation.
    pub fn predict(&self) -> f64 {
        if self.count == 0 {
            self.initial
        } else {
            SIGMA.mul_add(self.dvariance.sqrt(), self.davg)
        }
    }
}

/// Words of surviving objects per age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeTable {
    sizes: [usize; MarkWord::MAX_AGE as usize + 1],
}

impl AgeTable {
    pub const fn new() -> Self {
        Self {
            sizes: [0; MarkWord::MAX_AGE as usize + 1],
        }
    }

    pub fn add(&mut self, age: u32, words: usize) {
        self.sizes[age.min(MarkWord::MAX_AGE) as usize] += words;
    }

    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.sizes.iter_mut().zip(other.sizes) {
            *a += b;
        }
    }

    pub fn words_at(&self, age: u32) -> usize {
        self.sizes[age.min(MarkWord::MAX_AGE) as usize]
    }

    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// The youngest age at which the survivors would overflow half of
    /// `survivor_capacity_words`, capped by `max_threshold`.
    pub fn compute_tenuring_threshold(&self, survivor_capacity_words: usize, max_threshold: u32) -> u32 {
        let desired = survivor_capacity_words * TARGET_SURVIVOR_PERCENT / 100;
        let mut total = 0;
        let mut age = 1;
        while age <= MarkWord::MAX_AGE {
            total += self.sizes[age as usize];
            if total > desired {
                break;
            }
            age += 1;
        }
        age.min(max_threshold)
    }
}

impl Default for AgeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Facts about a finished pause that feed the cost model.
#[derive(Debug, Clone, Default)]
pub struct PauseRecord {
    pub metrics: PauseMetrics,
    /// Used bytes of the young regions in the collection set.
    pub young_bytes: usize,
    /// Bytes copied out of young regions.
    pub surviving_young_bytes: usize,
    /// Survivor ages of everything copied to survivor regions.
    pub age_table: AgeTable,
}

/// Pause-time policy.
#[derive(Debug)]
pub struct Policy {
    region_bytes: usize,
    pause_target_ms: f64,
    fixed_young_length: Option<usize>,
    survivor_ratio: usize,
    survivor_cap: Option<usize>,
    max_tenuring_threshold: u32,
    ihop_percent: usize,
    heap_waste_percent: usize,
    mixed_gc_count_target: usize,
    old_cset_threshold_percent: usize,
    expand_percent: usize,
    gc_time_ratio: usize,
    locker_eden_percent: usize,

    cost_per_byte_ms: DecayingSeq,
    cost_per_card_ms: DecayingSeq,
    constant_other_ms: DecayingSeq,
    young_other_per_region_ms: DecayingSeq,
    old_other_per_region_ms: DecayingSeq,
    survival_rate: DecayingSeq,
    pending_cards: DecayingSeq,
    rs_lengths: DecayingSeq,

    young_list_target_length: usize,
    young_list_max_length: usize,
    max_survivor_regions: usize,
    tenuring_threshold: u32,

    initiate_conc_mark_if_possible: bool,
    during_initial_mark_pause: bool,
    gcs_are_young: bool,
    last_young_gc: bool,
    candidates_at_cycle_start: usize,

    recent_pauses: VecDeque<(Instant, f64)>,
}

impl Policy {
    pub fn new(config: &HeapConfig) -> Self {
        let mut policy = Self {
            region_bytes: config.region_size,
            pause_target_ms: config.pause_time_target_ms,
            fixed_young_length: config.young_list_target_length.map(|n| n as usize),
            survivor_ratio: config.survivor_ratio as usize,
            survivor_cap: config.max_survivor_regions.map(|n| n as usize),
            max_tenuring_threshold: config.max_tenuring_threshold,
            ihop_percent: config.initiating_heap_occupancy_percent as usize,
            heap_waste_percent: config.heap_waste_percent as usize,
            mixed_gc_count_target: config.mixed_gc_count_target as usize,
            old_cset_threshold_percent: config.old_cset_region_threshold_percent as usize,
            expand_percent: config.expand_by_percent_of_available as usize,
            gc_time_ratio: config.gc_time_ratio as usize,
            locker_eden_percent: config.gc_locker_eden_expansion_percent as usize,

            cost_per_byte_ms: DecayingSeq::new(0.000_002),
            cost_per_card_ms: DecayingSeq::new(0.000_5),
            constant_other_ms: DecayingSeq::new(2.0),
            young_other_per_region_ms: DecayingSeq::new(0.1),
            old_other_per_region_ms: DecayingSeq::new(0.3),
            survival_rate: DecayingSeq::new(0.4),
            pending_cards: DecayingSeq::new(0.0),
            rs_lengths: DecayingSeq::new(0.0),

            young_list_target_length: 1,
            young_list_max_length: 1,
            max_survivor_regions: 0,
            tenuring_threshold: config.max_tenuring_threshold,

            initiate_conc_mark_if_possible: false,
            during_initial_mark_pause: false,
            gcs_are_young: true,
            last_young_gc: false,
            candidates_at_cycle_start: 0,

            recent_pauses: VecDeque::with_capacity(RECENT_PAUSES),
        };
        policy.set_survivor_limit();
        policy
    }

    // ---------------------------------------------------------------------
    // Cost model
    // ---------------------------------------------------------------------

    /// Fixed cost of a pause before any region is considered.
    #[allow(clippy::cast_precision_loss)]
    pub fn predict_base_time_ms(&self) -> f64 {
        let cards = self.pending_cards.predict() + self.rs_lengths.predict();
        cards.mul_add(self.cost_per_card_ms.predict(), self.constant_other_ms.predict())
    }

    /// Bytes a region is expected to contribute to copying.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn predict_bytes_to_copy(&self, young: bool, used: usize, live: Option<usize>) -> usize {
        if young {
            (used as f64 * self.survival_rate.predict().clamp(0.0, 1.0)) as usize
        } else {
            live.unwrap_or(used).min(used)
        }
    }

    /// Predicted cost of evacuating one region.
    #[allow(clippy::cast_precision_loss)]
    pub fn predict_region_time_ms(&self, young: bool, used: usize, live: Option<usize>, rs_cards: usize) -> f64 {
        let copy = self.predict_bytes_to_copy(young, used, live) as f64 * self.cost_per_byte_ms.predict();
        let rs = rs_cards as f64 * self.cost_per_card_ms.predict();
        let other = if young {
            self.young_other_per_region_ms.predict()
        } else {
            self.old_other_per_region_ms.predict()
        };
        copy + rs + other
    }

    /// Whether a young generation of `young_length` regions can be evacuated
    /// within the budget and its survivors fit in `base_free_regions`.
    #[allow(clippy::cast_precision_loss)]
    pub fn predict_will_fit(&self, young_length: usize, base_time_ms: f64, base_free_regions: usize) -> bool {
        if young_length >= base_free_regions {
            return false;
        }
        let bytes_to_copy =
            self.predict_bytes_to_copy(true, young_length * self.region_bytes, None) as f64;
        let predicted = (young_length as f64).mul_add(
            self.young_other_per_region_ms.predict(),
            bytes_to_copy.mul_add(self.cost_per_byte_ms.predict(), base_time_ms),
        );
        if predicted > self.pause_target_ms {
            return false;
        }
        let free_bytes = ((base_free_regions - young_length) * self.region_bytes) as f64;
        free_bytes >= bytes_to_copy * (1.0 + RESERVE_PERCENT / 100.0)
    }

    // ---------------------------------------------------------------------
    // Young sizing
    // ---------------------------------------------------------------------

    /// Recompute the young target from `available_regions` (free plus
    /// uncommitted) and the current survivor count.
    pub fn update_young_list_target_length(
        &mut self,
        available_regions: usize,
        survivor_regions: usize,
        heap_regions: usize,
    ) {
        let target = if let Some(fixed) = self.fixed_young_length {
            fixed.max(1)
        } else {
            let base_min = survivor_regions + 1;
            let desired_min = base_min.max((heap_regions * MIN_YOUNG_PERCENT).div_ceil(100));
            let desired_max = desired_min.max(heap_regions * MAX_YOUNG_PERCENT / 100);
            // Survivors are part of the young generation but already
            // allocated; only eden comes out of the available regions.
            let base_free = available_regions + survivor_regions;
            let base_time = self.predict_base_time_ms();
            if self.predict_will_fit(desired_min, base_time, base_free) {
                let (mut lo, mut hi) = (desired_min, desired_max);
                while lo < hi {
                    let mid = lo + (hi - lo).div_ceil(2);
                    if self.predict_will_fit(mid, base_time, base_free) {
                        lo = mid;
                    } else {
                        hi = mid - 1;
                    }
                }
                lo
            } else {
                desired_min
            }
        };
        self.young_list_target_length = target;
        self.young_list_max_length =
            target + (target * self.locker_eden_percent).div_ceil(100);
        self.set_survivor_limit();
    }

    fn set_survivor_limit(&mut self) {
        self.max_survivor_regions = self.survivor_cap.unwrap_or_else(|| {
            self.young_list_target_length
                .div_ceil(self.survivor_ratio.max(1))
        });
    }

    pub const fn young_list_target_length(&self) -> usize {
        self.young_list_target_length
    }

    pub const fn young_list_max_length(&self) -> usize {
        self.young_list_max_length
    }

    pub const fn max_survivor_regions(&self) -> usize {
        self.max_survivor_regions
    }

    pub const fn tenuring_threshold(&self) -> u32 {
        self.tenuring_threshold
    }

    /// Whether the mutator may take another eden region.
    pub const fn should_allocate_mutator_region(&self, young_length: usize) -> bool {
        young_length < self.young_list_target_length
    }

    /// Whether eden may grow past its target while the GC locker is active.
    pub const fn can_expand_young_list(&self, young_length: usize) -> bool {
        young_length < self.young_list_max_length
    }

    // ---------------------------------------------------------------------
    // Marking initiation and mixed collections
    // ---------------------------------------------------------------------

    /// IHOP check: non-young occupancy plus `alloc_bytes` exceeds the
    /// threshold and no cycle is running.
    pub const fn need_to_start_conc_mark(
        &self,
        non_young_bytes: usize,
        alloc_bytes: usize,
        capacity: usize,
        during_cycle: bool,
    ) -> bool {
        if during_cycle {
            return false;
        }
        let threshold = capacity / 100 * self.ihop_percent;
        non_young_bytes + alloc_bytes > threshold
    }

    pub fn set_initiate_conc_mark_if_possible(&mut self) {
        self.initiate_conc_mark_if_possible = true;
    }

    pub const fn initiate_conc_mark_if_possible(&self) -> bool {
        self.initiate_conc_mark_if_possible
    }

    /// Called at pause start. Returns whether this pause starts a cycle.
    pub fn decide_on_conc_mark_initiation(&mut self, during_cycle: bool) -> bool {
        self.during_initial_mark_pause = false;
        if self.initiate_conc_mark_if_possible && !during_cycle {
            self.initiate_conc_mark_if_possible = false;
            self.during_initial_mark_pause = true;
            // A new cycle replaces whatever mixed phase was in progress.
            self.gcs_are_young = true;
            self.last_young_gc = false;
        }
        self.during_initial_mark_pause
    }

    pub const fn during_initial_mark_pause(&self) -> bool {
        self.during_initial_mark_pause
    }

    pub const fn gcs_are_young(&self) -> bool {
        self.gcs_are_young
    }

    /// Marking finished with `candidates` old regions worth collecting.
    pub fn record_concurrent_mark_cleanup_end(&mut self, candidates: usize) {
        self.candidates_at_cycle_start = candidates;
        self.last_young_gc = candidates > 0;
    }

    /// Kind of the pause about to run.
    pub const fn pause_kind(&self) -> PauseKind {
        if self.during_initial_mark_pause {
            PauseKind::InitialMark
        } else if self.gcs_are_young {
            PauseKind::Young
        } else {
            PauseKind::Mixed
        }
    }

    /// Whether the chooser still holds enough garbage for mixed pauses.
    #[allow(clippy::cast_precision_loss)]
    pub fn worth_collecting_old(&self, chooser: &CollectionSetChooser, capacity: usize) -> bool {
        if chooser.is_empty() || capacity == 0 {
            return false;
        }
        let pct = chooser.remaining_reclaimable_bytes() as f64 * 100.0 / capacity as f64;
        pct > self.heap_waste_percent as f64
    }

    /// Old regions every mixed pause should take at least.
    pub fn min_old_cset_length(&self) -> usize {
        self.candidates_at_cycle_start
            .div_ceil(self.mixed_gc_count_target.max(1))
    }

    /// Old regions a mixed pause may take at most.
    pub fn max_old_cset_length(&self, heap_regions: usize) -> usize {
        (heap_regions * self.old_cset_threshold_percent).div_ceil(100)
    }

    /// Pick old regions for a mixed pause from the chooser.
    pub fn finalize_old_cset(
        &self,
        chooser: &mut CollectionSetChooser,
        mut time_remaining_ms: f64,
        heap_regions: usize,
        capacity: usize,
    ) -> (Vec<u32>, f64) {
        let mut old = Vec::new();
        let mut predicted = 0.0;
        if self.gcs_are_young {
            return (old, predicted);
        }
        let min_old = self.min_old_cset_length();
        let max_old = self.max_old_cset_length(heap_regions);
        while let Some(c) = chooser.peek() {
            if old.len() >= max_old {
                break;
            }
            if !self.worth_collecting_old(chooser, capacity) {
                break;
            }
            if c.predicted_ms > time_remaining_ms && old.len() >= min_old {
                break;
            }
            let c = chooser.pop().unwrap_or(c);
            time_remaining_ms = (time_remaining_ms - c.predicted_ms).max(0.0);
            predicted += c.predicted_ms;
            old.push(c.index);
        }
        (old, predicted)
    }

    // ---------------------------------------------------------------------
    // Pause accounting
    // ---------------------------------------------------------------------

    /// Feed a finished pause into the model.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pause(&mut self, record: &PauseRecord, survivor_capacity_words: usize, chooser: &CollectionSetChooser, capacity: usize) {
        let m = &record.metrics;
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1000.0;

        if m.totals.bytes_copied > 0 {
            self.cost_per_byte_ms
                .add(ms(m.evacuate_time) / m.totals.bytes_copied as f64);
        }
        let cards = m.totals.cards_scanned + m.cards_refined;
        if cards > 0 {
            let per_worker = m.workers.len().max(1) as f64;
            let rs_ms = ms(m.totals.rs_scan_time) / per_worker + ms(m.update_rs_time);
            self.cost_per_card_ms.add(rs_ms / cards as f64);
        }
        self.pending_cards.add(m.cards_refined as f64);
        let regions = m.eden_regions + m.survivor_regions + m.old_regions;
        if regions > 0 {
            self.rs_lengths
                .add(m.totals.cards_scanned as f64 / regions as f64);
        }
        let other = (ms(m.duration) - ms(m.evacuate_time) - ms(m.update_rs_time)).max(0.0);
        let young_regions = m.eden_regions + m.survivor_regions;
        if young_regions > 0 {
            self.young_other_per_region_ms
                .add(ms(m.cleanup_time) / young_regions as f64);
        }
        if m.old_regions > 0 {
            self.old_other_per_region_ms
                .add(ms(m.cleanup_time) / regions as f64);
        }
        self.constant_other_ms.add(other);
        if record.young_bytes > 0 {
            self.survival_rate
                .add(record.surviving_young_bytes as f64 / record.young_bytes as f64);
        }

        self.tenuring_threshold = record
            .age_table
            .compute_tenuring_threshold(survivor_capacity_words, self.max_tenuring_threshold);

        // Young-only and mixed phases.
        if self.last_young_gc && m.kind == PauseKind::Young {
            self.last_young_gc = false;
            self.gcs_are_young = !self.worth_collecting_old(chooser, capacity);
        } else if !self.gcs_are_young && !self.worth_collecting_old(chooser, capacity) {
            self.gcs_are_young = true;
        }
        self.during_initial_mark_pause = false;

        if self.recent_pauses.len() == RECENT_PAUSES {
            self.recent_pauses.pop_front();
        }
        self.recent_pauses
            .push_back((Instant::now() - m.duration, ms(m.duration)));
    }

    /// Forget the mixed phase, e.g. after a full collection.
    pub fn reset_after_full(&mut self) {
        self.gcs_are_young = true;
        self.last_young_gc = false;
        self.candidates_at_cycle_start = 0;
        self.during_initial_mark_pause = false;
    }

    /// Recent GC overhead as a percentage of wall time.
    #[allow(clippy::cast_precision_loss)]
    pub fn recent_gc_overhead_percent(&self) -> f64 {
        let Some(&(first, _)) = self.recent_pauses.front() else {
            return 0.0;
        };
        let window = first.elapsed().as_secs_f64() * 1000.0;
        if window <= 0.0 {
            return 0.0;
        }
        let total: f64 = self.recent_pauses.iter().map(|&(_, ms)| ms).sum();
        total * 100.0 / window
    }

    /// Bytes to expand the heap by after a pause: non-zero when the recent
    /// GC overhead is above `100 / (1 + gc_time_ratio)` percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn expansion_amount(&self, committed: usize, uncommitted: usize) -> usize {
        if uncommitted == 0 || self.recent_pauses.len() < 2 {
            return 0;
        }
        let threshold = 100.0 / (1.0 + self.gc_time_ratio as f64);
        if self.recent_gc_overhead_percent() <= threshold {
            return 0;
        }
        let grow = (uncommitted * self.expand_percent / 100).min(committed);
        grow.max(MIN_EXPAND_BYTES).min(uncommitted)
    }

    /// Survivor space in words allowed per pause.
    pub const fn survivor_capacity_words(&self) -> usize {
        self.max_survivor_regions * self.region_bytes / WORD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> Policy {
        Policy::new(&HeapConfig::default())
    }

    #[test]
    fn test_decaying_seq_tracks_recent_values() {
        let mut s = DecayingSeq::new(5.0);
        assert!((s.predict() - 5.0).abs() < f64::EPSILON);
        for _ in 0..50 {
            s.add(1.0);
        }
        assert!((s.davg() - 1.0).abs() < 1e-9);
        s.add(10.0);
        assert!(s.davg() > 1.0 && s.davg() < 10.0);
        assert!(s.predict() > s.davg());
    }

    #[test]
    fn test_tenuring_threshold_from_ages() {
        let mut t = AgeTable::new();
        t.add(1, 10);
        t.add(2, 10);
        t.add(3, 100);
        assert_eq!(t.compute_tenuring_threshold(100, 15), 3);
        assert_eq!(t.compute_tenuring_threshold(100, 2), 2);
        assert_eq!(t.compute_tenuring_threshold(10_000, 15), 15);
        assert_eq!(t.total(), 120);
    }

    #[test]
    fn test_fixed_young_length() {
        let config = HeapConfig::default().with_young_list_target_length(6);
        let mut p = Policy::new(&config);
        p.update_young_list_target_length(10, 0, 16);
        assert_eq!(p.young_list_target_length(), 6);
        // 5% locker expansion rounds up to one region.
        assert_eq!(p.young_list_max_length(), 7);
        assert_eq!(p.max_survivor_regions(), 1);
        assert!(p.should_allocate_mutator_region(5));
        assert!(!p.should_allocate_mutator_region(6));
        assert!(p.can_expand_young_list(6));
    }

    #[test]
    fn test_adaptive_young_length_respects_free_space() {
        let mut p = policy();
        p.update_young_list_target_length(64, 0, 64);
        let roomy = p.young_list_target_length();
        assert!(roomy >= 4 && roomy <= 38, "target {roomy}");
        p.update_young_list_target_length(4, 0, 64);
        assert!(p.young_list_target_length() < roomy);
    }

    #[test]
    fn test_ihop() {
        let p = policy();
        let cap = 100 * 1024 * 1024;
        assert!(!p.need_to_start_conc_mark(10 * 1024 * 1024, 0, cap, false));
        assert!(p.need_to_start_conc_mark(40 * 1024 * 1024, 10 * 1024 * 1024, cap, false));
        assert!(!p.need_to_start_conc_mark(90 * 1024 * 1024, 0, cap, true));
    }

    #[test]
    fn test_initial_mark_decision_is_one_shot() {
        let mut p = policy();
        assert!(!p.decide_on_conc_mark_initiation(false));
        p.set_initiate_conc_mark_if_possible();
        assert!(!p.decide_on_conc_mark_initiation(true));
        assert!(p.initiate_conc_mark_if_possible());
        assert!(p.decide_on_conc_mark_initiation(false));
        assert_eq!(p.pause_kind(), PauseKind::InitialMark);
        assert!(!p.decide_on_conc_mark_initiation(false));
    }

    #[test]
    fn test_record_pause_updates_costs() {
        let mut p = policy();
        let mut record = PauseRecord::default();
        record.metrics.kind = PauseKind::Young;
        record.metrics.duration = Duration::from_millis(10);
        record.metrics.evacuate_time = Duration::from_millis(8);
        record.metrics.totals.bytes_copied = 8 * 1024 * 1024;
        record.metrics.eden_regions = 4;
        record.young_bytes = 4 * 1024 * 1024;
        record.surviving_young_bytes = 1024 * 1024;
        p.record_pause(&record, 1000, &CollectionSetChooser::new(), 1 << 30);
        let per_byte = 8.0 / (8.0 * 1024.0 * 1024.0);
        assert!((p.cost_per_byte_ms.davg() - per_byte).abs() < 1e-12);
        assert!((p.survival_rate.davg() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_no_expansion_without_overhead_history() {
        let p = policy();
        assert_eq!(p.expansion_amount(16 << 20, 48 << 20), 0);
    }
}
