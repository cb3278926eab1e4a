//! Collection set and old region candidates.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;

use crate::heap::region::HeapRegion;

/// Regions chosen for the current pause.
///
/// The young part is built incrementally: every eden region joins when the
/// mutator retires it and survivors join at the end of the pause that
/// produced them. Finalization moves that incremental part into the pause
/// collection set and appends old regions picked by the policy.
#[derive(Debug, Default)]
pub struct CollectionSet {
    regions: Vec<u32>,
    eden_len: usize,
    survivor_len: usize,
    old_len: usize,
    inc_regions: Vec<u32>,
    inc_bytes: usize,
    inc_predicted_ms: f64,
    inc_active: bool,
    predicted_ms: f64,
}

impl CollectionSet {
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            eden_len: 0,
            survivor_len: 0,
            old_len: 0,
            inc_regions: Vec::new(),
            inc_bytes: 0,
            inc_predicted_ms: 0.0,
            inc_active: false,
            predicted_ms: 0.0,
        }
    }

    /// Open a new incremental young collection set.
    pub fn start_incremental_building(&mut self) {
        debug_assert!(self.inc_regions.is_empty());
        self.inc_bytes = 0;
        self.inc_predicted_ms = 0.0;
        self.inc_active = true;
    }

    pub fn stop_incremental_building(&mut self) {
        self.inc_active = false;
    }

    pub const fn is_incremental_active(&self) -> bool {
        self.inc_active
    }

    /// Add a retired eden region or a fresh survivor region.
    pub fn add_young_region(&mut self, region: &HeapRegion, predicted_ms: f64) {
        debug_assert!(region.is_young());
        debug_assert!(self.inc_active, "incremental collection set not open");
        self.inc_regions.push(region.index());
        self.inc_bytes += region.used();
        self.inc_predicted_ms += predicted_ms;
    }

    /// Regions in the incremental part.
    pub fn inc_len(&self) -> usize {
        self.inc_regions.len()
    }

    pub const fn inc_bytes(&self) -> usize {
        self.inc_bytes
    }

    pub const fn inc_predicted_ms(&self) -> f64 {
        self.inc_predicted_ms
    }

    /// Turn the incremental part into the pause collection set. Every young
    /// region is flagged in the collection set and numbered.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn finalize_young(&mut self, regions: &[HeapRegion]) -> f64 {
        debug_assert!(self.regions.is_empty(), "previous collection set not freed");
        self.stop_incremental_building();
        self.regions = std::mem::take(&mut self.inc_regions);
        self.eden_len = 0;
        self.survivor_len = 0;
        for (i, &index) in self.regions.iter().enumerate() {
            let r = &regions[index as usize];
            if r.kind() == crate::heap::region::RegionKind::Survivor {
                self.survivor_len += 1;
            } else {
                self.eden_len += 1;
            }
            r.set_in_collection_set(true);
            r.set_young_index_in_cset(i as i32);
        }
        self.predicted_ms = self.inc_predicted_ms;
        self.inc_predicted_ms = 0.0;
        self.inc_bytes = 0;
        self.predicted_ms
    }

    /// Append an old region picked for a mixed pause.
    pub fn add_old_region(&mut self, region: &HeapRegion, predicted_ms: f64) {
        debug_assert!(!region.in_collection_set());
        region.set_in_collection_set(true);
        self.regions.push(region.index());
        self.old_len += 1;
        self.predicted_ms += predicted_ms;
    }

    /// Regions of the current pause, young first.
    pub fn regions(&self) -> &[u32] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub const fn eden_len(&self) -> usize {
        self.eden_len
    }

    pub const fn survivor_len(&self) -> usize {
        self.survivor_len
    }

    pub const fn old_len(&self) -> usize {
        self.old_len
    }

    pub const fn predicted_ms(&self) -> f64 {
        self.predicted_ms
    }

    /// Hand the pause collection set to the caller and close it.
    pub fn take(&mut self) -> Vec<u32> {
        self.eden_len = 0;
        self.survivor_len = 0;
        self.old_len = 0;
        self.predicted_ms = 0.0;
        std::mem::take(&mut self.regions)
    }

    /// Drop the incremental part, clearing membership flags. Used by full
    /// collections, which rebuild the young generation from scratch.
    pub fn abandon(&mut self, regions: &[HeapRegion]) {
        for &i in self.regions.iter().chain(&self.inc_regions) {
            let r = &regions[i as usize];
            r.set_in_collection_set(false);
            r.set_young_index_in_cset(-1);
        }
        self.take();
        self.inc_regions.clear();
        self.inc_bytes = 0;
        self.inc_predicted_ms = 0.0;
    }
}

/// An old region worth collecting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Region index.
    pub index: u32,
    /// Reclaimable bytes.
    pub garbage: usize,
    /// Predicted evacuation cost.
    pub predicted_ms: f64,
    /// Garbage bytes per predicted millisecond.
    pub efficiency: f64,
}

impl Candidate {
    #[allow(clippy::cast_precision_loss)]
    pub fn new(index: u32, garbage: usize, predicted_ms: f64) -> Self {
        Self {
            index,
            garbage,
            predicted_ms,
            efficiency: garbage as f64 / predicted_ms.max(f64::MIN_POSITIVE),
        }
    }

    /// Most efficient first, then most garbage, then lowest index.
    fn order(a: &Self, b: &Self) -> CmpOrdering {
        b.efficiency
            .total_cmp(&a.efficiency)
            .then_with(|| b.garbage.cmp(&a.garbage))
            .then_with(|| a.index.cmp(&b.index))
    }
}

/// Old regions ranked by marking, consumed by mixed pauses.
#[derive(Debug, Default)]
pub struct CollectionSetChooser {
    candidates: VecDeque<Candidate>,
    reclaimable_bytes: usize,
}

impl CollectionSetChooser {
    pub const fn new() -> Self {
        Self {
            candidates: VecDeque::new(),
            reclaimable_bytes: 0,
        }
    }

    /// Replace the candidate list.
    pub fn build(&mut self, mut candidates: Vec<Candidate>) {
        candidates.sort_by(Candidate::order);
        self.reclaimable_bytes = candidates.iter().map(|c| c.garbage).sum();
        self.candidates = candidates.into();
    }

    /// Best remaining candidate.
    pub fn peek(&self) -> Option<Candidate> {
        self.candidates.front().copied()
    }

    pub fn pop(&mut self) -> Option<Candidate> {
        let c = self.candidates.pop_front()?;
        self.reclaimable_bytes -= c.garbage;
        Some(c)
    }

    /// Drop a region that stopped being a candidate (freed, or collected by
    /// a full GC).
    pub fn remove(&mut self, index: u32) {
        if let Some(pos) = self.candidates.iter().position(|c| c.index == index) {
            if let Some(c) = self.candidates.remove(pos) {
                self.reclaimable_bytes -= c.garbage;
            }
        }
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
        self.reclaimable_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub const fn remaining_reclaimable_bytes(&self) -> usize {
        self.reclaimable_bytes
    }

    /// Candidate indices in order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.candidates.iter().map(|c| c.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WORD_SIZE;

    #[test]
    fn test_chooser_ordering_is_deterministic() {
        let mut chooser = CollectionSetChooser::new();
        chooser.build(vec![
            Candidate::new(7, 1000, 1.0),
            Candidate::new(3, 1000, 1.0),
            Candidate::new(5, 4000, 1.0),
            Candidate::new(9, 2000, 2.0),
            Candidate::new(1, 3000, 1.5),
        ]);
        // Efficiency 4000, 2000, 1000 (garbage 2000 beats 1000), then
        // index 3 before 7.
        assert_eq!(chooser.iter().collect::<Vec<_>>(), vec![5, 1, 9, 3, 7]);
        assert_eq!(chooser.remaining_reclaimable_bytes(), 11_000);
        assert_eq!(chooser.pop().map(|c| c.index), Some(5));
        chooser.remove(9);
        assert_eq!(chooser.remaining_reclaimable_bytes(), 5000);
        assert_eq!(chooser.len(), 3);
    }

    #[test]
    fn test_finalize_young_flags_regions() {
        let words = 512;
        let mut store = vec![0usize; 3 * words];
        let base = store.as_mut_ptr() as usize;
        let regions: Vec<_> = (0..3)
            .map(|i| {
                HeapRegion::new(i, base + i as usize * words * WORD_SIZE, words * WORD_SIZE, 3, 8)
            })
            .collect();
        regions[0].set_eden();
        regions[2].set_survivor();

        let mut cset = CollectionSet::new();
        cset.start_incremental_building();
        cset.add_young_region(&regions[0], 1.0);
        cset.add_young_region(&regions[2], 2.0);
        assert_eq!(cset.inc_len(), 2);
        let predicted = cset.finalize_young(&regions);
        assert!((predicted - 3.0).abs() < f64::EPSILON);
        assert_eq!(cset.eden_len(), 1);
        assert_eq!(cset.survivor_len(), 1);
        assert!(regions[0].in_collection_set());
        assert!(!regions[1].in_collection_set());
        assert_eq!(regions[2].young_index_in_cset(), 1);

        regions[1].set_old();
        cset.add_old_region(&regions[1], 0.5);
        assert_eq!(cset.regions(), &[0, 2, 1]);
        assert_eq!(cset.take(), vec![0, 2, 1]);
        assert!(cset.is_empty());
        assert_eq!(cset.old_len(), 0);
    }
}
