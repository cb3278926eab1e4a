//! Eden and survivor region lists.

use super::region::{HeapRegion, Membership, RegionKind};

/// Young regions in allocation order.
///
/// Eden regions are appended as the mutator takes them; survivors are
/// the regions filled by the last pause. Both are rebuilt every pause.
#[derive(Debug, Default)]
pub struct YoungList {
    eden: Vec<u32>,
    survivors: Vec<u32>,
    length: usize,
    survivor_length: usize,
}

impl YoungList {
    pub const fn new() -> Self {
        Self {
            eden: Vec::new(),
            survivors: Vec::new(),
            length: 0,
            survivor_length: 0,
        }
    }

    /// Eden plus survivor regions.
    pub const fn length(&self) -> usize {
        self.length
    }

    /// Survivor regions.
    pub const fn survivor_length(&self) -> usize {
        self.survivor_length
    }

    /// Eden regions.
    pub const fn eden_length(&self) -> usize {
        self.length - self.survivor_length
    }

    /// Whether there is no young region at all.
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Eden indices, oldest first.
    pub fn eden(&self) -> &[u32] {
        &self.eden
    }

    /// Survivor indices.
    pub fn survivors(&self) -> &[u32] {
        &self.survivors
    }

    /// Append an eden region.
    pub fn push_eden(&mut self, region: &HeapRegion) {
        debug_assert_eq!(region.kind(), RegionKind::Eden);
        debug_assert_eq!(region.membership(), Membership::None);
        region.set_membership(Membership::Young);
        self.eden.push(region.index());
        self.length += 1;
    }

    /// Record a region filled with survivors by the current pause.
    pub fn add_survivor(&mut self, region: &HeapRegion) {
        debug_assert_eq!(region.kind(), RegionKind::Survivor);
        debug_assert_eq!(region.membership(), Membership::None);
        region.set_membership(Membership::Young);
        self.survivors.push(region.index());
        self.length += 1;
        self.survivor_length += 1;
    }

    /// Drop every region from the list, untagging them. Returns the former
    /// eden and survivor lists.
    pub fn take_all(&mut self, regions: &[HeapRegion]) -> (Vec<u32>, Vec<u32>) {
        for &i in self.eden.iter().chain(&self.survivors) {
            regions[i as usize].set_membership(Membership::None);
        }
        self.length = 0;
        self.survivor_length = 0;
        (std::mem::take(&mut self.eden), std::mem::take(&mut self.survivors))
    }

    /// Check that the tracked lengths match the lists and every listed
    /// region is young and tagged as such.
    ///
    /// # Errors
    ///
    /// Describes the first inconsistency.
    pub fn check_list_consistency(&self, regions: &[HeapRegion]) -> Result<(), String> {
        if self.eden.len() + self.survivors.len() != self.length {
            return Err(format!(
                "young list length {} but {} regions listed",
                self.length,
                self.eden.len() + self.survivors.len()
            ));
        }
        if self.survivors.len() != self.survivor_length {
            return Err(format!(
                "survivor length {} but {} survivors listed",
                self.survivor_length,
                self.survivors.len()
            ));
        }
        for (list, kind) in [(&self.eden, RegionKind::Eden), (&self.survivors, RegionKind::Survivor)] {
            for &i in list {
                let r = &regions[i as usize];
                if r.kind() != kind || r.membership() != Membership::Young {
                    return Err(format!(
                        "young list region {i} is {:?} tagged {:?}",
                        r.kind(),
                        r.membership()
                    ));
                }
            }
        }
        let tagged = regions
            .iter()
            .filter(|r| r.membership() == Membership::Young)
            .count();
        if tagged != self.length {
            return Err(format!(
                "{tagged} regions tagged young but young list length is {}",
                self.length
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WORD_SIZE;

    #[test]
    fn test_lengths_track_lists() {
        let mut store = vec![0usize; 4 * 512];
        let base = store.as_mut_ptr() as usize;
        let rs: Vec<_> = (0..4)
            .map(|i| HeapRegion::new(i, base + i as usize * 4096, 512 * WORD_SIZE, 4, 8))
            .collect();
        let mut young = YoungList::new();
        rs[0].set_eden();
        rs[1].set_eden();
        rs[2].set_survivor();
        young.push_eden(&rs[0]);
        young.push_eden(&rs[1]);
        young.add_survivor(&rs[2]);
        assert_eq!(young.length(), 3);
        assert_eq!(young.eden_length(), 2);
        assert_eq!(young.survivor_length(), 1);
        young.check_list_consistency(&rs).unwrap();

        rs[3].set_membership(Membership::Young);
        assert!(young.check_list_consistency(&rs).is_err());
        rs[3].set_membership(Membership::None);

        let (eden, survivors) = young.take_all(&rs);
        assert_eq!(eden, vec![0, 1]);
        assert_eq!(survivors, vec![2]);
        assert!(young.is_empty());
        young.check_list_consistency(&rs).unwrap();
    }
}
