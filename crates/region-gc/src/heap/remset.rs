//! Remembered sets.
//!
//! A [`RemSet`] belongs to one target region and records, per source region,
//! which cards of the source may hold a reference into the target. Cards are
//! added concurrently by refinement threads, pause workers and the write
//! barrier's refinement without locks: a per-source bitmap is installed on
//! first use with a compare-and-swap and bits are set with `fetch_or`.
//! Recording the same card twice is harmless.
//!
//! Bitmaps are only freed when the remembered set itself is dropped.
//! Clearing zeroes them in place, so readers never see freed memory.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

struct CardBits {
    words: Box<[AtomicU64]>,
}

impl CardBits {
    fn new(cards: usize) -> Self {
        Self {
            words: (0..cards.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

/// Per-region remembered set.
pub struct RemSet {
    from: Box<[AtomicPtr<CardBits>]>,
    cards_per_region: usize,
    occupied: AtomicUsize,
}

impl RemSet {
    /// A remembered set able to record cards from `regions` source regions
    /// of `cards_per_region` cards each.
    pub fn new(regions: usize, cards_per_region: usize) -> Self {
        Self {
            from: (0..regions).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            cards_per_region,
            occupied: AtomicUsize::new(0),
        }
    }

    fn bits_for(&self, from: u32) -> &CardBits {
        let slot = &self.from[from as usize];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            // SAFETY: installed bitmaps live until `self` is dropped.
            return unsafe { &*existing };
        }
        let fresh = Box::into_raw(Box::new(CardBits::new(self.cards_per_region)));
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            // SAFETY: we just installed `fresh`; see above for lifetime.
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: the winner's bitmap lives until `self` is dropped.
                unsafe { &*winner }
            }
        }
    }

    fn installed(&self, from: u32) -> Option<&CardBits> {
        let p = self.from[from as usize].load(Ordering::Acquire);
        // SAFETY: installed bitmaps live until `self` is dropped.
        (!p.is_null()).then(|| unsafe { &*p })
    }

    /// Record that card `card` of region `from` may point into this region.
    /// Returns `true` if the card was not recorded before.
    pub fn add_card(&self, from: u32, card: usize) -> bool {
        debug_assert!(card < self.cards_per_region, "card {card} out of range");
        let bits = self.bits_for(from);
        let mask = 1u64 << (card % 64);
        let prev = bits.words[card / 64].fetch_or(mask, Ordering::AcqRel);
        let added = prev & mask == 0;
        if added {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        added
    }

    /// Whether card `card` of region `from` is recorded.
    pub fn contains(&self, from: u32, card: usize) -> bool {
        self.installed(from).is_some_and(|bits| {
            bits.words[card / 64].load(Ordering::Acquire) & (1 << (card % 64)) != 0
        })
    }

    /// Approximate number of recorded cards.
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    /// Whether no card is recorded.
    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Source regions with at least one recorded card.
    #[allow(clippy::cast_possible_truncation)]
    pub fn source_regions(&self) -> Vec<u32> {
        (0..self.from.len() as u32)
            .filter(|&r| {
                self.installed(r)
                    .is_some_and(|bits| bits.words.iter().any(|w| w.load(Ordering::Acquire) != 0))
            })
            .collect()
    }

    /// Call `f` with every card recorded for source region `from`.
    pub fn for_each_card_from(&self, from: u32, mut f: impl FnMut(usize)) {
        let Some(bits) = self.installed(from) else {
            return;
        };
        for (i, word) in bits.words.iter().enumerate() {
            let mut w = word.load(Ordering::Acquire);
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                f(i * 64 + bit);
                w &= w - 1;
            }
        }
    }

    /// Drop every recorded card. Bitmaps stay installed.
    pub fn clear(&self) {
        for slot in &*self.from {
            let p = slot.load(Ordering::Acquire);
            if !p.is_null() {
                // SAFETY: installed bitmaps live until `self` is dropped.
                for w in &*unsafe { &*p }.words {
                    w.store(0, Ordering::Relaxed);
                }
            }
        }
        self.occupied.store(0, Ordering::Relaxed);
    }
}

impl Drop for RemSet {
    fn drop(&mut self) {
        for slot in &mut *self.from {
            let p = *slot.get_mut();
            if !p.is_null() {
                // SAFETY: unique access; each bitmap was created by Box::into_raw.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_and_iterate() {
        let rs = RemSet::new(4, 128);
        assert!(rs.is_empty());
        assert!(rs.add_card(2, 5));
        assert!(!rs.add_card(2, 5));
        assert!(rs.add_card(2, 127));
        assert!(rs.add_card(0, 64));
        assert_eq!(rs.occupied(), 3);
        assert_eq!(rs.source_regions(), vec![0, 2]);

        let mut cards = Vec::new();
        rs.for_each_card_from(2, |c| cards.push(c));
        assert_eq!(cards, vec![5, 127]);
        assert!(rs.contains(0, 64));
        assert!(!rs.contains(1, 64));
    }

    #[test]
    fn test_clear_keeps_bitmaps_usable() {
        let rs = RemSet::new(2, 64);
        rs.add_card(1, 3);
        rs.clear();
        assert!(rs.is_empty());
        assert!(!rs.contains(1, 3));
        assert!(rs.source_regions().is_empty());
        assert!(rs.add_card(1, 3));
    }

    #[test]
    fn test_concurrent_adds_count_each_card_once() {
        let rs = Arc::new(RemSet::new(2, 512));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rs = Arc::clone(&rs);
                std::thread::spawn(move || {
                    for card in 0..512 {
                        rs.add_card(1, card);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rs.occupied(), 512);
    }
}
