//! Card table.
//!
//! One byte per [`CARD_SIZE`] bytes of reserved heap. Mutator write
//! barriers move a card from clean to dirty and enqueue it; refinement moves
//! it back to clean before scanning. During a pause, remembered set
//! scanning claims cards so each one is scanned by one worker.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU8, Ordering};

/// log2 of the card size.
pub const CARD_SHIFT: u32 = 9;
/// Bytes covered by one card.
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;
/// Words covered by one card.
pub const CARD_WORDS: usize = CARD_SIZE / crate::object::WORD_SIZE;

/// State of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardState {
    /// Not written since it was last scanned.
    Clean = 0,
    /// Written and queued for refinement.
    Dirty = 1,
    /// Scanned by a pause worker.
    Claimed = 2,
}

impl CardState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Dirty,
            2 => Self::Claimed,
            _ => Self::Clean,
        }
    }
}

/// Card states for the whole reserved heap.
pub struct CardTable {
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// A table of `num_cards` clean cards.
    pub fn new(num_cards: usize) -> Self {
        Self {
            cards: (0..num_cards).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Number of cards.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Current state of `card`.
    pub fn state(&self, card: usize) -> CardState {
        CardState::from_u8(self.cards[card].load(Ordering::Acquire))
    }

    /// Whether `card` is clean.
    pub fn is_clean(&self, card: usize) -> bool {
        self.state(card) == CardState::Clean
    }

    /// Move `card` from clean to dirty. Returns `true` if this call did the
    /// transition and the caller must enqueue the card.
    pub fn mark_dirty(&self, card: usize) -> bool {
        self.cards[card]
            .compare_exchange(
                CardState::Clean as u8,
                CardState::Dirty as u8,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Mark `card` clean ahead of scanning it. Sequentially consistent so a
    /// racing barrier either sees the clean card and re-dirties it, or its
    /// store is visible to the scan that follows.
    pub fn clean(&self, card: usize) {
        self.cards[card].store(CardState::Clean as u8, Ordering::SeqCst);
    }

    /// Claim `card` for scanning in a pause. Returns `false` if another
    /// worker already has it.
    pub fn claim(&self, card: usize) -> bool {
        self.cards[card]
            .compare_exchange(
                CardState::Clean as u8,
                CardState::Claimed as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Reset `count` cards starting at `first` to clean.
    pub fn clear_range(&self, first: usize, count: usize) {
        for card in &self.cards[first..first + count] {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }

    /// Reset every card to clean.
    pub fn clear_all(&self) {
        self.clear_range(0, self.cards.len());
    }

    /// Count cards in `state` within `[first, first + count)`.
    pub fn count_in_range(&self, first: usize, count: usize, state: CardState) -> usize {
        self.cards[first..first + count]
            .iter()
            .filter(|c| CardState::from_u8(c.load(Ordering::Relaxed)) == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_transition_once() {
        let table = CardTable::new(8);
        assert!(table.mark_dirty(3));
        assert!(!table.mark_dirty(3));
        assert_eq!(table.state(3), CardState::Dirty);
        table.clean(3);
        assert!(table.is_clean(3));
        assert!(table.mark_dirty(3));
    }

    #[test]
    fn test_claim_only_clean() {
        let table = CardTable::new(4);
        assert!(table.claim(0));
        assert!(!table.claim(0));
        assert!(table.mark_dirty(1));
        assert!(!table.claim(1));
        assert_eq!(table.count_in_range(0, 4, CardState::Claimed), 1);
        table.clear_range(0, 2);
        assert_eq!(table.count_in_range(0, 4, CardState::Clean), 4);
    }
}
