//! Block offset table.
//!
//! For every card of an old or humongous region the table records how many
//! words lie between the card's first word and the start of the block that
//! covers it. A block is either one object or a copy buffer that is filled
//! with objects. Card scanning uses it to find a parse start for a card
//! without walking the region from its bottom.

use std::sync::atomic::{AtomicU32, Ordering};

use super::card_table::{CARD_SHIFT, CARD_SIZE};
use crate::object::WORD_SIZE;

/// Per-region block offsets.
pub struct BlockOffsetTable {
    offsets: Box<[AtomicU32]>,
}

impl BlockOffsetTable {
    /// A table for a region of `cards` cards with every card at offset zero.
    pub fn new(cards: usize) -> Self {
        Self {
            offsets: (0..cards).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Record a block `[start, end)` of a region starting at `bottom`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn record_block(&self, bottom: usize, start: usize, end: usize) {
        debug_assert!(bottom <= start && start < end);
        let first = (start - bottom).div_ceil(CARD_SIZE);
        let last = (end - 1 - bottom) >> CARD_SHIFT;
        for card in first..=last.min(self.offsets.len() - 1) {
            let card_start = bottom + (card << CARD_SHIFT);
            let words = (card_start - start) / WORD_SIZE;
            self.offsets[card].store(words as u32, Ordering::Relaxed);
        }
    }

    /// Start of the block covering the first word of the card containing
    /// `addr`.
    pub fn block_start(&self, bottom: usize, addr: usize) -> usize {
        let card = (addr - bottom) >> CARD_SHIFT;
        let card_start = bottom + (card << CARD_SHIFT);
        card_start - self.offsets[card].load(Ordering::Relaxed) as usize * WORD_SIZE
    }

    /// Forget every block.
    pub fn reset(&self) {
        for off in &*self.offsets {
            off.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTTOM: usize = 0x10_0000;

    #[test]
    fn test_block_spanning_cards() {
        let bot = BlockOffsetTable::new(8);
        // Block starts mid card 0 and runs into card 3.
        let start = BOTTOM + 128;
        let end = BOTTOM + 3 * CARD_SIZE + 64;
        bot.record_block(BOTTOM, BOTTOM, start);
        bot.record_block(BOTTOM, start, end);
        assert_eq!(bot.block_start(BOTTOM, BOTTOM + 8), BOTTOM);
        assert_eq!(bot.block_start(BOTTOM, BOTTOM + CARD_SIZE + 16), start);
        assert_eq!(bot.block_start(BOTTOM, BOTTOM + 3 * CARD_SIZE), start);
    }

    #[test]
    fn test_card_aligned_block() {
        let bot = BlockOffsetTable::new(4);
        bot.record_block(BOTTOM, BOTTOM, BOTTOM + CARD_SIZE);
        bot.record_block(BOTTOM, BOTTOM + CARD_SIZE, BOTTOM + 2 * CARD_SIZE + 8);
        assert_eq!(bot.block_start(BOTTOM, BOTTOM + CARD_SIZE + 40), BOTTOM + CARD_SIZE);
        assert_eq!(
            bot.block_start(BOTTOM, BOTTOM + 2 * CARD_SIZE),
            BOTTOM + CARD_SIZE
        );
        bot.reset();
        assert_eq!(
            bot.block_start(BOTTOM, BOTTOM + 2 * CARD_SIZE),
            BOTTOM + 2 * CARD_SIZE
        );
    }
}
