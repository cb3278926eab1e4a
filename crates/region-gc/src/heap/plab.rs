//! Per-worker promotion-local allocation buffers.

use crate::object::{raw, MIN_OBJECT_WORDS, WORD_SIZE};

/// A bump buffer carved out of a GC allocation region.
///
/// Owned by one pause worker, so nothing here is atomic.
#[derive(Debug, Default)]
pub struct Plab {
    bottom: usize,
    top: usize,
    end: usize,
    allocated_words: usize,
    wasted_words: usize,
    undo_wasted_words: usize,
}

impl Plab {
    pub const fn new() -> Self {
        Self {
            bottom: 0,
            top: 0,
            end: 0,
            allocated_words: 0,
            wasted_words: 0,
            undo_wasted_words: 0,
        }
    }

    /// Start using `[start, start + words)`.
    pub fn set_buf(&mut self, start: usize, words: usize) {
        debug_assert_eq!(self.top, self.end, "previous buffer not retired");
        self.bottom = start;
        self.top = start;
        self.end = start + words * WORD_SIZE;
        self.allocated_words += words;
    }

    pub fn allocate(&mut self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        if self.end - self.top < bytes {
            return None;
        }
        let obj = self.top;
        self.top += bytes;
        Some(obj)
    }

    pub const fn contains(&self, addr: usize) -> bool {
        self.bottom <= addr && addr < self.end
    }

    pub const fn free_words(&self) -> usize {
        (self.end - self.top) / WORD_SIZE
    }

    /// Give back `[addr, addr + words)`. The space is retracted if it was the
    /// last allocation, otherwise it is covered with a filler and counted as
    /// undo waste.
    pub fn undo_allocation(&mut self, addr: usize, words: usize) {
        debug_assert!(self.contains(addr));
        if addr + words * WORD_SIZE == self.top {
            self.top = addr;
        } else {
            // SAFETY: the range was handed out by this buffer and never
            // published.
            unsafe { raw::fill(addr, words) };
            self.undo_wasted_words += words;
        }
    }

    /// Fill the unused tail and forget the buffer. Returns the wasted words.
    pub fn retire(&mut self) -> usize {
        let words = self.free_words();
        if words > 0 {
            debug_assert!(words >= MIN_OBJECT_WORDS);
            // SAFETY: the tail belongs to this buffer.
            unsafe { raw::fill(self.top, words) };
            self.wasted_words += words;
        }
        self.bottom = 0;
        self.top = 0;
        self.end = 0;
        words
    }

    pub const fn allocated_words(&self) -> usize {
        self.allocated_words
    }

    pub const fn wasted_words(&self) -> usize {
        self.wasted_words
    }

    pub const fn undo_wasted_words(&self) -> usize {
        self.undo_wasted_words
    }
}
