//! Object layout understood by the collector.
//!
//! Every object starts with two words:
//!
//! ```text
//! +------------+------------+----------------+--------------+
//! | header     | descriptor | reference slots | data words  |
//! +------------+------------+----------------+--------------+
//! ```
//!
//! The header is a [`HeaderState`]: either a [`MarkWord`] carrying the
//! object's age, hash and lock bit, or a forwarding address installed while
//! the object is being evacuated. The descriptor is an [`ObjectShape`] and
//! tells the collector the object's size and where its reference slots are.
//! Object sizes are rounded up to [`OBJECT_ALIGNMENT_WORDS`] so any hole
//! between objects can always be covered by a filler.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes per heap word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
/// log2 of [`WORD_SIZE`].
pub const LOG_WORD_SIZE: u32 = WORD_SIZE.trailing_zeros();
/// Words taken by the header and the descriptor.
pub const HEADER_WORDS: usize = 2;
/// Every object size is a multiple of this many words.
pub const OBJECT_ALIGNMENT_WORDS: usize = 2;
/// Smallest possible object (and filler).
pub const MIN_OBJECT_WORDS: usize = HEADER_WORDS;

/// Round `words` up to the object alignment.
#[must_use]
pub const fn align_object_words(words: usize) -> usize {
    (words + OBJECT_ALIGNMENT_WORDS - 1) & !(OBJECT_ALIGNMENT_WORDS - 1)
}

// ============================================================================
// Mark word
// ============================================================================

/// Object metadata stored in the header when the object is not forwarded.
///
/// Layout (low to high): 2 tag bits (`01`), 1 lock bit, 4 age bits,
/// 25 hash bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkWord(usize);

impl MarkWord {
    const TAG: usize = 0b01;
    const LOCK_BIT: usize = 1 << 2;
    const AGE_SHIFT: u32 = 3;
    const AGE_MASK: usize = 0xF;
    const HASH_SHIFT: u32 = 7;
    const HASH_MASK: usize = (1 << 25) - 1;

    /// Largest age a mark word can record.
    pub const MAX_AGE: u32 = 15;

    /// Mark of a freshly allocated object: unlocked, age 0, no hash.
    pub const PROTOTYPE: Self = Self(Self::TAG);

    const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// Raw header bits.
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// Number of pauses this object has survived in young regions.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn age(self) -> u32 {
        ((self.0 >> Self::AGE_SHIFT) & Self::AGE_MASK) as u32
    }

    /// Returns this mark with the age replaced (saturating at [`Self::MAX_AGE`]).
    #[must_use]
    pub const fn with_age(self, age: u32) -> Self {
        let age = if age > Self::MAX_AGE { Self::MAX_AGE } else { age } as usize;
        Self((self.0 & !(Self::AGE_MASK << Self::AGE_SHIFT)) | (age << Self::AGE_SHIFT))
    }

    /// Returns this mark with the age bumped by one.
    #[must_use]
    pub const fn incr_age(self) -> Self {
        self.with_age(self.age() + 1)
    }

    /// Identity hash, zero if none has been assigned.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn hash(self) -> u32 {
        ((self.0 >> Self::HASH_SHIFT) & Self::HASH_MASK) as u32
    }

    /// Returns this mark with the identity hash set (truncated to 25 bits).
    #[must_use]
    pub const fn with_hash(self, hash: u32) -> Self {
        let hash = (hash as usize) & Self::HASH_MASK;
        Self((self.0 & !(Self::HASH_MASK << Self::HASH_SHIFT)) | (hash << Self::HASH_SHIFT))
    }

    /// Whether the lock bit is set.
    #[must_use]
    pub const fn is_locked(self) -> bool {
        self.0 & Self::LOCK_BIT != 0
    }

    /// Returns this mark with the lock bit set or cleared.
    #[must_use]
    pub const fn with_locked(self, locked: bool) -> Self {
        if locked {
            Self(self.0 | Self::LOCK_BIT)
        } else {
            Self(self.0 & !Self::LOCK_BIT)
        }
    }

    /// Whether this is exactly the prototype mark.
    #[must_use]
    pub const fn is_prototype(self) -> bool {
        self.0 == Self::PROTOTYPE.0
    }

    /// A non-prototype mark cannot be rebuilt after the header slot has
    /// been overwritten by a self-forwarding pointer, so it must be saved.
    #[must_use]
    pub const fn must_be_preserved(self) -> bool {
        !self.is_prototype()
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkWord")
            .field("age", &self.age())
            .field("hash", &self.hash())
            .field("locked", &self.is_locked())
            .finish()
    }
}

// ============================================================================
// Header
// ============================================================================

/// Decoded contents of an object's header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// All-zero header: space has been handed out but the object is not
    /// initialized yet. Concurrent readers must back off.
    Uninitialized,
    /// Ordinary object metadata.
    Normal(MarkWord),
    /// The object has been evacuated to the given address. A forwarding
    /// address equal to the object's own address marks a failed evacuation.
    Forwarded(usize),
}

impl HeaderState {
    const FORWARDED_TAG: usize = 0b11;
    const TAG_MASK: usize = 0b11;

    /// Decode a raw header word.
    #[must_use]
    pub const fn decode(word: usize) -> Self {
        if word == 0 {
            Self::Uninitialized
        } else if word & Self::TAG_MASK == Self::FORWARDED_TAG {
            Self::Forwarded(word & !Self::TAG_MASK)
        } else {
            Self::Normal(MarkWord::from_bits(word))
        }
    }

    /// Encode into a raw header word.
    #[must_use]
    pub const fn encode(self) -> usize {
        match self {
            Self::Uninitialized => 0,
            Self::Normal(mark) => mark.bits(),
            Self::Forwarded(addr) => addr | Self::FORWARDED_TAG,
        }
    }
}

// ============================================================================
// Shape (descriptor word)
// ============================================================================

/// Strength of a reference object's referent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStrength {
    /// Kept alive by pauses unless soft references are being cleared.
    Soft,
    /// Cleared as soon as the referent is not otherwise reachable.
    Weak,
}

/// Layout descriptor stored in an object's second word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectShape {
    /// Dead space of the given total size in words.
    Filler {
        /// Total size including the two header words.
        words: usize,
    },
    /// `refs` reference slots followed by `data` uninterpreted words.
    Plain {
        /// Number of reference slots.
        refs: u32,
        /// Number of data words.
        data: u32,
    },
    /// An array of `len` reference slots.
    RefArray {
        /// Element count.
        len: usize,
    },
    /// A reference object: slot 0 is the referent, followed by `data` words.
    Reference {
        /// Referent strength.
        strength: ReferenceStrength,
        /// Number of data words.
        data: u32,
    },
}

impl ObjectShape {
    const KIND_MASK: usize = 0b11;
    const KIND_FILLER: usize = 0;
    const KIND_PLAIN: usize = 1;
    const KIND_ARRAY: usize = 2;
    const KIND_REFERENCE: usize = 3;
    const REFS_SHIFT: u32 = 2;
    const REFS_MASK: usize = (1 << 20) - 1;
    const DATA_SHIFT: u32 = 22;
    const DATA_MASK: usize = (1 << 32) - 1;
    const WEAK_BIT: usize = 1 << 2;

    /// Largest number of reference slots a plain object may declare.
    pub const MAX_PLAIN_REFS: u32 = (1 << 20) - 1;

    /// A plain object.
    #[must_use]
    pub const fn plain(refs: u32, data: u32) -> Self {
        Self::Plain { refs, data }
    }

    /// An array of references.
    #[must_use]
    pub const fn ref_array(len: usize) -> Self {
        Self::RefArray { len }
    }

    /// A weak reference object.
    #[must_use]
    pub const fn weak(data: u32) -> Self {
        Self::Reference {
            strength: ReferenceStrength::Weak,
            data,
        }
    }

    /// A soft reference object.
    #[must_use]
    pub const fn soft(data: u32) -> Self {
        Self::Reference {
            strength: ReferenceStrength::Soft,
            data,
        }
    }

    /// Total size in words, including header words and alignment padding.
    #[must_use]
    pub const fn size_words(self) -> usize {
        match self {
            Self::Filler { words } => words,
            Self::Plain { refs, data } => {
                align_object_words(HEADER_WORDS + refs as usize + data as usize)
            }
            Self::RefArray { len } => align_object_words(HEADER_WORDS + len),
            Self::Reference { data, .. } => align_object_words(HEADER_WORDS + 1 + data as usize),
        }
    }

    /// Number of reference slots, starting right after the header words.
    #[must_use]
    pub const fn ref_slots(self) -> usize {
        match self {
            Self::Filler { .. } => 0,
            Self::Plain { refs, .. } => refs as usize,
            Self::RefArray { len } => len,
            Self::Reference { .. } => 1,
        }
    }

    /// Number of data words following the reference slots.
    #[must_use]
    pub const fn data_words(self) -> usize {
        match self {
            Self::Filler { .. } | Self::RefArray { .. } => 0,
            Self::Plain { data, .. } | Self::Reference { data, .. } => data as usize,
        }
    }

    /// Whether this describes dead space.
    #[must_use]
    pub const fn is_filler(self) -> bool {
        matches!(self, Self::Filler { .. })
    }

    /// Encode into a descriptor word.
    #[must_use]
    pub const fn encode(self) -> usize {
        match self {
            Self::Filler { words } => (words << Self::REFS_SHIFT) | Self::KIND_FILLER,
            Self::Plain { refs, data } => {
                ((data as usize & Self::DATA_MASK) << Self::DATA_SHIFT)
                    | ((refs as usize & Self::REFS_MASK) << Self::REFS_SHIFT)
                    | Self::KIND_PLAIN
            }
            Self::RefArray { len } => (len << Self::REFS_SHIFT) | Self::KIND_ARRAY,
            Self::Reference { strength, data } => {
                let weak = match strength {
                    ReferenceStrength::Weak => Self::WEAK_BIT,
                    ReferenceStrength::Soft => 0,
                };
                ((data as usize & Self::DATA_MASK) << Self::DATA_SHIFT) | weak | Self::KIND_REFERENCE
            }
        }
    }

    /// Decode a descriptor word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word: usize) -> Self {
        match word & Self::KIND_MASK {
            Self::KIND_FILLER => Self::Filler {
                words: word >> Self::REFS_SHIFT,
            },
            Self::KIND_PLAIN => Self::Plain {
                refs: ((word >> Self::REFS_SHIFT) & Self::REFS_MASK) as u32,
                data: ((word >> Self::DATA_SHIFT) & Self::DATA_MASK) as u32,
            },
            Self::KIND_ARRAY => Self::RefArray {
                len: word >> Self::REFS_SHIFT,
            },
            _ => Self::Reference {
                strength: if word & Self::WEAK_BIT != 0 {
                    ReferenceStrength::Weak
                } else {
                    ReferenceStrength::Soft
                },
                data: ((word >> Self::DATA_SHIFT) & Self::DATA_MASK) as u32,
            },
        }
    }
}

// ============================================================================
// Object references
// ============================================================================

/// A mutator-visible reference to a heap object.
///
/// An `ObjectRef` is only valid until the next safepoint: objects move during
/// pauses. Each reference records the safepoint epoch it was produced in and
/// the heap rejects references from an older epoch. Keep long-lived
/// references in [`Root`](crate::Root)s or heap fields instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    addr: NonZeroUsize,
    epoch: u32,
}

impl ObjectRef {
    pub(crate) const fn new(addr: NonZeroUsize, epoch: u32) -> Self {
        Self { addr, epoch }
    }

    pub(crate) fn from_addr(addr: usize, epoch: u32) -> Option<Self> {
        NonZeroUsize::new(addr).map(|addr| Self::new(addr, epoch))
    }

    /// The object's current address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.addr.get()
    }

    pub(crate) const fn epoch(self) -> u32 {
        self.epoch
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x}@{})", self.addr, self.epoch)
    }
}

// ============================================================================
// Raw heap word access
// ============================================================================

/// Raw access to heap words and objects.
///
/// All functions take plain addresses. Callers guarantee the address is word
/// aligned and lies in committed heap memory for the duration of the access.
pub(crate) mod raw {
    use super::{HeaderState, MarkWord, ObjectShape, AtomicUsize, Ordering, WORD_SIZE};

    /// # Safety
    ///
    /// `addr` must be word aligned and inside committed heap memory that
    /// stays committed for `'a`.
    #[inline]
    pub unsafe fn word<'a>(addr: usize) -> &'a AtomicUsize {
        // SAFETY: AtomicUsize has the same layout as usize; the caller
        // guarantees alignment and validity.
        unsafe { &*(addr as *const AtomicUsize) }
    }

    /// # Safety
    ///
    /// See [`word`].
    #[inline]
    pub unsafe fn load(addr: usize) -> usize {
        unsafe { word(addr) }.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// See [`word`].
    #[inline]
    pub unsafe fn store(addr: usize, value: usize) {
        unsafe { word(addr) }.store(value, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// `obj` must be the start of an object or of reserved object space.
    #[inline]
    pub unsafe fn header(obj: usize) -> HeaderState {
        HeaderState::decode(unsafe { word(obj) }.load(Ordering::Acquire))
    }

    /// # Safety
    ///
    /// See [`header`].
    #[inline]
    pub unsafe fn set_header(obj: usize, state: HeaderState) {
        unsafe { word(obj) }.store(state.encode(), Ordering::Release);
    }

    /// Atomically replace `expected` with `new`. On failure returns the
    /// header that was found instead.
    ///
    /// # Safety
    ///
    /// See [`header`].
    #[inline]
    pub unsafe fn cas_header(
        obj: usize,
        expected: HeaderState,
        new: HeaderState,
    ) -> Result<(), HeaderState> {
        unsafe { word(obj) }
            .compare_exchange(
                expected.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(HeaderState::decode)
    }

    /// # Safety
    ///
    /// `obj` must be the start of an initialized object.
    #[inline]
    pub unsafe fn shape(obj: usize) -> ObjectShape {
        ObjectShape::decode(unsafe { load(obj + WORD_SIZE) })
    }

    /// # Safety
    ///
    /// See [`shape`].
    #[inline]
    pub unsafe fn set_shape(obj: usize, shape: ObjectShape) {
        unsafe { store(obj + WORD_SIZE, shape.encode()) };
    }

    /// Address of reference slot `index` of `obj`.
    #[inline]
    pub const fn slot_addr(obj: usize, index: usize) -> usize {
        obj + (super::HEADER_WORDS + index) * WORD_SIZE
    }

    /// # Safety
    ///
    /// See [`shape`].
    #[inline]
    pub unsafe fn size_words(obj: usize) -> usize {
        unsafe { shape(obj) }.size_words()
    }

    /// Write a filler covering `words` words at `addr`.
    ///
    /// # Safety
    ///
    /// `[addr, addr + words)` must be committed, exclusively owned space and
    /// `words >= MIN_OBJECT_WORDS`.
    pub unsafe fn fill(addr: usize, words: usize) {
        debug_assert!(words >= super::MIN_OBJECT_WORDS);
        unsafe {
            store(addr + WORD_SIZE, ObjectShape::Filler { words }.encode());
            set_header(addr, HeaderState::Normal(MarkWord::PROTOTYPE));
        }
    }

    /// Copy `words - 1` words following the header from `from` to `to`.
    ///
    /// # Safety
    ///
    /// Both ranges must be committed; `to` must be exclusively owned.
    pub unsafe fn copy_body(from: usize, to: usize, words: usize) {
        for i in 1..words {
            let off = i * WORD_SIZE;
            unsafe { store(to + off, load(from + off)) };
        }
    }

    /// Zero `words` words starting at `addr`.
    ///
    /// # Safety
    ///
    /// The range must be committed and exclusively owned.
    pub unsafe fn zero(addr: usize, words: usize) {
        for i in 0..words {
            unsafe { store(addr + i * WORD_SIZE, 0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_word_fields() {
        let m = MarkWord::PROTOTYPE;
        assert!(m.is_prototype());
        assert!(!m.must_be_preserved());
        let m = m.incr_age().incr_age();
        assert_eq!(m.age(), 2);
        assert!(m.must_be_preserved());
        let m = m.with_hash(0x1234).with_locked(true);
        assert_eq!(m.hash(), 0x1234);
        assert!(m.is_locked());
        assert_eq!(m.age(), 2);
        assert_eq!(m.with_age(99).age(), MarkWord::MAX_AGE);
    }

    #[test]
    fn test_header_variants() {
        assert_eq!(HeaderState::decode(0), HeaderState::Uninitialized);
        let fwd = HeaderState::Forwarded(0x1000);
        assert_eq!(HeaderState::decode(fwd.encode()), fwd);
        let normal = HeaderState::Normal(MarkWord::PROTOTYPE.with_hash(7));
        assert_eq!(HeaderState::decode(normal.encode()), normal);
    }

    #[test]
    fn test_shape_sizes_are_aligned() {
        assert_eq!(ObjectShape::plain(0, 0).size_words(), 2);
        assert_eq!(ObjectShape::plain(1, 0).size_words(), 4);
        assert_eq!(ObjectShape::plain(2, 3).size_words(), 8);
        assert_eq!(ObjectShape::ref_array(3).size_words(), 6);
        assert_eq!(ObjectShape::weak(0).size_words(), 4);
    }

    #[test]
    fn test_shape_descriptor_decoding() {
        for shape in [
            ObjectShape::plain(3, 5),
            ObjectShape::ref_array(100_000),
            ObjectShape::soft(2),
            ObjectShape::weak(0),
            ObjectShape::Filler { words: 64 },
        ] {
            assert_eq!(ObjectShape::decode(shape.encode()), shape);
        }
        assert_eq!(ObjectShape::weak(4).ref_slots(), 1);
        assert_eq!(ObjectShape::weak(4).data_words(), 4);
    }
}
