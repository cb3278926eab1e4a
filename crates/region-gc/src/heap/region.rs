//! Heap regions.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::block_offset::BlockOffsetTable;
use super::remset::RemSet;
use crate::object::{raw, MIN_OBJECT_WORDS, WORD_SIZE};

/// Sentinel for "no region".
pub const NO_REGION: u32 = u32::MAX;

/// What a region currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionKind {
    /// Empty, on a free list or uncommitted.
    Free = 0,
    /// Young region receiving mutator allocations.
    Eden = 1,
    /// Young region holding objects that survived a pause.
    Survivor = 2,
    /// Tenured objects.
    Old = 3,
    /// First region of a humongous object.
    StartsHumongous = 4,
    /// Further region of a humongous object.
    ContinuesHumongous = 5,
}

impl RegionKind {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Eden,
            2 => Self::Survivor,
            3 => Self::Old,
            4 => Self::StartsHumongous,
            5 => Self::ContinuesHumongous,
            _ => Self::Free,
        }
    }

    /// Eden or survivor.
    #[must_use]
    pub const fn is_young(self) -> bool {
        matches!(self, Self::Eden | Self::Survivor)
    }

    /// Either humongous kind.
    #[must_use]
    pub const fn is_humongous(self) -> bool {
        matches!(self, Self::StartsHumongous | Self::ContinuesHumongous)
    }
}

/// The one container a region is currently threaded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Membership {
    /// Not on any list: an allocation region, in transit, or uncommitted.
    None = 0,
    /// Primary free list.
    FreeList = 1,
    /// Secondary free list.
    SecondaryFreeList = 2,
    /// Eden or survivor list.
    Young = 3,
    /// Old region set.
    Old = 4,
    /// Humongous region set.
    Humongous = 5,
}

impl Membership {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::FreeList,
            2 => Self::SecondaryFreeList,
            3 => Self::Young,
            4 => Self::Old,
            5 => Self::Humongous,
            _ => Self::None,
        }
    }
}

/// A fixed-size slice of the heap.
///
/// `bottom` and `end` never change. `top` only moves up, except when the
/// region is reset. All other fields are atomics so that regions can be
/// shared between the heap lock holder, pause workers and refinement
/// threads; state transitions themselves happen under the heap lock or at a
/// safepoint.
pub struct HeapRegion {
    index: u32,
    bottom: usize,
    end: usize,
    top: AtomicUsize,
    kind: AtomicU8,
    membership: AtomicU8,
    committed: AtomicBool,
    claim: AtomicU32,
    gc_time_stamp: AtomicU32,
    in_cset: AtomicBool,
    evacuation_failed: AtomicBool,
    young_index_in_cset: AtomicI32,
    humongous_start: AtomicU32,
    scan_top: AtomicUsize,
    live_bytes: AtomicUsize,
    liveness_valid: AtomicBool,
    pub(crate) dirty_cards_next: AtomicU32,
    pub(crate) on_dirty_cards_list: AtomicBool,
    rem_set: RemSet,
    bot: BlockOffsetTable,
}

impl HeapRegion {
    pub(crate) fn new(index: u32, bottom: usize, bytes: usize, regions: usize, cards: usize) -> Self {
        Self {
            index,
            bottom,
            end: bottom + bytes,
            top: AtomicUsize::new(bottom),
            kind: AtomicU8::new(RegionKind::Free as u8),
            membership: AtomicU8::new(Membership::None as u8),
            committed: AtomicBool::new(false),
            claim: AtomicU32::new(0),
            gc_time_stamp: AtomicU32::new(0),
            in_cset: AtomicBool::new(false),
            evacuation_failed: AtomicBool::new(false),
            young_index_in_cset: AtomicI32::new(-1),
            humongous_start: AtomicU32::new(NO_REGION),
            scan_top: AtomicUsize::new(bottom),
            live_bytes: AtomicUsize::new(0),
            liveness_valid: AtomicBool::new(false),
            dirty_cards_next: AtomicU32::new(NO_REGION),
            on_dirty_cards_list: AtomicBool::new(false),
            rem_set: RemSet::new(regions, cards),
            bot: BlockOffsetTable::new(cards),
        }
    }

    /// Region index.
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// First address.
    #[inline]
    pub const fn bottom(&self) -> usize {
        self.bottom
    }

    /// One past the last address.
    #[inline]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Current allocation pointer.
    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub(crate) fn set_top(&self, top: usize) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    /// Capacity in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.end - self.bottom
    }

    /// Bytes below top.
    #[inline]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    /// Bytes above top.
    #[inline]
    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    /// Whether nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Whether `addr` lies in `[bottom, end)`.
    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.end
    }

    /// Current kind.
    #[inline]
    pub fn kind(&self) -> RegionKind {
        RegionKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub(crate) fn set_kind(&self, kind: RegionKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    /// Eden or survivor.
    pub fn is_young(&self) -> bool {
        self.kind().is_young()
    }

    /// Free.
    pub fn is_free(&self) -> bool {
        self.kind() == RegionKind::Free
    }

    /// Either humongous kind.
    pub fn is_humongous(&self) -> bool {
        self.kind().is_humongous()
    }

    /// Old, or humongous (which is never moved and is treated like old).
    pub fn is_old_or_humongous(&self) -> bool {
        matches!(
            self.kind(),
            RegionKind::Old | RegionKind::StartsHumongous | RegionKind::ContinuesHumongous
        )
    }

    /// Current container.
    pub fn membership(&self) -> Membership {
        Membership::from_u8(self.membership.load(Ordering::Acquire))
    }

    pub(crate) fn set_membership(&self, m: Membership) {
        self.membership.store(m as u8, Ordering::Release);
    }

    /// Whether the backing memory is committed.
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::Release);
    }

    /// Whether the region is in the current collection set.
    #[inline]
    pub fn in_collection_set(&self) -> bool {
        self.in_cset.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_collection_set(&self, v: bool) {
        self.in_cset.store(v, Ordering::Release);
    }

    /// Whether an object of this region was self-forwarded in the current
    /// or last pause and the region has not been repaired yet.
    pub fn evacuation_failed(&self) -> bool {
        self.evacuation_failed.load(Ordering::Acquire)
    }

    /// Mark the region failed. Returns `true` for the first caller.
    pub(crate) fn set_evacuation_failed(&self) -> bool {
        !self.evacuation_failed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_evacuation_failed(&self) {
        self.evacuation_failed.store(false, Ordering::Release);
    }

    /// Position in the young part of the collection set, `-1` if none.
    pub fn young_index_in_cset(&self) -> i32 {
        self.young_index_in_cset.load(Ordering::Relaxed)
    }

    pub(crate) fn set_young_index_in_cset(&self, i: i32) {
        self.young_index_in_cset.store(i, Ordering::Relaxed);
    }

    /// Index of the first region of the humongous object this region
    /// belongs to.
    pub fn humongous_start_index(&self) -> Option<u32> {
        let i = self.humongous_start.load(Ordering::Acquire);
        (i != NO_REGION).then_some(i)
    }

    /// Claim the region for parallel iteration pass `value`.
    pub(crate) fn try_claim(&self, value: u32) -> bool {
        let cur = self.claim.load(Ordering::Relaxed);
        cur != value
            && self
                .claim
                .compare_exchange(cur, value, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Claim value of the last pass that took this region.
    pub fn claim_value(&self) -> u32 {
        self.claim.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_claim(&self) {
        self.claim.store(0, Ordering::Relaxed);
    }

    /// Collection count when the region was last touched by a pause.
    pub fn gc_time_stamp(&self) -> u32 {
        self.gc_time_stamp.load(Ordering::Relaxed)
    }

    pub(crate) fn record_timestamp(&self, stamp: u32) {
        self.gc_time_stamp.store(stamp, Ordering::Relaxed);
    }

    /// Top at the start of the current pause; cards above it hold only
    /// objects copied in this pause.
    pub fn scan_top(&self) -> usize {
        self.scan_top.load(Ordering::Acquire)
    }

    pub(crate) fn save_scan_top(&self) {
        self.scan_top.store(self.top(), Ordering::Release);
    }

    /// Live bytes found by the last completed marking, if any.
    pub fn live_bytes(&self) -> Option<usize> {
        self.liveness_valid
            .load(Ordering::Acquire)
            .then(|| self.live_bytes.load(Ordering::Relaxed))
    }

    pub(crate) fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
        self.liveness_valid.store(true, Ordering::Release);
    }

    pub(crate) fn clear_live_bytes(&self) {
        self.liveness_valid.store(false, Ordering::Release);
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    /// Bytes the last marking found dead; zero without marking data.
    pub fn garbage_bytes(&self) -> usize {
        self.live_bytes()
            .map_or(0, |live| self.used().saturating_sub(live))
    }

    /// This region's remembered set.
    pub fn rem_set(&self) -> &RemSet {
        &self.rem_set
    }

    pub(crate) fn bot(&self) -> &BlockOffsetTable {
        &self.bot
    }

    /// Lock-free bump allocation of `words` words.
    pub(crate) fn par_allocate(&self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if self.end - top < bytes {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(top),
                Err(cur) => top = cur,
            }
        }
    }

    /// Take back the last allocation if nothing was allocated after it.
    pub(crate) fn par_undo(&self, addr: usize, words: usize) -> bool {
        self.top
            .compare_exchange(
                addr + words * WORD_SIZE,
                addr,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Cover the space above top with a filler so no other allocation can
    /// use it. Returns the filled range, if any.
    pub(crate) fn fill_remaining(&self) -> Option<(usize, usize)> {
        let top = self.top.swap(self.end, Ordering::AcqRel);
        let words = (self.end - top) / WORD_SIZE;
        if words == 0 {
            return None;
        }
        debug_assert!(words >= MIN_OBJECT_WORDS);
        // SAFETY: `[top, end)` is committed and now owned by this call.
        unsafe { raw::fill(top, words) };
        Some((top, words))
    }

    pub(crate) fn set_eden(&self) {
        self.set_kind(RegionKind::Eden);
    }

    pub(crate) fn set_survivor(&self) {
        self.set_kind(RegionKind::Survivor);
    }

    pub(crate) fn set_old(&self) {
        self.set_kind(RegionKind::Old);
    }

    pub(crate) fn set_starts_humongous(&self) {
        self.humongous_start.store(self.index, Ordering::Release);
        self.set_kind(RegionKind::StartsHumongous);
    }

    pub(crate) fn set_continues_humongous(&self, first: u32) {
        self.humongous_start.store(first, Ordering::Release);
        self.set_kind(RegionKind::ContinuesHumongous);
    }

    /// Reset to the empty free state. Idempotent.
    pub(crate) fn hr_clear(&self) {
        self.set_kind(RegionKind::Free);
        self.top.store(self.bottom, Ordering::Release);
        self.scan_top.store(self.bottom, Ordering::Release);
        self.in_cset.store(false, Ordering::Release);
        self.evacuation_failed.store(false, Ordering::Release);
        self.young_index_in_cset.store(-1, Ordering::Relaxed);
        self.humongous_start.store(NO_REGION, Ordering::Release);
        self.claim.store(0, Ordering::Relaxed);
        self.clear_live_bytes();
        self.rem_set.clear();
        self.bot.reset();
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRegion")
            .field("index", &self.index)
            .field("kind", &self.kind())
            .field("membership", &self.membership())
            .field("bottom", &format_args!("{:#x}", self.bottom))
            .field("used", &self.used())
            .field("in_cset", &self.in_collection_set())
            .field("evacuation_failed", &self.evacuation_failed())
            .finish_non_exhaustive()
    }
}

/// Snapshot of a region's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Region index.
    pub index: u32,
    /// Kind.
    pub kind: RegionKind,
    /// Container the region is on.
    pub membership: Membership,
    /// First address.
    pub bottom: usize,
    /// Allocation pointer.
    pub top: usize,
    /// One past the last address.
    pub end: usize,
    /// In the collection set.
    pub in_cset: bool,
    /// Holds self-forwarded objects not yet repaired.
    pub evacuation_failed: bool,
    /// Backing memory is committed.
    pub committed: bool,
    /// Cards recorded in the remembered set.
    pub rem_set_cards: usize,
    /// Live bytes from the last marking.
    pub live_bytes: Option<usize>,
    /// First region of the humongous object this region belongs to.
    pub humongous_start: Option<u32>,
}

impl RegionInfo {
    /// Bytes below top.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.top - self.bottom
    }
}

impl From<&HeapRegion> for RegionInfo {
    fn from(r: &HeapRegion) -> Self {
        Self {
            index: r.index(),
            kind: r.kind(),
            membership: r.membership(),
            bottom: r.bottom(),
            top: r.top(),
            end: r.end(),
            in_cset: r.in_collection_set(),
            evacuation_failed: r.evacuation_failed(),
            committed: r.is_committed(),
            rem_set_cards: r.rem_set().occupied(),
            live_bytes: r.live_bytes(),
            humongous_start: r.humongous_start_index(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Backing store for a fake 4 KiB region.
    fn region(store: &mut Vec<usize>) -> HeapRegion {
        let bytes = store.len() * WORD_SIZE;
        HeapRegion::new(0, store.as_mut_ptr() as usize, bytes, 1, bytes / 512)
    }

    #[test]
    fn test_par_allocate_and_undo() {
        let mut store = vec![0usize; 512];
        let r = region(&mut store);
        let a = r.par_allocate(4).unwrap();
        let b = r.par_allocate(6).unwrap();
        assert_eq!(a, r.bottom());
        assert_eq!(b, a + 4 * WORD_SIZE);
        assert!(!r.par_undo(a, 4));
        assert!(r.par_undo(b, 6));
        assert_eq!(r.used(), 4 * WORD_SIZE);
        assert!(r.par_allocate(1000).is_none());
    }

    #[test]
    fn test_fill_remaining_writes_filler() {
        let mut store = vec![0usize; 512];
        let r = region(&mut store);
        r.par_allocate(10).unwrap();
        let (addr, words) = r.fill_remaining().unwrap();
        assert_eq!(words, 502);
        assert_eq!(r.top(), r.end());
        assert_eq!(unsafe { raw::size_words(addr) }, 502);
        assert!(r.fill_remaining().is_none());
    }

    #[test]
    fn test_hr_clear_is_idempotent() {
        let mut store = vec![0usize; 512];
        let r = region(&mut store);
        r.par_allocate(8).unwrap();
        r.set_old();
        r.set_in_collection_set(true);
        r.set_live_bytes(16);
        r.rem_set().add_card(0, 1);
        r.hr_clear();
        let once = RegionInfo::from(&r);
        r.hr_clear();
        assert_eq!(RegionInfo::from(&r), once);
        assert_eq!(once.kind, RegionKind::Free);
        assert_eq!(once.top, once.bottom);
        assert!(!once.in_cset);
        assert_eq!(once.rem_set_cards, 0);
        assert_eq!(once.live_bytes, None);
    }

    #[test]
    fn test_claim_per_pass() {
        let mut store = vec![0usize; 512];
        let r = region(&mut store);
        assert!(r.try_claim(1));
        assert!(!r.try_claim(1));
        assert!(r.try_claim(2));
        r.reset_claim();
        assert_eq!(r.claim_value(), 0);
    }
}
