//! Strong roots.
//!
//! Mutators keep objects alive across safepoints by storing them in the
//! [`RootTable`]. Slots live in fixed-size chunks that are never freed while
//! the heap exists, so a pause can hand whole chunks to its workers and a
//! [`Root`] can keep a plain reference to its slot.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::mutator::Mutator;
use crate::object::ObjectRef;
use crate::Heap;

/// Slots per chunk.
pub const ROOT_CHUNK_SIZE: usize = 256;

struct RootsInner {
    chunks: Vec<Box<[AtomicUsize]>>,
    free: Vec<usize>,
    live: usize,
}

/// Chunked table of root slots. A zero slot is free or null.
pub struct RootTable {
    inner: OrderedMutex<RootsInner>,
}

impl RootTable {
    pub const fn new() -> Self {
        Self {
            inner: OrderedMutex::new(
                LockOrder::Roots,
                RootsInner {
                    chunks: Vec::new(),
                    free: Vec::new(),
                    live: 0,
                },
            ),
        }
    }

    /// Claim a slot holding `addr`.
    pub(crate) fn register(&self, addr: usize) -> (usize, &AtomicUsize) {
        let mut inner = self.inner.lock();
        let index = if let Some(i) = inner.free.pop() {
            i
        } else {
            let base = inner.chunks.len() * ROOT_CHUNK_SIZE;
            inner
                .chunks
                .push((0..ROOT_CHUNK_SIZE).map(|_| AtomicUsize::new(0)).collect());
            inner.free.extend((base + 1..base + ROOT_CHUNK_SIZE).rev());
            base
        };
        inner.live += 1;
        let slot: *const AtomicUsize =
            &inner.chunks[index / ROOT_CHUNK_SIZE][index % ROOT_CHUNK_SIZE];
        // SAFETY: chunks are boxed and only dropped with the table, so the
        // slot outlives the borrow of `self`.
        let slot = unsafe { &*slot };
        slot.store(addr, Ordering::Release);
        (index, slot)
    }

    pub(crate) fn release(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.chunks[index / ROOT_CHUNK_SIZE][index % ROOT_CHUNK_SIZE].store(0, Ordering::Release);
        inner.free.push(index);
        inner.live -= 1;
    }

    /// Snapshot of every chunk. Only meaningful at a safepoint.
    pub(crate) fn chunks(&self) -> Vec<&[AtomicUsize]> {
        let inner = self.inner.lock();
        inner
            .chunks
            .iter()
            .map(|c| {
                let p: *const [AtomicUsize] = &**c;
                // SAFETY: see `register`.
                unsafe { &*p }
            })
            .collect()
    }

    /// Visit every non-null root slot.
    pub(crate) fn for_each_slot(&self, mut f: impl FnMut(&AtomicUsize)) {
        for chunk in self.chunks() {
            for slot in chunk {
                if slot.load(Ordering::Relaxed) != 0 {
                    f(slot);
                }
            }
        }
    }

    /// Number of registered roots.
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RootTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RootTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootTable").field("live", &self.len()).finish()
    }
}

/// A strong root. The referenced object, and everything reachable from it,
/// survives every collection while the root exists; its slot is updated
/// when the object moves.
pub struct Root<'h> {
    heap: &'h Heap,
    index: usize,
    slot: &'h AtomicUsize,
}

impl<'h> Root<'h> {
    pub(crate) fn new(heap: &'h Heap, obj: Option<ObjectRef>) -> Self {
        let (index, slot) = heap.roots.register(obj.map_or(0, ObjectRef::addr));
        Self { heap, index, slot }
    }

    /// Current target, valid until the mutator's next safepoint.
    pub fn get(&self, mutator: &Mutator<'h>) -> Option<ObjectRef> {
        mutator.make_ref(self.slot.load(Ordering::Acquire))
    }

    /// Point the root at `obj`.
    pub fn set(&self, mutator: &Mutator<'h>, obj: Option<ObjectRef>) {
        let addr = obj.map_or(0, |o| mutator.checked_addr(o));
        self.slot.store(addr, Ordering::Release);
    }

    /// Raw address currently stored. Only stable at a safepoint or while a
    /// mutator is attached.
    pub fn addr(&self) -> usize {
        self.slot.load(Ordering::Acquire)
    }

    pub fn is_null(&self) -> bool {
        self.addr() == 0
    }
}

impl Drop for Root<'_> {
    fn drop(&mut self) {
        self.heap.roots.release(self.index);
    }
}

impl fmt::Debug for Root<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("index", &self.index)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_reuses_freed_slots() {
        let table = RootTable::new();
        let (a, sa) = table.register(0x1000);
        let (b, _) = table.register(0x2000);
        assert_ne!(a, b);
        assert_eq!(sa.load(Ordering::Relaxed), 0x1000);
        assert_eq!(table.len(), 2);
        table.release(a);
        assert_eq!(sa.load(Ordering::Relaxed), 0);
        let (c, _) = table.register(0x3000);
        assert_eq!(c, a);
        let mut seen = Vec::new();
        table.for_each_slot(|s| seen.push(s.load(Ordering::Relaxed)));
        seen.sort_unstable();
        assert_eq!(seen, vec![0x2000, 0x3000]);
    }

    #[test]
    fn test_table_grows_by_chunks() {
        let table = RootTable::new();
        let indices: Vec<_> = (0..ROOT_CHUNK_SIZE + 1)
            .map(|i| table.register((i + 1) * 16).0)
            .collect();
        assert_eq!(table.chunks().len(), 2);
        assert_eq!(indices[0], 0);
        assert_eq!(indices[ROOT_CHUNK_SIZE], ROOT_CHUNK_SIZE);
    }
}
