//! Mutator threads.
//!
//! A [`Mutator`] is a thread attached to a heap. While attached it holds
//! shared access to the heap's safepoint lock, so no pause can run until it
//! polls ([`Mutator::safepoint_poll`]), blocks in an allocation that has to
//! collect, or detaches. Every object access goes through the mutator, which
//! applies the post-write barrier and checks that references are not stale.

use std::fmt;

use parking_lot::RwLockReadGuard;

use crate::error::AllocError;
use crate::object::{raw, HeaderState, MarkWord, ObjectRef, ObjectShape, HEADER_WORDS, WORD_SIZE};
use crate::roots::Root;
use crate::vm::SafepointContext;
use crate::Heap;

/// A thread attached to a [`Heap`].
pub struct Mutator<'h> {
    heap: &'h Heap,
    access: Option<RwLockReadGuard<'h, ()>>,
    epoch: u32,
}

impl<'h> Mutator<'h> {
    pub(crate) fn new(heap: &'h Heap) -> Self {
        let access = heap.safepoint.shared();
        Self {
            heap,
            access: Some(access),
            epoch: heap.epoch(),
        }
    }

    pub const fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Allocate and initialize an object of `shape`: every reference slot
    /// null and every data word zero. May run a pause, which invalidates
    /// every [`ObjectRef`] obtained before.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if no space could be found even after
    /// collecting and expanding the heap.
    pub fn allocate(&mut self, shape: ObjectShape) -> Result<ObjectRef, AllocError> {
        let words = shape.size_words();
        let heap = self.heap;
        let addr = heap
            .mem_allocate(self, words)
            .ok_or(AllocError::OutOfMemory { word_size: words })?;
        // SAFETY: the space is fresh and owned by this thread until the
        // header is published; the header goes last so concurrent card
        // scanning sees either zero or a complete object.
        unsafe {
            raw::set_shape(addr, shape);
            raw::zero(addr + HEADER_WORDS * WORD_SIZE, words - HEADER_WORDS);
            raw::set_header(addr, HeaderState::Normal(MarkWord::PROTOTYPE));
        }
        ObjectRef::from_addr(addr, self.epoch).ok_or(AllocError::OutOfMemory { word_size: words })
    }

    /// Register a root for `obj`.
    pub fn root(&self, obj: ObjectRef) -> Root<'h> {
        self.checked_addr(obj);
        Root::new(self.heap, Some(obj))
    }

    /// A root that starts out null.
    pub fn null_root(&self) -> Root<'h> {
        Root::new(self.heap, None)
    }

    /// Layout of `obj`.
    pub fn shape(&self, obj: ObjectRef) -> ObjectShape {
        let addr = self.checked_addr(obj);
        // SAFETY: `addr` is a live object of this heap.
        unsafe { raw::shape(addr) }
    }

    /// Reference slot `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is stale or `index` is out of bounds.
    pub fn read_ref(&self, obj: ObjectRef, index: usize) -> Option<ObjectRef> {
        let slot = self.ref_slot(obj, index);
        // SAFETY: `slot` is a reference slot of a live object.
        self.make_ref(unsafe { raw::load(slot) })
    }

    /// Store `value` into reference slot `index` of `obj`.
    ///
    /// Storing a reference into an object outside the young generation
    /// dirties the card holding the slot and queues it for refinement, so
    /// the target region's remembered set learns about the slot.
    ///
    /// # Panics
    ///
    /// Panics if either reference is stale or `index` is out of bounds.
    pub fn write_ref(&self, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
        let slot = self.ref_slot(obj, index);
        let target = value.map_or(0, |v| self.checked_addr(v));
        // SAFETY: `slot` is a reference slot of a live object.
        unsafe { raw::store(slot, target) };
        self.post_write_barrier(slot, target);
    }

    fn post_write_barrier(&self, slot: usize, target: usize) {
        if target == 0 {
            return;
        }
        let heap = self.heap;
        let geometry = &heap.geometry;
        if geometry.region_index(slot) == geometry.region_index(target) {
            return;
        }
        if heap.region_containing(slot).is_young() {
            return;
        }
        let card = geometry.card_index(slot);
        if heap.card_table.mark_dirty(card) {
            heap.dirty_card_queue.enqueue(card);
        }
    }

    /// Data word `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is stale or `index` is out of bounds.
    pub fn read_word(&self, obj: ObjectRef, index: usize) -> usize {
        let addr = self.data_word(obj, index);
        // SAFETY: `addr` is a data word of a live object.
        unsafe { raw::load(addr) }
    }

    /// Store `value` into data word `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is stale or `index` is out of bounds.
    pub fn write_word(&self, obj: ObjectRef, index: usize, value: usize) {
        let addr = self.data_word(obj, index);
        // SAFETY: `addr` is a data word of a live object.
        unsafe { raw::store(addr, value) };
    }

    /// Let a pending pause run. Every [`ObjectRef`] obtained before the
    /// poll may be stale afterwards; reload them from roots.
    pub fn safepoint_poll(&mut self) {
        if let Some(access) = self.access.as_mut() {
            RwLockReadGuard::bump(access);
        }
        self.epoch = self.heap.epoch();
    }

    fn ref_slot(&self, obj: ObjectRef, index: usize) -> usize {
        let addr = self.checked_addr(obj);
        // SAFETY: `addr` is a live object of this heap.
        let slots = unsafe { raw::shape(addr) }.ref_slots();
        assert!(index < slots, "reference slot {index} out of bounds ({slots} slots)");
        raw::slot_addr(addr, index)
    }

    fn data_word(&self, obj: ObjectRef, index: usize) -> usize {
        let addr = self.checked_addr(obj);
        // SAFETY: `addr` is a live object of this heap.
        let shape = unsafe { raw::shape(addr) };
        let words = shape.data_words();
        assert!(index < words, "data word {index} out of bounds ({words} words)");
        raw::slot_addr(addr, shape.ref_slots() + index)
    }

    /// Wrap an address loaded from the heap or a root.
    pub(crate) fn make_ref(&self, addr: usize) -> Option<ObjectRef> {
        ObjectRef::from_addr(addr, self.epoch)
    }

    /// Address of `obj`, rejecting references from before the last
    /// safepoint.
    pub(crate) fn checked_addr(&self, obj: ObjectRef) -> usize {
        assert_eq!(
            obj.epoch(),
            self.epoch,
            "stale {obj:?}: a safepoint has run since it was loaded"
        );
        debug_assert!(self.heap.is_in_reserved(obj.addr()));
        obj.addr()
    }
}

impl SafepointContext for Mutator<'_> {
    fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.access = None;
        let result = f();
        self.access = Some(self.heap.safepoint.shared());
        self.epoch = self.heap.epoch();
        result
    }
}

impl fmt::Debug for Mutator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("epoch", &self.epoch)
            .field("attached", &self.access.is_some())
            .finish()
    }
}
