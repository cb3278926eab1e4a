//! # Lock Ordering Discipline for Deadlock Prevention
//!
//! Every mutex in the heap is an [`OrderedMutex`] tagged with a
//! [`LockOrder`]. Locks must be acquired in non-decreasing level order:
//!
//! | Level | Lock                         | Protects                                |
//! |-------|------------------------------|-----------------------------------------|
//! | 1     | `Heap`                       | mutator slow path, humongous allocation |
//! | 1     | `ParGcAlloc`                 | GC allocation regions during a pause    |
//! | 2     | `Expand`                     | committing and uncommitting regions     |
//! | 2     | `SecondaryFreeList`          | concurrently freed regions              |
//! | 3     | `FreeList`                   | primary free region list                |
//! | 4     | `RegionSets`, `YoungList`, `CollectionSet`, `Policy` | bookkeeping |
//! | 5     | `EvacFailure`, `Roots`       | leaf locks                              |
//!
//! ## Rules
//!
//! 1. **Increasing Order**: a lock may only be taken while every held lock
//!    has the same or a lower level.
//! 2. **Same Level**: locks of equal level may nest in either order, but
//!    only one thread ever nests them (the pause or the heap lock holder).
//! 3. **Leaf Locks**: nothing is acquired while holding a level 5 lock.
//!
//! In debug builds each thread keeps a stack of held levels and a
//! violation panics at the acquisition site. Release builds compile the
//! bookkeeping away.
//!
//! ```ignore
//! let _heap = heap.heap_lock.lock();        // level 1
//! let mut free = heap.free_list.lock();     // level 3, fine
//! let _heap2 = heap.heap_lock.lock();       // level 1 after 3: panics
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::time::Duration;

const MAX_LOCK_DEPTH: usize = 16;

struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// The heap lock taken by the allocation slow paths.
    Heap = 1,
    /// Serializes GC allocation region replacement during a pause.
    ParGcAlloc = 2,
    /// Serializes heap expansion and shrinking.
    Expand = 11,
    /// The secondary free list filled by concurrent cleanup.
    SecondaryFreeList = 3,
    /// The primary free region list.
    FreeList = 4,
    /// Old and humongous region sets.
    RegionSets = 5,
    /// Eden and survivor lists.
    YoungList = 6,
    /// Incremental collection set and candidate chooser.
    CollectionSet = 7,
    /// Pause-time policy state.
    Policy = 8,
    /// Evacuation failure scan stack and preserved marks.
    EvacFailure = 9,
    /// Root table.
    Roots = 10,
}

impl LockOrder {
    /// Unique value of this tag.
    #[must_use]
    pub const fn order_value(self) -> u8 {
        self as u8
    }

    /// Acquisition level of this tag.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Heap | Self::ParGcAlloc => 1,
            Self::Expand | Self::SecondaryFreeList => 2,
            Self::FreeList => 3,
            Self::RegionSets | Self::YoungList | Self::CollectionSet | Self::Policy => 4,
            Self::EvacFailure | Self::Roots => 5,
        }
    }
}

/// Record the acquisition of `tag` on this thread.
///
/// # Panics
///
/// Panics in debug builds if a lock of a higher level is already held.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn acquire_lock(tag: LockOrder) {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if state.is_shutdown.get() {
                return;
            }
            let mut stack = state.stack.borrow_mut();
            if let Some(&held) = stack.iter().max() {
                validate_lock_order(tag.level(), held);
            }
            stack.push(tag.level());
        });
    }
    let _ = tag;
}

#[inline]
#[allow(clippy::missing_const_for_fn)]
fn release_lock(tag: LockOrder) {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if state.is_shutdown.get() {
                return;
            }
            let mut stack = state.stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|&l| l == tag.level()) {
                stack.remove(pos);
            }
        });
    }
    let _ = tag;
}

/// Highest lock level currently held by this thread, 0 if none.
#[must_use]
pub fn current_lock_level() -> u8 {
    LOCK_ORDER_STATE
        .try_with(|state| state.stack.borrow().iter().copied().max().unwrap_or(0))
        .unwrap_or(0)
}

/// Disable lock order tracking for the current thread.
///
/// Called by background threads right before they exit.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            state.is_shutdown.set(true);
        });
    }
}

#[cfg(debug_assertions)]
fn validate_lock_order(level: u8, held: u8) {
    assert!(
        level >= held,
        "Lock ordering violation: level {level} cannot be acquired while holding level {held}"
    );
}

/// RAII marker for a held lock level without an associated mutex.
#[must_use]
pub struct LockGuard {
    tag: LockOrder,
}

impl LockGuard {
    /// Validate and record `tag`.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        acquire_lock(tag);
        Self { tag }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        release_lock(self.tag);
    }
}

/// A `parking_lot` mutex tagged with its position in the lock order.
pub struct OrderedMutex<T> {
    order: LockOrder,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Wrap `value`.
    pub const fn new(order: LockOrder, value: T) -> Self {
        Self {
            order,
            inner: Mutex::new(value),
        }
    }

    /// Acquire, validating the lock order first.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        let order = LockGuard::new(self.order);
        OrderedGuard {
            guard: self.inner.lock(),
            _order: order,
        }
    }

    /// Acquire if uncontended.
    pub fn try_lock(&self) -> Option<OrderedGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        Some(OrderedGuard {
            guard,
            _order: LockGuard::new(self.order),
        })
    }

    /// Access the value through a unique borrow.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`OrderedMutex::lock`].
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _order: LockGuard,
}

impl<T> OrderedGuard<'_, T> {
    /// Block on `cv`, releasing the mutex while waiting.
    pub fn wait(&mut self, cv: &Condvar) {
        cv.wait(&mut self.guard);
    }

    /// Block on `cv` for at most `timeout`.
    pub fn wait_for(&mut self, cv: &Condvar, timeout: Duration) -> WaitTimeoutResult {
        cv.wait_for(&mut self.guard, timeout)
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_levels() {
        assert_eq!(LockOrder::Heap.level(), 1);
        assert_eq!(LockOrder::ParGcAlloc.level(), 1);
        assert_eq!(LockOrder::SecondaryFreeList.level(), 2);
        assert_eq!(LockOrder::FreeList.level(), 3);
        assert_eq!(LockOrder::YoungList.level(), 4);
        assert_eq!(LockOrder::EvacFailure.level(), 5);
    }

    #[test]
    fn test_increasing_order_allowed() {
        let a = OrderedMutex::new(LockOrder::Heap, 1);
        let b = OrderedMutex::new(LockOrder::FreeList, 2);
        let c = OrderedMutex::new(LockOrder::RegionSets, 3);
        let ga = a.lock();
        let gb = b.lock();
        let gc = c.lock();
        assert_eq!(*ga + *gb + *gc, 6);
        drop(gc);
        drop(gb);
        drop(ga);
        assert_eq!(current_lock_level(), 0);
    }

    #[test]
    fn test_same_level_allowed() {
        let a = OrderedMutex::new(LockOrder::RegionSets, ());
        let b = OrderedMutex::new(LockOrder::YoungList, ());
        let _gb = b.lock();
        let _ga = a.lock();
        assert_eq!(current_lock_level(), 4);
    }

    #[test]
    fn test_out_of_order_release() {
        let a = OrderedMutex::new(LockOrder::Heap, ());
        let b = OrderedMutex::new(LockOrder::FreeList, ());
        let ga = a.lock();
        let gb = b.lock();
        drop(ga);
        assert_eq!(current_lock_level(), 3);
        drop(gb);
        assert_eq!(current_lock_level(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_downgrade_panics() {
        let free = OrderedMutex::new(LockOrder::FreeList, ());
        let heap = OrderedMutex::new(LockOrder::Heap, ());
        let _gf = free.lock();
        let _gh = heap.lock();
    }
}
