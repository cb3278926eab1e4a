//! GC locker: lets external code pin the heap for short critical sections.
//!
//! While any critical section is active a pause cannot move objects. A pause
//! requested in that window records that a collection is needed and gives
//! up; allocating threads either grow eden past its target or stall until
//! the last critical section ends.

use parking_lot::{Condvar, Mutex};

/// The locker contract consumed by the allocation slow paths and pauses.
pub trait GcLocker: Send + Sync {
    /// Whether some critical section is active.
    fn is_active(&self) -> bool;

    /// Whether a critical section is active and a pause was refused because
    /// of it.
    fn is_active_and_needs_gc(&self) -> bool;

    /// Whether a pause was refused and the critical sections that caused it
    /// have not all ended yet.
    fn needs_gc(&self) -> bool;

    /// Block until `needs_gc` is cleared.
    fn stall_until_clear(&self);

    /// Called at the start of every pause, at a safepoint. Returns `true`
    /// (and records that a collection is needed) if the pause must not run.
    fn check_active_before_gc(&self) -> bool;
}

#[derive(Debug, Default)]
struct LockerState {
    active: usize,
    needs_gc: bool,
}

/// Counting implementation of [`GcLocker`].
///
/// ```
/// use region_gc::{CriticalSections, GcLocker};
///
/// let locker = CriticalSections::new();
/// {
///     let _cs = locker.enter();
///     assert!(locker.is_active());
///     assert!(locker.check_active_before_gc());
///     assert!(locker.needs_gc());
/// }
/// assert!(!locker.needs_gc());
/// ```
#[derive(Debug, Default)]
pub struct CriticalSections {
    state: Mutex<LockerState>,
    cleared: Condvar,
}

impl CriticalSections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a critical section. Pauses are refused until the returned guard
    /// is dropped.
    pub fn enter(&self) -> CriticalSection<'_> {
        self.state.lock().active += 1;
        CriticalSection { locker: self }
    }

    fn exit(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.active > 0);
        st.active -= 1;
        if st.active == 0 && st.needs_gc {
            st.needs_gc = false;
            self.cleared.notify_all();
        }
    }

    /// Number of active critical sections.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }
}

impl GcLocker for CriticalSections {
    fn is_active(&self) -> bool {
        self.state.lock().active > 0
    }

    fn is_active_and_needs_gc(&self) -> bool {
        let st = self.state.lock();
        st.active > 0 && st.needs_gc
    }

    fn needs_gc(&self) -> bool {
        self.state.lock().needs_gc
    }

    fn stall_until_clear(&self) {
        let mut st = self.state.lock();
        while st.needs_gc {
            self.cleared.wait(&mut st);
        }
    }

    fn check_active_before_gc(&self) -> bool {
        let mut st = self.state.lock();
        if st.active > 0 {
            st.needs_gc = true;
            true
        } else {
            false
        }
    }
}

/// An active critical section. Ends on drop.
#[must_use]
pub struct CriticalSection<'a> {
    locker: &'a CriticalSections,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.locker.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_inactive_locker_allows_gc() {
        let l = CriticalSections::new();
        assert!(!l.check_active_before_gc());
        assert!(!l.needs_gc());
        l.stall_until_clear();
    }

    #[test]
    fn test_stall_released_by_last_exit() {
        let l = Arc::new(CriticalSections::new());
        let a = l.enter();
        let b = l.enter();
        assert!(l.check_active_before_gc());
        assert!(l.is_active_and_needs_gc());

        let waiter = {
            let l = Arc::clone(&l);
            std::thread::spawn(move || l.stall_until_clear())
        };
        drop(a);
        std::thread::sleep(Duration::from_millis(5));
        assert!(l.needs_gc());
        assert!(!waiter.is_finished());
        drop(b);
        waiter.join().unwrap();
        assert!(!l.needs_gc());
        assert_eq!(l.active(), 0);
    }
}
