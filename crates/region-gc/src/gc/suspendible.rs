//! Suspendible thread set.
//!
//! Background threads that touch heap structures concurrently with mutators
//! (refinement) join the set while they work and check
//! [`should_yield`](SuspendibleThreadSet::should_yield) between units of
//! work. A pause calls [`synchronize`](SuspendibleThreadSet::synchronize),
//! which returns once every joined thread has yielded or left, and
//! [`desynchronize`](SuspendibleThreadSet::desynchronize) when it is done.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    joined: usize,
    yielded: usize,
    suspend_requested: bool,
}

#[derive(Debug, Default)]
pub struct SuspendibleThreadSet {
    state: Mutex<State>,
    cv: Condvar,
    suspend_flag: AtomicBool,
}

impl SuspendibleThreadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the set, waiting out any suspension in progress.
    pub fn join(&self) -> StsJoin<'_> {
        let mut st = self.state.lock();
        while st.suspend_requested {
            self.cv.wait(&mut st);
        }
        st.joined += 1;
        StsJoin { sts: self }
    }

    fn leave(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.joined > 0);
        st.joined -= 1;
        if st.suspend_requested && st.yielded == st.joined {
            self.cv.notify_all();
        }
    }

    /// Cheap check for a pending suspension.
    #[inline]
    pub fn should_yield(&self) -> bool {
        self.suspend_flag.load(Ordering::Acquire)
    }

    fn yield_now(&self) {
        let mut st = self.state.lock();
        if !st.suspend_requested {
            return;
        }
        st.yielded += 1;
        if st.yielded == st.joined {
            self.cv.notify_all();
        }
        while st.suspend_requested {
            self.cv.wait(&mut st);
        }
        st.yielded -= 1;
    }

    /// Stop every joined thread at its next yield point.
    pub fn synchronize(&self) {
        let mut st = self.state.lock();
        debug_assert!(!st.suspend_requested, "nested synchronize");
        st.suspend_requested = true;
        self.suspend_flag.store(true, Ordering::Release);
        while st.yielded < st.joined {
            self.cv.wait(&mut st);
        }
    }

    /// Let suspended threads continue.
    pub fn desynchronize(&self) {
        let mut st = self.state.lock();
        st.suspend_requested = false;
        self.suspend_flag.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_synchronized(&self) -> bool {
        let st = self.state.lock();
        st.suspend_requested && st.yielded == st.joined
    }
}

/// Membership in a [`SuspendibleThreadSet`]; leaves on drop.
#[must_use]
pub struct StsJoin<'a> {
    sts: &'a SuspendibleThreadSet,
}

impl StsJoin<'_> {
    pub fn should_yield(&self) -> bool {
        self.sts.should_yield()
    }

    /// Block while a pause is in progress.
    pub fn yield_now(&self) {
        self.sts.yield_now();
    }
}

impl Drop for StsJoin<'_> {
    fn drop(&mut self) {
        self.sts.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_synchronize_without_members() {
        let sts = SuspendibleThreadSet::new();
        sts.synchronize();
        assert!(sts.is_synchronized());
        sts.desynchronize();
        assert!(!sts.should_yield());
    }

    #[test]
    fn test_joined_thread_parks_at_yield() {
        let sts = Arc::new(SuspendibleThreadSet::new());
        let progress = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let sts = Arc::clone(&sts);
            let progress = Arc::clone(&progress);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let join = sts.join();
                while !stop.load(Ordering::Acquire) {
                    progress.fetch_add(1, Ordering::Relaxed);
                    if join.should_yield() {
                        join.yield_now();
                    }
                    std::thread::sleep(Duration::from_micros(100));
                }
            })
        };
        while progress.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }
        sts.synchronize();
        let frozen = progress.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(progress.load(Ordering::Relaxed), frozen);
        sts.desynchronize();
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
    }
}
