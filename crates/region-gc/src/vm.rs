//! Safepoints and VM operations.
//!
//! The heap never stops mutator threads itself. It packages every pause as
//! a [`VmOperation`] and hands it to a [`SafepointExecutor`], which must
//! suspend all mutators before calling [`VmOperation::doit`] and resume
//! them afterwards.
//!
//! The built-in executor is [`SafepointLock`]: every attached mutator holds
//! the shared side of a reader-writer lock while it runs and briefly
//! releases it when it polls; an operation runs under the exclusive side.
//! Custom executors (an embedding runtime's own safepoint mechanism) can be
//! plugged in through [`Collaborators`](crate::Collaborators); the heap
//! still takes its own lock exclusively inside `doit` so that its mutators
//! are stopped as well.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

/// A unit of work that must run while every mutator is suspended.
pub trait VmOperation {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Runs on the requesting thread before the safepoint. Returning
    /// `false` cancels the operation.
    fn doit_prologue(&mut self) -> bool {
        true
    }

    /// Runs at the safepoint.
    fn doit(&mut self);

    /// Runs on the requesting thread after the safepoint, only if the
    /// prologue succeeded.
    fn doit_epilogue(&mut self) {}
}

/// Synchronously runs operations at a safepoint.
pub trait SafepointExecutor: Send + Sync {
    /// Run `op`: prologue, then `doit` with all mutators suspended, then the
    /// epilogue. Returns when the operation has completed.
    fn execute(&self, op: &mut dyn VmOperation);
}

/// Reader-writer safepoint lock.
#[derive(Debug, Default)]
pub struct SafepointLock {
    lock: RwLock<()>,
    safepoints: AtomicU64,
}

impl SafepointLock {
    pub const fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            safepoints: AtomicU64::new(0),
        }
    }

    /// Shared access for a running mutator.
    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Number of safepoints executed so far.
    pub fn safepoints(&self) -> u64 {
        self.safepoints.load(Ordering::Relaxed)
    }

    /// Run `op.doit()` with the lock held exclusively.
    pub(crate) fn run_exclusive(&self, op: &mut dyn VmOperation) {
        let _exclusive = self.lock.write();
        self.safepoints.fetch_add(1, Ordering::Relaxed);
        op.doit();
    }
}

impl SafepointExecutor for SafepointLock {
    fn execute(&self, op: &mut dyn VmOperation) {
        if !op.doit_prologue() {
            return;
        }
        self.run_exclusive(op);
        op.doit_epilogue();
    }
}

/// Adapts an operation for an external executor: the heap's own lock is
/// taken inside `doit`, so mutators attached through this heap stop too.
pub(crate) struct WithHeapSafepoint<'a> {
    pub(crate) lock: &'a SafepointLock,
    pub(crate) op: &'a mut dyn VmOperation,
}

impl VmOperation for WithHeapSafepoint<'_> {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn doit_prologue(&mut self) -> bool {
        self.op.doit_prologue()
    }

    fn doit(&mut self) {
        self.lock.run_exclusive(&mut *self.op);
    }

    fn doit_epilogue(&mut self) {
        self.op.doit_epilogue();
    }
}

/// A thread context that can temporarily give up its safepoint access while
/// it blocks.
pub trait SafepointContext {
    /// Run `f` without holding shared safepoint access.
    fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R;
}

/// Context of a thread that is not attached as a mutator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl SafepointContext for Detached {
    fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Counter {
        prologue_ok: bool,
        ran: u32,
        epilogue: u32,
    }

    impl VmOperation for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn doit_prologue(&mut self) -> bool {
            self.prologue_ok
        }

        fn doit(&mut self) {
            self.ran += 1;
        }

        fn doit_epilogue(&mut self) {
            self.epilogue += 1;
        }
    }

    #[test]
    fn test_execute_runs_all_phases() {
        let lock = SafepointLock::new();
        let mut op = Counter {
            prologue_ok: true,
            ran: 0,
            epilogue: 0,
        };
        lock.execute(&mut op);
        assert_eq!((op.ran, op.epilogue), (1, 1));
        assert_eq!(lock.safepoints(), 1);
    }

    #[test]
    fn test_failed_prologue_skips_doit() {
        let lock = SafepointLock::new();
        let mut op = Counter {
            prologue_ok: false,
            ran: 0,
            epilogue: 0,
        };
        lock.execute(&mut op);
        assert_eq!((op.ran, op.epilogue), (0, 0));
        assert_eq!(lock.safepoints(), 0);
    }

    #[test]
    fn test_operation_waits_for_running_mutator() {
        let lock = Arc::new(SafepointLock::new());
        let guard = lock.shared();
        let handle = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let mut op = Counter {
                    prologue_ok: true,
                    ran: 0,
                    epilogue: 0,
                };
                lock.execute(&mut op);
                op.ran
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(lock.safepoints(), 0);
        drop(guard);
        assert_eq!(handle.join().unwrap(), 1);
    }
}
