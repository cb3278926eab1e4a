//! Work-stealing queues for parallel evacuation.
//!
//! Each pause worker owns one fixed-capacity [`StealQueue`] based on the
//! Chase-Lev deque: the owner pushes and pops at the bottom (LIFO) and idle
//! workers steal from the top (FIFO). When the ring is full the owner spills
//! into a private overflow stack, which only the owner ever drains.
//!
//! Tasks are plain `usize` values. A slot address is pushed as is; a partial
//! array task carries the object address tagged with [`PARTIAL_ARRAY_TAG`].
//! Both are at least word aligned, so the low bit is free.

#[cfg(loom)]
use loom::sync::atomic::{fence, AtomicIsize, AtomicUsize, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{fence, AtomicIsize, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Low bit marking a task as "continue scanning this array".
pub const PARTIAL_ARRAY_TAG: usize = 1;

/// Ring capacity of a worker queue.
pub const QUEUE_CAPACITY: usize = 1 << 14;

/// A unit of evacuation work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTask {
    /// A reference slot that pointed into the collection set when pushed.
    Slot(usize),
    /// An already copied array whose remaining chunks still need scanning.
    /// The address is the from-space copy.
    PartialArray(usize),
}

impl ScanTask {
    #[inline]
    pub const fn encode(self) -> usize {
        match self {
            Self::Slot(addr) => addr,
            Self::PartialArray(obj) => obj | PARTIAL_ARRAY_TAG,
        }
    }

    #[inline]
    pub const fn decode(raw: usize) -> Self {
        if raw & PARTIAL_ARRAY_TAG != 0 {
            Self::PartialArray(raw & !PARTIAL_ARRAY_TAG)
        } else {
            Self::Slot(raw)
        }
    }
}

/// Lock-free work stealing queue.
///
/// Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
/// by Chase and Lev (2005), with the fences of "Correct and Efficient
/// Work-Stealing for Weak Memory Models" (Le et al., 2013).
///
/// # Invariants
///
/// - capacity is a power of two and `mask = capacity - 1`
/// - the queue is empty when `bottom <= top`
/// - only the owner calls [`push`](Self::push) and [`pop`](Self::pop)
pub struct StealQueue {
    buffer: Box<[AtomicUsize]>,
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    mask: usize,
}

impl StealQueue {
    /// Create a queue holding up to `capacity` tasks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "StealQueue capacity must be a power of 2"
        );
        Self {
            buffer: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            mask: capacity - 1,
        }
    }

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    #[allow(clippy::cast_sign_loss)]
    #[inline]
    fn slot(&self, index: isize) -> &AtomicUsize {
        &self.buffer[index as usize & self.mask]
    }

    /// Push at the bottom. Returns `false` if the ring is full.
    ///
    /// Owner only.
    #[allow(clippy::cast_possible_wrap)]
    pub fn push(&self, item: usize) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.buffer.len() as isize {
            return false;
        }
        self.slot(b).store(item, Ordering::Relaxed);
        // Publish the item before the new bottom.
        self.bottom.store(b + 1, Ordering::Release);
        true
    }

    /// Pop at the bottom.
    ///
    /// Owner only.
    pub fn pop(&self) -> Option<usize> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Empty: restore.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let item = self.slot(b).load(Ordering::Relaxed);
        if t == b {
            // Last item: race the thieves for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            return won.then_some(item);
        }
        Some(item)
    }

    /// Steal from the top.
    ///
    /// Safe to call from any thread.
    pub fn steal(&self) -> Option<usize> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return None;
        }
        let item = self.slot(t).load(Ordering::Relaxed);
        self.top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| item)
    }

    /// Approximate number of queued tasks.
    #[allow(clippy::cast_sign_loss)]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for StealQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StealQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StealQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// The set of worker queues of one pause.
#[derive(Debug)]
pub struct QueueSet {
    queues: Box<[StealQueue]>,
}

impl QueueSet {
    pub fn new(workers: usize) -> Self {
        Self::with_capacity(workers, QUEUE_CAPACITY)
    }

    pub fn with_capacity(workers: usize, capacity: usize) -> Self {
        Self {
            queues: (0..workers)
                .map(|_| StealQueue::with_capacity(capacity))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queue(&self, worker: usize) -> &StealQueue {
        &self.queues[worker]
    }

    /// Try every other queue once, starting after `worker`.
    pub fn steal(&self, worker: usize) -> Option<usize> {
        let n = self.queues.len();
        (1..n)
            .map(|k| (worker + k) % n)
            .find_map(|victim| self.queues[victim].steal())
    }

    /// Whether any queue appears to hold work.
    pub fn any_non_empty(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }
}

/// A worker's view of its own queue plus the overflow stack.
pub struct WorkerQueue<'a> {
    queue: &'a StealQueue,
    overflow: Vec<usize>,
}

impl<'a> WorkerQueue<'a> {
    pub const fn new(queue: &'a StealQueue) -> Self {
        Self {
            queue,
            overflow: Vec::new(),
        }
    }

    pub fn push(&mut self, task: ScanTask) {
        let raw = task.encode();
        if !self.queue.push(raw) {
            self.overflow.push(raw);
        }
    }

    /// Pop from the overflow stack first so the stealable ring stays full.
    pub fn pop(&mut self) -> Option<ScanTask> {
        self.overflow
            .pop()
            .or_else(|| self.queue.pop())
            .map(ScanTask::decode)
    }

    pub fn is_empty(&self) -> bool {
        self.overflow.is_empty() && self.queue.is_empty()
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_task_tagging() {
        assert_eq!(ScanTask::decode(ScanTask::Slot(0x1000).encode()), ScanTask::Slot(0x1000));
        assert_eq!(
            ScanTask::decode(ScanTask::PartialArray(0x2000).encode()),
            ScanTask::PartialArray(0x2000)
        );
    }

    #[test]
    fn test_push_pop_lifo() {
        let q = StealQueue::with_capacity(8);
        for i in 1..=5 {
            assert!(q.push(i * 8));
        }
        assert_eq!(q.len(), 5);
        assert_eq!(q.pop(), Some(40));
        assert_eq!(q.steal(), Some(8));
        assert_eq!(q.pop(), Some(32));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_push_fails_when_full() {
        let q = StealQueue::with_capacity(4);
        for i in 0..4 {
            assert!(q.push(i));
        }
        assert!(!q.push(99));
        assert_eq!(q.steal(), Some(0));
        assert!(q.push(99));
    }

    #[test]
    fn test_pop_empty_keeps_queue_usable() {
        let q = StealQueue::with_capacity(4);
        assert_eq!(q.pop(), None);
        assert_eq!(q.pop(), None);
        assert!(q.push(7));
        assert_eq!(q.pop(), Some(7));
        assert!(q.is_empty());
    }

    #[test]
    fn test_overflow_spills_and_drains() {
        let q = StealQueue::with_capacity(2);
        let mut wq = WorkerQueue::new(&q);
        for i in 0..5 {
            wq.push(ScanTask::Slot(i * 8));
        }
        assert_eq!(wq.overflow_len(), 3);
        let mut seen = Vec::new();
        while let Some(ScanTask::Slot(s)) = wq.pop() {
            seen.push(s);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 8, 16, 24, 32]);
        assert!(wq.is_empty());
    }

    #[test]
    fn test_concurrent_steal_takes_each_item_once() {
        let q = Arc::new(StealQueue::with_capacity(1024));
        for i in 0..1000 {
            assert!(q.push(i * 8));
        }
        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(v) = q.steal() {
                        got.push(v);
                    }
                    got
                })
            })
            .collect();
        let mut all = Vec::new();
        while let Some(v) = q.pop() {
            all.push(v);
        }
        for t in thieves {
            all.extend(t.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }

    #[test]
    fn test_queue_set_steals_from_others() {
        let set = QueueSet::with_capacity(3, 8);
        assert!(set.queue(2).push(64));
        assert!(set.any_non_empty());
        assert_eq!(set.steal(0), Some(64));
        assert_eq!(set.steal(0), None);
        assert!(!set.any_non_empty());
    }
}
