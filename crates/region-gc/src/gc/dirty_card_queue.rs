//! Dirty card notifications and the dirty-cards region list.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

use crate::heap::region::{HeapRegion, NO_REGION};

/// Global queue of dirtied card indices, filled by the write barrier and
/// drained by refinement threads and at the start of every pause.
#[derive(Debug)]
pub struct DirtyCardQueue {
    cards: SegQueue<usize>,
    enqueued: AtomicUsize,
    notify_threshold: usize,
    idle: Mutex<()>,
    wakeup: Condvar,
}

impl DirtyCardQueue {
    pub fn new(notify_threshold: usize) -> Self {
        Self {
            cards: SegQueue::new(),
            enqueued: AtomicUsize::new(0),
            notify_threshold: notify_threshold.max(1),
            idle: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Record a card that just went from clean to dirty.
    pub fn enqueue(&self, card: usize) {
        self.cards.push(card);
        let n = self.enqueued.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.notify_threshold == 0 {
            self.wakeup.notify_one();
        }
    }

    pub fn pop(&self) -> Option<usize> {
        self.cards.pop()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Cards enqueued since the heap was created.
    pub fn total_enqueued(&self) -> usize {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Drop every queued card. Only valid when the card table is rebuilt
    /// right afterwards.
    pub fn discard(&self) -> usize {
        let mut n = 0;
        while self.cards.pop().is_some() {
            n += 1;
        }
        n
    }

    /// Park a refinement thread until more cards arrive or `timeout` passes.
    pub fn wait_for_cards(&self, timeout: Duration) {
        let mut guard = self.idle.lock();
        if self.cards.is_empty() {
            self.wakeup.wait_for(&mut guard, timeout);
        }
    }

    /// Wake every parked refinement thread.
    pub fn notify_all(&self) {
        self.wakeup.notify_all();
    }
}

/// Lock-free stack of regions whose cards were claimed while scanning
/// remembered sets. Uses each region's dedicated `dirty_cards_next` link,
/// so membership here never interferes with any other list.
#[derive(Debug)]
pub struct DirtyCardsRegionList {
    head: AtomicU32,
}

impl DirtyCardsRegionList {
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(NO_REGION),
        }
    }

    /// Push `region` unless it is already on the list.
    pub fn push(&self, region: &HeapRegion) {
        if region
            .on_dirty_cards_list
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            region.dirty_cards_next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                region.index(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(cur) => head = cur,
            }
        }
    }

    /// Detach the whole list, clearing each region's membership flag.
    /// Only called when no push can race, at the end of a pause.
    pub fn take_all(&self, regions: &[HeapRegion]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = self.head.swap(NO_REGION, Ordering::AcqRel);
        while cur != NO_REGION {
            let r = &regions[cur as usize];
            out.push(cur);
            cur = r.dirty_cards_next.swap(NO_REGION, Ordering::Relaxed);
            r.on_dirty_cards_list.store(false, Ordering::Release);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == NO_REGION
    }
}

impl Default for DirtyCardsRegionList {
    fn default() -> Self {
        Self::new()
    }
}
