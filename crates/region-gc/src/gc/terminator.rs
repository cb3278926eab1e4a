//! Cooperative termination detection for parallel pause phases.
//!
//! A worker that runs out of local work offers termination. It is counted
//! as idle until either every worker is idle at once (the phase is over) or
//! it sees work appear in some queue, in which case it withdraws its offer
//! and goes back to stealing. Work is only ever created by non-idle
//! workers, so "all idle" means no task can appear any more.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use super::worklist::QueueSet;

const SLEEP: Duration = Duration::from_micros(50);

/// Counting termination barrier.
#[derive(Debug)]
pub struct ParallelTaskTerminator {
    workers: usize,
    offered: AtomicUsize,
}

/// Outcome counters of one worker's termination attempts.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminationStats {
    pub attempts: usize,
    pub time: Duration,
}

impl ParallelTaskTerminator {
    pub const fn new(workers: usize) -> Self {
        Self {
            workers,
            offered: AtomicUsize::new(0),
        }
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Offer termination. Returns `true` when every worker has offered and
    /// the phase is complete, `false` if work showed up in `queues` and the
    /// caller should resume stealing.
    pub fn offer_termination(&self, queues: &QueueSet, stats: &mut TerminationStats) -> bool {
        let start = Instant::now();
        stats.attempts += 1;
        let prev = self.offered.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev < self.workers, "more offers than workers");

        let backoff = Backoff::new();
        let done = loop {
            if self.offered.load(Ordering::Acquire) == self.workers {
                break true;
            }
            if queues.any_non_empty() {
                // Withdraw. The count can have reached `workers` in between,
                // in which case the phase is over after all.
                let withdrawn = self
                    .offered
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n != self.workers).then(|| n - 1)
                    })
                    .is_ok();
                break !withdrawn;
            }
            if backoff.is_completed() {
                std::thread::sleep(SLEEP);
            } else {
                backoff.snooze();
            }
        };
        stats.time += start.elapsed();
        done
    }

    /// Make the terminator usable for another phase. All workers must have
    /// left the previous one.
    pub fn reset(&self) {
        self.offered.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_worker_terminates_immediately() {
        let t = ParallelTaskTerminator::new(1);
        let q = QueueSet::with_capacity(1, 8);
        let mut stats = TerminationStats::default();
        assert!(t.offer_termination(&q, &mut stats));
        assert_eq!(stats.attempts, 1);
    }

    #[test]
    fn test_withdraws_when_work_appears() {
        let t = ParallelTaskTerminator::new(2);
        let q = QueueSet::with_capacity(2, 8);
        assert!(q.queue(1).push(8));
        let mut stats = TerminationStats::default();
        assert!(!t.offer_termination(&q, &mut stats));
        assert_eq!(q.steal(0), Some(8));
    }

    #[test]
    fn test_all_workers_terminate_together() {
        let t = Arc::new(ParallelTaskTerminator::new(4));
        let q = Arc::new(QueueSet::with_capacity(4, 64));
        for i in 0..32 {
            assert!(q.queue(0).push(i * 8));
        }
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let t = Arc::clone(&t);
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut done = 0usize;
                    let mut stats = TerminationStats::default();
                    loop {
                        while let Some(_task) = if w == 0 { q.queue(0).pop() } else { None } {
                            done += 1;
                        }
                        if q.steal(w).is_some() {
                            done += 1;
                            continue;
                        }
                        if t.offer_termination(&q, &mut stats) {
                            break;
                        }
                    }
                    done
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 32);
    }
}
