//! Loom tests for the work-stealing queue.
//!
//! The owner pushes and pops at the bottom while thieves take from the top;
//! every task must come out exactly once.

use loom::sync::Arc;

use region_gc::gc::worklist::StealQueue;

const QUEUE_SIZE: usize = 4;

/// A pushed task is either still queued or taken by the thief.
#[test]
#[ignore = "loom test - run with RUSTFLAGS=\"--cfg loom\" cargo test --release --test loom_worklist -- --ignored"]
fn test_push_then_steal_sees_data() {
    loom::model(|| {
        let queue = Arc::new(StealQueue::with_capacity(QUEUE_SIZE));

        let push_thread = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.push(42)
        });
        let steal_thread = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });

        let pushed = push_thread.join().unwrap();
        let stolen = steal_thread.join().unwrap();
        assert!(pushed);
        match stolen {
            Some(item) => {
                assert_eq!(item, 42);
                assert!(queue.is_empty());
            }
            None => assert_eq!(queue.steal(), Some(42)),
        }
    });
}

/// The owner popping the last task races a thief; exactly one wins.
#[test]
#[ignore = "loom test - run with RUSTFLAGS=\"--cfg loom\" cargo test --release --test loom_worklist -- --ignored"]
fn test_pop_and_steal_race_for_last_item() {
    loom::model(|| {
        let queue = Arc::new(StealQueue::with_capacity(QUEUE_SIZE));
        assert!(queue.push(7));

        let thief = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });
        let popped = queue.pop();
        let stolen = thief.join().unwrap();

        assert_eq!(usize::from(popped.is_some()) + usize::from(stolen.is_some()), 1);
        assert_eq!(popped.or(stolen), Some(7));
        assert!(queue.is_empty());
    });
}

/// Two thieves and the owner drain a queue; no task is duplicated or lost.
#[test]
#[ignore = "loom test - run with RUSTFLAGS=\"--cfg loom\" cargo test --release --test loom_worklist -- --ignored"]
fn test_concurrent_drain_takes_each_task_once() {
    loom::model(|| {
        let queue = Arc::new(StealQueue::with_capacity(QUEUE_SIZE));
        for item in 1..=3 {
            assert!(queue.push(item));
        }

        let thieves: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                loom::thread::spawn(move || queue.steal())
            })
            .collect();
        let mut taken: Vec<usize> = std::iter::from_fn(|| queue.pop()).collect();
        for thief in thieves {
            taken.extend(thief.join().unwrap());
        }
        while let Some(item) = queue.steal() {
            taken.push(item);
        }

        taken.sort_unstable();
        assert_eq!(taken, vec![1, 2, 3]);
    });
}
