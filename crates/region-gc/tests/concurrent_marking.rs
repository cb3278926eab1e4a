//! Concurrent marking: a full cycle frees empty old regions and feeds the
//! collection set chooser so that mixed pauses evacuate the rest.

use std::thread;
use std::time::{Duration, Instant};

use region_gc::{Collaborators, GcCause, Heap, HeapConfig, ObjectShape, PauseKind, WORD_SIZE};

const REGION: usize = 256 * 1024;

fn heap() -> std::sync::Arc<Heap> {
    let config = HeapConfig::default()
        .with_region_size(REGION)
        .with_initial_heap_size(16 * REGION)
        .with_max_heap_size(16 * REGION)
        .with_parallel_gc_threads(2)
        .with_refinement_threads(0)
        .with_initiating_heap_occupancy_percent(100)
        .with_heap_waste_percent(0)
        .with_mixed_gc_live_threshold_percent(100)
        .with_verify(true);
    Heap::new(config, Collaborators::default()).unwrap()
}

fn wait_for_marking_cycles(heap: &Heap, cycles: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.metrics().marking_cycles() < cycles {
        assert!(Instant::now() < deadline, "marking cycle did not finish");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_marking_cycle_frees_dead_old_regions_and_enables_mixed_pauses() {
    let heap = heap();
    let shape = ObjectShape::plain(0, 254);
    let per_region = REGION / (shape.size_words() * WORD_SIZE);

    // Four regions of objects, compacted in allocation order into old
    // regions.
    let mut m = heap.attach();
    let mut roots: Vec<_> = (0..4 * per_region)
        .map(|i| {
            let obj = m.allocate(shape).unwrap();
            m.write_word(obj, 0, i);
            Some(m.root(obj))
        })
        .collect();
    drop(m);
    assert!(heap.full_collect(false));
    assert_eq!(heap.old_regions().len(), 4);

    // The first two regions die entirely, the last two keep half.
    for (i, root) in roots.iter_mut().enumerate() {
        if i < 2 * per_region || i % 2 == 0 {
            *root = None;
        }
    }

    assert!(heap.collect(GcCause::MarkingInitiated));
    wait_for_marking_cycles(&heap, 1);
    assert_eq!(heap.metrics().marking_aborts(), 0);
    assert_eq!(heap.old_regions().len(), 2);

    let marked: Vec<_> = heap
        .old_regions()
        .into_iter()
        .filter_map(|i| heap.region_info(i).unwrap().live_bytes)
        .collect();
    assert_eq!(marked, vec![REGION / 2, REGION / 2]);

    // The next young pause is the last one before mixed pauses start.
    assert!(heap.collect(GcCause::Explicit));
    assert!(heap.collect(GcCause::Explicit));
    assert!(heap.metrics().mixed_pauses() >= 1);
    let mixed = heap
        .history()
        .recent(2)
        .into_iter()
        .find(|p| p.kind == PauseKind::Mixed)
        .unwrap();
    assert!(mixed.old_regions >= 1);

    let m = heap.attach();
    for (i, root) in roots.iter().enumerate() {
        if let Some(root) = root {
            let obj = root.get(&m).unwrap();
            assert_eq!(m.read_word(obj, 0), i);
        }
    }
    drop(m);
    assert_eq!(heap.verify(), Ok(()));
}

#[test]
fn test_full_collection_aborts_running_marking() {
    let heap = heap();
    let mut m = heap.attach();
    let kept = m.allocate(ObjectShape::plain(0, 2)).unwrap();
    m.write_word(kept, 1, 5);
    let root = m.root(kept);
    drop(m);

    assert!(heap.full_collect(false));
    assert!(heap.collect(GcCause::MarkingInitiated));
    // Whether or not the cycle finished first, the full collection stops
    // it; a marker parked on its next pause gives up once it resumes.
    assert!(heap.full_collect(true));
    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.marking().in_progress() {
        assert!(Instant::now() < deadline, "marking still running");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        heap.metrics().marking_cycles() + heap.metrics().marking_aborts(),
        1
    );

    let m = heap.attach();
    assert_eq!(m.read_word(root.get(&m).unwrap(), 1), 5);
}
