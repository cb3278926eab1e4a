//! Region requests racing with a concurrent cleanup that hands regions back
//! through the secondary free list.

#![cfg(feature = "test-util")]

use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use region_gc::test_util::{
    announce_free_regions, append_free_regions, finish_free_regions, take_free_regions,
};
use region_gc::{Collaborators, Heap, HeapConfig, Membership, RegionKind};

const REGION: usize = 256 * 1024;

fn heap(regions: usize) -> std::sync::Arc<Heap> {
    let config = HeapConfig::default()
        .with_region_size(REGION)
        .with_initial_heap_size(regions * REGION)
        .with_max_heap_size(regions * REGION)
        .with_refinement_threads(0)
        .with_initiating_heap_occupancy_percent(100);
    Heap::new(config, Collaborators::default()).unwrap()
}

#[test]
fn test_requesters_wait_for_announced_regions() {
    let heap = heap(8);
    let held = take_free_regions(&heap, 8);
    assert_eq!(held.len(), 8);
    assert_eq!(heap.free_regions(), 0);

    announce_free_regions(&heap);
    let granted: Vec<Option<u32>> = thread::scope(|s| {
        let requesters: Vec<_> = (0..2)
            .map(|_| s.spawn(|| heap.new_region(16, false, false)))
            .collect();
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            append_free_regions(&heap, &held[..3]);
            finish_free_regions(&heap);
        });
        requesters.into_iter().map(|t| t.join().unwrap()).collect()
    });

    let granted: Vec<u32> = granted.into_iter().map(Option::unwrap).collect();
    let distinct: HashSet<u32> = granted.iter().copied().collect();
    assert_eq!(distinct.len(), 2, "a region was handed out twice: {granted:?}");
    assert!(granted.iter().all(|i| held[..3].contains(i)));
    assert_eq!(heap.free_regions(), 1);
    for index in held[..3].iter().filter(|i| !granted.contains(i)) {
        let info = heap.region_info(*index).unwrap();
        assert_eq!(info.kind, RegionKind::Free);
        assert_eq!(info.membership, Membership::FreeList);
    }
}

#[test]
fn test_request_fails_once_cleanup_brings_nothing() {
    let heap = heap(4);
    let held = take_free_regions(&heap, 4);
    assert_eq!(held.len(), 4);

    announce_free_regions(&heap);
    let result = thread::scope(|s| {
        let requester = s.spawn(|| heap.new_region(16, true, false));
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            finish_free_regions(&heap);
        });
        requester.join().unwrap()
    });
    assert_eq!(result, None);
}

#[test]
fn test_batches_arrive_in_order_of_append() {
    let heap = heap(8);
    let held = take_free_regions(&heap, 8);

    announce_free_regions(&heap);
    append_free_regions(&heap, &held[4..6]);
    // Regions already on the secondary list are usable while more are
    // still announced.
    let first = heap.new_region(16, false, false).unwrap();
    assert!(held[4..6].contains(&first));
    append_free_regions(&heap, &held[6..]);
    finish_free_regions(&heap);

    let mut rest = HashSet::new();
    while let Some(index) = heap.new_region(16, false, false) {
        rest.insert(index);
    }
    let expected: HashSet<u32> = held[4..].iter().copied().filter(|&i| i != first).collect();
    assert_eq!(rest, expected);
}

#[test]
fn test_primary_free_list_served_without_waiting_for_cleanup() {
    let heap = heap(4);
    let held = take_free_regions(&heap, 3);
    assert_eq!(heap.free_regions(), 1);
    let spare = (0..4u32).find(|i| !held.contains(i)).unwrap();

    announce_free_regions(&heap);
    let (tx, rx) = mpsc::channel();
    let granted = thread::scope(|s| {
        let heap = &heap;
        s.spawn(move || tx.send(heap.new_region(16, false, false)).unwrap());
        let granted = rx.recv_timeout(Duration::from_secs(2));
        // Release the request if it did block, so the scope can end.
        finish_free_regions(heap);
        granted
    });

    assert_eq!(granted, Ok(Some(spare)));
    assert_eq!(heap.free_regions(), 0);
}
