//! Evacuation failure: a pause with nowhere to copy to leaves every object
//! in place and repairs the failed regions before it ends.

#![cfg(feature = "test-util")]

use region_gc::{
    Collaborators, GcCause, Heap, HeapConfig, Membership, ObjectShape, PausePhase, RegionKind,
    WORD_SIZE,
};

const REGION: usize = 256 * 1024;

#[test]
fn test_self_forwarded_objects_stay_in_place() {
    // Five regions, all of them eden: no survivor or old region can be
    // taken during the pause.
    let config = HeapConfig::default()
        .with_region_size(REGION)
        .with_initial_heap_size(5 * REGION)
        .with_max_heap_size(5 * REGION)
        .with_young_list_target_length(5)
        .with_max_survivor_regions(0)
        .with_parallel_gc_threads(2)
        .with_refinement_threads(0)
        .with_initiating_heap_occupancy_percent(100)
        .with_verify(true);
    let heap = Heap::new(config, Collaborators::default()).unwrap();

    let shape = ObjectShape::plain(1, 253);
    let per_region = REGION / (shape.size_words() * WORD_SIZE);
    let mut m = heap.attach();
    let mut roots = Vec::new();
    let mut previous = None;
    for i in 0..5 * per_region {
        let obj = m.allocate(shape).unwrap();
        m.write_word(obj, 0, i);
        // Chain every object to the one before so failed objects still
        // have their slots scanned.
        m.write_ref(obj, 0, previous);
        previous = Some(obj);
        roots.push((obj.addr(), m.root(obj)));
    }
    assert_eq!(heap.young_list_length(), 5);
    assert_eq!(heap.free_regions(), 0);
    drop(m);

    let mut phases = Vec::new();
    let ran = heap.collect_observed(GcCause::Explicit, |phase, heap| {
        let young: Vec<_> = heap
            .regions_info()
            .into_iter()
            .filter(|r| r.committed)
            .collect();
        match phase {
            PausePhase::Evacuated { failed } => {
                assert!(failed);
                assert!(young.iter().all(|r| r.evacuation_failed));
            }
            PausePhase::Repaired | PausePhase::Finished => {
                assert!(young.iter().all(|r| !r.evacuation_failed));
            }
        }
        phases.push(phase);
    });
    assert!(ran);
    assert_eq!(
        phases,
        vec![
            PausePhase::Evacuated { failed: true },
            PausePhase::Repaired,
            PausePhase::Finished
        ]
    );

    for region in heap.regions_info() {
        assert_eq!(region.kind, RegionKind::Old);
        assert_eq!(region.membership, Membership::Old);
    }
    assert_eq!(heap.old_regions().len(), 5);

    let m = heap.attach();
    let mut previous = None;
    for (i, (addr, root)) in roots.iter().enumerate() {
        let obj = root.get(&m).unwrap();
        assert_eq!(obj.addr(), *addr);
        assert_eq!(m.read_word(obj, 0), i);
        assert_eq!(m.read_ref(obj, 0).map(|o| o.addr()), previous);
        previous = Some(*addr);
    }
    drop(m);

    assert_eq!(heap.metrics().evacuation_failures(), 1);
    let last = heap.history().last().unwrap();
    assert!(last.evacuation_failed());
    assert_eq!(last.failed_regions, 5);
}
