//! End-to-end scenarios: a young pause over a full eden and humongous
//! allocation across several regions.

use std::collections::HashSet;

use region_gc::{
    Collaborators, GcCause, Heap, HeapConfig, Membership, ObjectShape, RegionInfo, RegionKind,
    WORD_SIZE,
};

const MIB: usize = 1024 * 1024;

fn region_of(heap: &Heap, addr: usize) -> RegionInfo {
    heap.regions_info()
        .into_iter()
        .find(|r| r.bottom <= addr && addr < r.end)
        .unwrap()
}

#[test]
fn test_young_pause_evacuates_full_eden() {
    let config = HeapConfig::default()
        .with_region_size(MIB)
        .with_initial_heap_size(16 * MIB)
        .with_max_heap_size(16 * MIB)
        .with_young_list_target_length(10)
        .with_parallel_gc_threads(4)
        .with_refinement_threads(0)
        .with_initiating_heap_occupancy_percent(100)
        .with_verify(true);
    let heap = Heap::new(config, Collaborators::default()).unwrap();

    // 1024-word objects fill a 1 MiB region exactly.
    let shape = ObjectShape::plain(0, 1022);
    assert_eq!(shape.size_words() * WORD_SIZE * 128, MIB);

    let mut m = heap.attach();
    let mut roots = Vec::new();
    let mut sources = HashSet::new();
    for i in 0..1280 {
        let obj = m.allocate(shape).unwrap();
        sources.insert(region_of(&heap, obj.addr()).index);
        if i % 4 == 0 {
            m.write_word(obj, 0, i);
            roots.push((i, m.root(obj)));
        }
    }
    assert_eq!(sources.len(), 10);
    assert_eq!(heap.young_list_length(), 10);
    drop(m);

    assert!(heap.collect(GcCause::Explicit));

    let m = heap.attach();
    let mut seen = HashSet::new();
    for (i, root) in &roots {
        let obj = root.get(&m).unwrap();
        assert!(seen.insert(obj.addr()), "two roots share {:#x}", obj.addr());
        assert_eq!(m.read_word(obj, 0), *i);
        let region = region_of(&heap, obj.addr());
        assert!(!sources.contains(&region.index));
        assert!(matches!(region.kind, RegionKind::Survivor | RegionKind::Old));
        assert!(!region.evacuation_failed);
    }
    for &index in &sources {
        let region = heap.region_info(index).unwrap();
        assert_eq!(region.kind, RegionKind::Free, "region {index}");
        assert_eq!(region.membership, Membership::FreeList);
    }
    // Promotion buffers may leave filler behind, so only bound the total.
    assert!(heap.used() >= roots.len() * shape.size_words() * WORD_SIZE);
    assert!(heap.used() < 10 * MIB);
    assert_eq!(heap.verify(), Ok(()));
}

#[test]
fn test_humongous_object_spans_four_regions() {
    let config = HeapConfig::default()
        .with_region_size(MIB)
        .with_initial_heap_size(8 * MIB)
        .with_max_heap_size(8 * MIB)
        .with_refinement_threads(0)
        .with_initiating_heap_occupancy_percent(100);
    let heap = Heap::new(config, Collaborators::default()).unwrap();

    let words = (3 * MIB + MIB / 2) / WORD_SIZE;
    let obj = heap.humongous_obj_allocate(words).unwrap();
    let first = region_of(&heap, obj);
    assert_eq!(first.kind, RegionKind::StartsHumongous);
    assert_eq!(first.bottom, obj);
    assert_eq!(first.top, first.end);

    for offset in 1..4 {
        let region = heap.region_info(first.index + offset).unwrap();
        assert_eq!(region.kind, RegionKind::ContinuesHumongous);
        assert_eq!(region.humongous_start, Some(first.index));
        let expected_top = if offset == 3 {
            region.bottom + MIB / 2
        } else {
            region.end
        };
        assert_eq!(region.top, expected_top);
    }
    let after = heap.region_info(first.index + 4);
    assert!(after.is_none_or(|r| r.kind != RegionKind::ContinuesHumongous));

    // Used bytes are exact; the run only counts whole regions as capacity.
    assert_eq!(heap.used(), words * WORD_SIZE);
    assert_eq!(heap.humongous_regions().len(), 4);
    assert_eq!(heap.free_regions(), 4);
}

#[test]
fn test_rooted_humongous_object_survives_and_stays_put() {
    let config = HeapConfig::default()
        .with_region_size(MIB)
        .with_initial_heap_size(8 * MIB)
        .with_max_heap_size(8 * MIB)
        .with_refinement_threads(0)
        .with_initiating_heap_occupancy_percent(100)
        .with_verify(true);
    let heap = Heap::new(config, Collaborators::default()).unwrap();

    let mut m = heap.attach();
    #[allow(clippy::cast_possible_truncation)]
    let data = (2 * MIB / WORD_SIZE) as u32;
    let big = m.allocate(ObjectShape::plain(1, data)).unwrap();
    let small = m.allocate(ObjectShape::plain(0, 2)).unwrap();
    m.write_ref(big, 0, Some(small));
    m.write_word(small, 1, 99);
    m.write_word(big, data as usize - 1, 7);
    let root = m.root(big);
    drop(m);

    assert!(heap.collect(GcCause::Explicit));

    let m = heap.attach();
    let big_after = root.get(&m).unwrap();
    assert_eq!(big_after.addr(), big.addr());
    assert_eq!(m.read_word(big_after, data as usize - 1), 7);
    let small_after = m.read_ref(big_after, 0).unwrap();
    assert_ne!(small_after.addr(), small.addr());
    assert_eq!(m.read_word(small_after, 1), 99);
    drop(m);
    drop(root);

    assert!(heap.full_collect(false));
    assert!(heap.humongous_regions().is_empty());
    assert_eq!(heap.used(), 0);
}
