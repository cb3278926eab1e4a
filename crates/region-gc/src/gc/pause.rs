//! The evacuation pause.
//!
//! Runs inside a VM operation with every mutator stopped and the heap lock
//! held. The pause moves through root scan wait, collection set
//! finalization, parallel evacuation, reference processing and cleanup; if
//! any object could not be copied the failed regions are repaired between
//! the last two.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::evacuate::EvacuationContext;
use super::policy::{AgeTable, PauseRecord};
use super::GcCause;
use crate::heap::region::Membership;
use crate::heap::Heap;
use crate::metrics::{PauseMetrics, WorkerStats};
use crate::object::WORD_SIZE;
use crate::tracing::{events, trace_gc_pause, trace_phase, LogTags, TraceTime};
#[cfg(feature = "test-util")]
use crate::vm::{Detached, VmOperation};

/// Points of an evacuation pause reported to a pause observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausePhase {
    /// Copying and reference processing are done; failed regions still
    /// hold self-forwarded objects.
    Evacuated {
        /// Whether any object had to stay in place.
        failed: bool,
    },
    /// Failed regions have been repaired.
    Repaired,
    /// The collection set is freed and the policy updated.
    Finished,
}

impl Heap {
    /// Run an evacuation pause. Returns `false` without collecting if a
    /// critical section is active.
    pub(crate) fn do_collection_pause_at_safepoint(&self, cause: GcCause) -> bool {
        self.evacuation_pause(cause, &mut |_, _| {})
    }

    #[allow(clippy::too_many_lines)]
    fn evacuation_pause(&self, cause: GcCause, observer: &mut dyn FnMut(PausePhase, &Self)) -> bool {
        if self.gc_locker.check_active_before_gc() {
            return false;
        }
        let pause_start = Instant::now();
        let gc_id = self.gc_ids.next_id();
        let tags = self.config.trace_tags;

        let (initial_mark, kind) = {
            let mut policy = self.policy.lock();
            let initial_mark = policy.decide_on_conc_mark_initiation(self.marking.in_progress());
            (initial_mark, policy.pause_kind())
        };
        let _span = trace_gc_pause(kind.as_str(), cause, gc_id);
        let _pause_timer = TraceTime::for_tags("evacuation pause", LogTags::GC, tags);

        let mut metrics = PauseMetrics {
            gc_id: gc_id.0,
            kind,
            cause: Some(cause),
            used_before: self.used(),
            ..PauseMetrics::default()
        };
        self.verify_or_panic("before pause");

        if self.marking.in_progress() {
            let _phase = trace_phase("root_region_scan_wait");
            let wait = Duration::from_millis(self.config.root_scan_wait_ms);
            if !self.marking.wait_for_root_region_scan(wait) {
                self.marking
                    .abort(Duration::from_millis(self.config.marking_abort_wait_ms));
            }
        }

        {
            let _phase = trace_phase("update_rs");
            let timer = TraceTime::for_tags("update rs", LogTags::PHASES, tags);
            metrics.cards_refined = self.drain_dirty_card_queue();
            metrics.update_rs_time = timer.elapsed();
        }
        self.metrics().record_cards_refined(metrics.cards_refined);

        // Collection set.
        let cset_timer = TraceTime::for_tags("choose cset", LogTags::CSET, tags);
        self.mutator_alloc_region.release(self);
        {
            let sets = self.sets.lock();
            for index in sets.old.iter().chain(sets.humongous.iter()) {
                self.region(index).save_scan_top();
            }
        }
        let (eden, _survivors) = self.young_list.lock().take_all(&self.regions);
        let cset = self.finalize_collection_set(&mut metrics);
        metrics.cset_time = cset_timer.elapsed();
        drop(cset_timer);
        let young_bytes: usize = cset
            .iter()
            .map(|&i| self.region(i))
            .filter(|r| r.is_young())
            .map(|r| r.used())
            .sum();
        debug_assert!(eden.iter().all(|&i| self.region(i).in_collection_set()));

        // Evacuation.
        self.survivor_gc_alloc_region.init();
        self.old_gc_alloc_region.init();
        let tenuring_threshold = self.policy.lock().tenuring_threshold();
        let ctx = EvacuationContext::new(self, cset.clone(), gc_id, tenuring_threshold);
        let mut age_table = AgeTable::new();
        let mut surviving_young_words = 0;
        {
            let phase = trace_phase("evacuate");
            let timer = TraceTime::for_tags("evacuate", LogTags::PHASES, tags);
            let mut states = ctx.evacuate();
            metrics.evacuate_time = timer.elapsed();
            drop(timer);
            drop(phase);

            let _phase = trace_phase("reference_processing");
            let timer = TraceTime::for_tags("reference processing", LogTags::REF, tags);
            let refs = self.process_discovered_references(&mut states);
            metrics.refs_cleared = refs.cleared;
            metrics.ref_proc_time = timer.elapsed();

            for pss in &mut states {
                pss.retire_plabs();
                age_table.merge(&pss.age_table);
                surviving_young_words += pss.surviving_young_words;
            }
            metrics.workers = states.iter().map(|pss| pss.stats).collect();
        }
        metrics.totals = metrics
            .workers
            .iter()
            .fold(WorkerStats::default(), |mut acc, w| {
                acc.merge(w);
                acc
            });
        self.survivor_gc_alloc_region.release(self);
        self.old_gc_alloc_region.release(self);

        let failed = ctx.evac_failure.failed_regions();
        observer(
            PausePhase::Evacuated {
                failed: !failed.is_empty(),
            },
            self,
        );
        if !failed.is_empty() {
            let _phase = trace_phase("remove_self_forwards");
            let timer = TraceTime::for_tags("remove self forwards", LogTags::PHASES, tags);
            let repaired = self.remove_self_forwarding_pointers(&ctx.evac_failure);
            metrics.failed_regions = repaired.regions;
            metrics.evac_failure_time = timer.elapsed();
            events::evacuation_failed(gc_id, repaired.objects, repaired.regions);
            observer(PausePhase::Repaired, self);
        }
        drop(ctx);

        // Cleanup.
        {
            let _phase = trace_phase("cleanup");
            let timer = TraceTime::for_tags("free cset", LogTags::PHASES, tags);
            metrics.regions_freed = self.free_collection_set(&cset, &failed);
            self.clear_dirty_cards_regions();
            self.rebuild_incremental_cset();
            metrics.cleanup_time = timer.elapsed();
        }
        self.total_collections.fetch_add(1, Ordering::AcqRel);

        metrics.used_after = self.used();
        metrics.duration = pause_start.elapsed();
        self.update_policy_after_pause(&metrics, young_bytes, surviving_young_words, age_table);
        self.expand_after_pause();
        if initial_mark {
            self.marking.notify_initial_mark(self, gc_id);
        }
        self.mutator_alloc_region.init();
        self.verify_or_panic("after pause");

        events::pause_end(
            gc_id,
            metrics.used_before,
            metrics.used_after,
            metrics.duration.as_secs_f64() * 1000.0,
        );
        self.record_pause(metrics);
        observer(PausePhase::Finished, self);
        true
    }

    /// Close the incremental collection set and add old candidates for a
    /// mixed pause. Returns the regions to evacuate, young first.
    fn finalize_collection_set(&self, metrics: &mut PauseMetrics) -> Vec<u32> {
        let capacity = self.capacity();
        let committed = self.committed_regions();
        let mut cset = self.cset.lock();
        let young_ms = cset.finalize_young(&self.regions);
        let policy = self.policy.lock();
        let base_ms = policy.predict_base_time_ms();
        let budget_ms = self.config.pause_time_target_ms;
        let remaining = (budget_ms - base_ms - young_ms).max(0.0);
        let (old, _) = policy.finalize_old_cset(&mut self.chooser.lock(), remaining, committed, capacity);
        for index in old {
            let region = self.region(index);
            let predicted = policy.predict_region_time_ms(
                false,
                region.used(),
                self.marking.live_bytes(region),
                region.rem_set().occupied(),
            );
            cset.add_old_region(region, predicted);
        }
        drop(policy);

        metrics.eden_regions = cset.eden_len();
        metrics.survivor_regions = cset.survivor_len();
        metrics.old_regions = cset.old_len();
        metrics.predicted_ms = base_ms + cset.predicted_ms();
        events::cset_chosen(
            cset.eden_len(),
            cset.survivor_len(),
            cset.old_len(),
            metrics.predicted_ms,
            budget_ms,
        );
        cset.take()
    }

    /// Free every collection set region that was evacuated and turn the
    /// failed ones into old regions. Returns the number of regions freed.
    fn free_collection_set(&self, cset: &[u32], failed: &[u32]) -> usize {
        let mut freed = 0;
        for &index in cset {
            let region = self.region(index);
            if failed.contains(&index) {
                region.set_old();
                region.set_in_collection_set(false);
                region.set_young_index_in_cset(-1);
                region.reset_claim();
                if region.membership() != Membership::Old {
                    self.sets.lock().old.add(region);
                }
            } else {
                self.free_region(index);
                freed += 1;
            }
        }
        freed
    }

    /// Start the next incremental collection set with this pause's
    /// survivors.
    fn rebuild_incremental_cset(&self) {
        let survivors = self.young_list.lock().survivors().to_vec();
        let policy = self.policy.lock();
        let mut cset = self.cset.lock();
        cset.start_incremental_building();
        for index in survivors {
            let region = self.region(index);
            let predicted =
                policy.predict_region_time_ms(true, region.used(), None, region.rem_set().occupied());
            cset.add_young_region(region, predicted);
        }
    }

    fn update_policy_after_pause(
        &self,
        metrics: &PauseMetrics,
        young_bytes: usize,
        surviving_young_words: usize,
        age_table: AgeTable,
    ) {
        let capacity = self.capacity();
        let committed = self.committed_regions();
        let available = self.free_regions() + (self.max_regions() - committed);
        let survivors = self.young_list.lock().survivor_length();
        let record = PauseRecord {
            metrics: metrics.clone(),
            young_bytes,
            surviving_young_bytes: surviving_young_words * WORD_SIZE,
            age_table,
        };
        let chooser = self.chooser.lock();
        let mut policy = self.policy.lock();
        let survivor_capacity = policy.survivor_capacity_words();
        policy.record_pause(&record, survivor_capacity, &chooser, capacity);
        policy.update_young_list_target_length(available, survivors, committed);
        drop(policy);
        drop(chooser);

        if self.need_to_start_conc_mark(0) {
            self.policy.lock().set_initiate_conc_mark_if_possible();
        }
    }

    /// Run [`Heap::verify`] if verification is enabled.
    ///
    /// # Panics
    ///
    /// Panics with the verification report if the heap is inconsistent.
    pub(crate) fn verify_or_panic(&self, when: &str) {
        if !self.config.verify {
            return;
        }
        if let Err(report) = self.verify() {
            panic!("heap verification failed {when}: {report}");
        }
    }

    /// Run an evacuation pause, calling `observer` at each reporting point.
    /// The observer runs at the safepoint and must not attach mutators.
    #[cfg(feature = "test-util")]
    pub fn collect_observed(&self, cause: GcCause, mut observer: impl FnMut(PausePhase, &Self)) -> bool {
        let mut op = VmObservedPause {
            heap: self,
            cause,
            observer: &mut observer,
            gc_count_before: self.total_collections(),
            succeeded: false,
        };
        self.execute_vm_op(&mut Detached, &mut op);
        op.succeeded
    }
}

/// Evacuation pause with an observer.
#[cfg(feature = "test-util")]
struct VmObservedPause<'h, 'o> {
    heap: &'h Heap,
    cause: GcCause,
    observer: &'o mut dyn FnMut(PausePhase, &Heap),
    gc_count_before: u32,
    succeeded: bool,
}

#[cfg(feature = "test-util")]
impl VmOperation for VmObservedPause<'_, '_> {
    fn name(&self) -> &'static str {
        "observed collection pause"
    }

    fn doit_prologue(&mut self) -> bool {
        self.gc_count_before == self.heap.total_collections()
    }

    fn doit(&mut self) {
        let heap = self.heap;
        let _safepoint = heap.enter_safepoint();
        let _heap_lock = heap.heap_lock.lock();
        self.succeeded = heap.evacuation_pause(self.cause, self.observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::heap::region::RegionKind;
    use crate::heap::Collaborators;
    use crate::object::ObjectShape;

    const REGION: usize = 256 * 1024;

    fn heap(config: HeapConfig) -> std::sync::Arc<Heap> {
        let config = config
            .with_region_size(REGION)
            .with_initial_heap_size(16 * REGION)
            .with_max_heap_size(16 * REGION)
            .with_refinement_threads(0)
            .with_initiating_heap_occupancy_percent(100)
            .with_parallel_gc_threads(2)
            .with_verify(true);
        Heap::new(config, Collaborators::default()).unwrap()
    }

    #[test]
    fn test_pause_keeps_rooted_objects_and_frees_eden() {
        let heap = heap(HeapConfig::default());
        let mut m = heap.attach();
        let kept = m.allocate(ObjectShape::plain(1, 2)).unwrap();
        let root = m.root(kept);
        for _ in 0..100 {
            m.allocate(ObjectShape::plain(0, 6)).unwrap();
        }
        m.write_word(kept, 0, 42);
        let before = heap.young_list_length();
        assert!(before >= 1);
        drop(m);

        assert!(heap.collect(GcCause::Explicit));

        let m = heap.attach();
        let moved = root.get(&m).unwrap();
        assert_ne!(moved.addr(), kept.addr());
        assert_eq!(m.read_word(moved, 0), 42);
        let region = heap.region_containing(moved.addr());
        assert_eq!(region.kind(), RegionKind::Survivor);
        assert_eq!(heap.survivor_regions(), vec![region.index()]);
        assert_eq!(heap.total_collections(), 1);
        let last = heap.history().last().unwrap();
        assert_eq!(last.totals.objects_copied, 1);
        assert!(last.regions_freed >= 1);
    }

    #[test]
    fn test_pause_refused_while_critical_section_active() {
        let locker = std::sync::Arc::new(crate::gc::gc_locker::CriticalSections::new());
        let config = HeapConfig::default()
            .with_region_size(REGION)
            .with_initial_heap_size(4 * REGION)
            .with_max_heap_size(4 * REGION)
            .with_refinement_threads(0);
        let heap = Heap::new(config, Collaborators::default().with_gc_locker(locker.clone())).unwrap();
        let section = locker.enter();
        assert!(!heap.collect(GcCause::Explicit));
        assert_eq!(heap.total_collections(), 0);
        drop(section);
        assert!(heap.collect(GcCause::Explicit));
    }
}
