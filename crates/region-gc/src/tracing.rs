//! GC tracing support.
//!
//! With the `tracing` feature enabled this module emits structured spans
//! and events for pauses, marking, refinement and heap sizing. Without the
//! feature every entry point keeps its signature and does nothing, except
//! [`TraceTime`] accumulators which are still updated.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stable identifier for a collection.
///
/// Pauses, full collections and marking cycles of one heap draw from the
/// same monotonically increasing counter, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

impl fmt::Display for GcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GC({})", self.0)
    }
}

/// Per-heap [`GcId`] source.
#[derive(Debug)]
pub struct GcIdSource(AtomicU64);

impl GcIdSource {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Generate the next id.
    pub fn next_id(&self) -> GcId {
        GcId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A set of log tags selecting [`TraceTime`] guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct LogTags(u32);

impl LogTags {
    /// No tags.
    pub const NONE: Self = Self(0);
    /// Pause level timing.
    pub const GC: Self = Self(1 << 0);
    /// Individual pause phases.
    pub const PHASES: Self = Self(1 << 1);
    /// Collection set selection.
    pub const CSET: Self = Self(1 << 2);
    /// Mutator allocation slow paths.
    pub const ALLOC: Self = Self(1 << 3);
    /// Concurrent refinement.
    pub const REFINE: Self = Self(1 << 4);
    /// Concurrent marking.
    pub const MARKING: Self = Self(1 << 5);
    /// Heap expansion and shrinking.
    pub const HEAP: Self = Self(1 << 6);
    /// Reference processing.
    pub const REF: Self = Self(1 << 7);
    /// Every tag.
    pub const ALL: Self = Self(u32::MAX);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every tag in `other` is also in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share a tag.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for LogTags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LogTags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Scoped timer that logs on drop.
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use region_gc::{LogTags, TraceTime};
///
/// let total = AtomicU64::new(0);
/// {
///     let _t = TraceTime::new("scan roots", LogTags::PHASES, true).accumulate_into(&total);
/// }
/// println!("scan roots took {}ns", total.load(Ordering::Relaxed));
/// ```
#[must_use = "the timer stops when dropped"]
pub struct TraceTime<'a> {
    title: &'static str,
    tags: LogTags,
    enabled: bool,
    start: Instant,
    accumulator: Option<&'a AtomicU64>,
}

impl<'a> TraceTime<'a> {
    /// Start timing `title`.
    pub fn new(title: &'static str, tags: LogTags, enabled: bool) -> Self {
        Self {
            title,
            tags,
            enabled,
            start: Instant::now(),
            accumulator: None,
        }
    }

    /// Start timing `title` if `tags` is enabled in `config_tags`.
    pub fn for_tags(title: &'static str, tags: LogTags, config_tags: LogTags) -> Self {
        Self::new(title, tags, config_tags.intersects(tags))
    }

    /// Add the elapsed nanoseconds to `acc` on drop.
    pub const fn accumulate_into(mut self, acc: &'a AtomicU64) -> Self {
        self.accumulator = Some(acc);
        self
    }

    /// Time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TraceTime<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if let Some(acc) = self.accumulator {
            acc.fetch_add(
                elapsed.as_nanos().try_into().unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
        }
        if self.enabled {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                title = self.title,
                tags = self.tags.bits(),
                elapsed_us = elapsed.as_micros() as u64,
                "trace_time"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = (self.title, self.tags);
        }
    }
}

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    use super::GcId;
    use crate::gc::GcCause;

    /// Entered span guard.
    pub type SpanGuard = span::EnteredSpan;

    /// Create a span for an evacuation pause or a full collection.
    pub fn trace_gc_pause(kind: &'static str, cause: GcCause, gc_id: GcId) -> SpanGuard {
        span!(
            Level::DEBUG,
            "gc_pause",
            kind = kind,
            cause = ?cause,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a child span for one pause phase.
    pub fn trace_phase(phase: &'static str) -> SpanGuard {
        span!(Level::DEBUG, "gc_phase", phase = phase).entered()
    }

    /// Create a span for a marking cycle step.
    pub fn trace_marking(step: &'static str, gc_id: GcId) -> SpanGuard {
        span!(Level::DEBUG, "marking", step = step, gc_id = gc_id.0).entered()
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) mod internal {
    use super::GcId;
    use crate::gc::GcCause;

    /// Stub span guard.
    pub struct SpanGuard;

    pub fn trace_gc_pause(_kind: &'static str, _cause: GcCause, _gc_id: GcId) -> SpanGuard {
        SpanGuard
    }

    pub fn trace_phase(_phase: &'static str) -> SpanGuard {
        SpanGuard
    }

    pub fn trace_marking(_step: &'static str, _gc_id: GcId) -> SpanGuard {
        SpanGuard
    }
}

pub(crate) use internal::{trace_gc_pause, trace_marking, trace_phase};

/// Structured events. Each compiles to nothing without the `tracing` feature.
pub(crate) mod events {
    use super::GcId;

    pub fn heap_expanded(regions: usize, committed: usize) {
        #[cfg(feature = "tracing")]
        tracing::debug!(regions, committed, "heap_expanded");
        #[cfg(not(feature = "tracing"))]
        let _ = (regions, committed);
    }

    pub fn heap_shrunk(regions: usize, committed: usize) {
        #[cfg(feature = "tracing")]
        tracing::debug!(regions, committed, "heap_shrunk");
        #[cfg(not(feature = "tracing"))]
        let _ = (regions, committed);
    }

    pub fn expansion_failed(bytes: usize, error: &std::io::Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(bytes, %error, "expansion_failed");
        #[cfg(not(feature = "tracing"))]
        let _ = (bytes, error);
    }

    pub fn expansion_failure_fatal(report: &str) {
        #[cfg(feature = "tracing")]
        tracing::error!(report, "expansion_failure_fatal");
        #[cfg(not(feature = "tracing"))]
        eprintln!("{report}");
    }

    pub fn humongous_allocated(first: u32, regions: usize, words: usize) {
        #[cfg(feature = "tracing")]
        tracing::debug!(first, regions, words, "humongous_allocated");
        #[cfg(not(feature = "tracing"))]
        let _ = (first, regions, words);
    }

    pub fn allocation_retries(word_size: usize, tries: u32) {
        #[cfg(feature = "tracing")]
        tracing::warn!(word_size, tries, "allocation_retries");
        #[cfg(not(feature = "tracing"))]
        let _ = (word_size, tries);
    }

    pub fn cset_chosen(eden: usize, survivors: usize, old: usize, predicted_ms: f64, budget_ms: f64) {
        #[cfg(feature = "tracing")]
        tracing::debug!(eden, survivors, old, predicted_ms, budget_ms, "cset_chosen");
        #[cfg(not(feature = "tracing"))]
        let _ = (eden, survivors, old, predicted_ms, budget_ms);
    }

    pub fn evacuation_failed(gc_id: GcId, objects: usize, regions: usize) {
        #[cfg(feature = "tracing")]
        tracing::info!(gc_id = gc_id.0, objects, regions, "evacuation_failed");
        #[cfg(not(feature = "tracing"))]
        let _ = (gc_id, objects, regions);
    }

    pub fn pause_end(gc_id: GcId, used_before: usize, used_after: usize, pause_ms: f64) {
        #[cfg(feature = "tracing")]
        tracing::debug!(gc_id = gc_id.0, used_before, used_after, pause_ms, "pause_end");
        #[cfg(not(feature = "tracing"))]
        let _ = (gc_id, used_before, used_after, pause_ms);
    }

    pub fn refinement_batch(worker: usize, cards: usize) {
        #[cfg(feature = "tracing")]
        tracing::trace!(worker, cards, "refinement_batch");
        #[cfg(not(feature = "tracing"))]
        let _ = (worker, cards);
    }

    pub fn marking_started(gc_id: GcId, root_regions: usize) {
        #[cfg(feature = "tracing")]
        tracing::debug!(gc_id = gc_id.0, root_regions, "marking_started");
        #[cfg(not(feature = "tracing"))]
        let _ = (gc_id, root_regions);
    }

    pub fn marking_finished(gc_id: GcId, live_bytes: usize, freed_regions: usize, candidates: usize) {
        #[cfg(feature = "tracing")]
        tracing::debug!(gc_id = gc_id.0, live_bytes, freed_regions, candidates, "marking_finished");
        #[cfg(not(feature = "tracing"))]
        let _ = (gc_id, live_bytes, freed_regions, candidates);
    }

    pub fn marking_aborted(acknowledged: bool) {
        #[cfg(feature = "tracing")]
        tracing::debug!(acknowledged, "marking_aborted");
        #[cfg(not(feature = "tracing"))]
        let _ = acknowledged;
    }

    pub fn full_gc_start(gc_id: GcId, clear_soft_refs: bool, used: usize) {
        #[cfg(feature = "tracing")]
        tracing::info!(gc_id = gc_id.0, clear_soft_refs, used, "full_gc_start");
        #[cfg(not(feature = "tracing"))]
        let _ = (gc_id, clear_soft_refs, used);
    }

    pub fn full_gc_end(gc_id: GcId, used_before: usize, used_after: usize) {
        #[cfg(feature = "tracing")]
        tracing::info!(gc_id = gc_id.0, used_before, used_after, "full_gc_end");
        #[cfg(not(feature = "tracing"))]
        let _ = (gc_id, used_before, used_after);
    }

    pub fn heap_resized(capacity_before: usize, capacity_after: usize, free_ratio: f64) {
        #[cfg(feature = "tracing")]
        tracing::debug!(capacity_before, capacity_after, free_ratio, "heap_resized");
        #[cfg(not(feature = "tracing"))]
        let _ = (capacity_before, capacity_after, free_ratio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_ids_increase() {
        let source = GcIdSource::new();
        let a = source.next_id();
        let b = source.next_id();
        assert_eq!(a, GcId(1));
        assert!(b > a);
        assert_eq!(b.to_string(), "GC(2)");
    }

    #[test]
    fn test_log_tags_set_ops() {
        let tags = LogTags::GC | LogTags::PHASES;
        assert!(tags.contains(LogTags::GC));
        assert!(!tags.contains(LogTags::CSET));
        assert!(tags.intersects(LogTags::PHASES | LogTags::HEAP));
        assert!(LogTags::ALL.contains(tags));
        assert!(!LogTags::NONE.intersects(tags));
    }

    #[test]
    fn test_trace_time_accumulates_when_disabled() {
        let acc = AtomicU64::new(0);
        {
            let t = TraceTime::new("sleep", LogTags::GC, false).accumulate_into(&acc);
            std::thread::sleep(Duration::from_millis(2));
            assert!(t.elapsed() >= Duration::from_millis(2));
        }
        assert!(acc.load(Ordering::Relaxed) >= 2_000_000);
    }

    #[test]
    fn test_for_tags_enables_on_intersection() {
        let t = TraceTime::for_tags("x", LogTags::CSET, LogTags::CSET | LogTags::GC);
        assert!(t.enabled);
        let t = TraceTime::for_tags("x", LogTags::CSET, LogTags::GC);
        assert!(!t.enabled);
    }
}
