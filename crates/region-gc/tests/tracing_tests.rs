//! Integration tests for the tracing feature: pauses and full collections
//! open spans and emit structured events on the collecting thread.

#![cfg(feature = "tracing")]

use std::fmt;
use std::sync::{Arc, Mutex};

use region_gc::{Collaborators, GcCause, Heap, HeapConfig, ObjectShape};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

#[derive(Default)]
struct Captured {
    spans: Vec<String>,
    events: Vec<String>,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Captured>>);

/// Collects the `kind`, `phase` or `step` field of a span, or the message
/// of an event.
struct Label<'a> {
    wanted: &'a [&'a str],
    value: Option<String>,
}

impl Visit for Label<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if self.wanted.contains(&field.name()) {
            self.value = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if self.wanted.contains(&field.name()) {
            self.value = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut label = Label {
            wanted: &["kind", "phase", "step"],
            value: None,
        };
        attrs.record(&mut label);
        let name = attrs.metadata().name();
        let entry = match label.value {
            Some(v) => format!("{name}:{v}"),
            None => name.to_owned(),
        };
        self.0.lock().unwrap().spans.push(entry);
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut label = Label {
            wanted: &["message"],
            value: None,
        };
        event.record(&mut label);
        if let Some(message) = label.value {
            self.0.lock().unwrap().events.push(message);
        }
    }
}

fn capture(f: impl FnOnce()) -> Captured {
    let recorder = Recorder::default();
    let subscriber = Registry::default().with(recorder.clone());
    tracing::subscriber::with_default(subscriber, f);
    let captured = std::mem::take(&mut *recorder.0.lock().unwrap());
    captured
}

fn heap() -> Arc<Heap> {
    let config = HeapConfig::default()
        .with_region_size(256 * 1024)
        .with_initial_heap_size(4 * 1024 * 1024)
        .with_max_heap_size(4 * 1024 * 1024)
        .with_refinement_threads(0)
        .with_initiating_heap_occupancy_percent(100);
    Heap::new(config, Collaborators::default()).unwrap()
}

#[test]
fn test_pause_opens_phase_spans() {
    let heap = heap();
    let mut m = heap.attach();
    let obj = m.allocate(ObjectShape::plain(0, 4)).unwrap();
    let _root = m.root(obj);
    drop(m);

    let captured = capture(|| {
        assert!(heap.collect(GcCause::Explicit));
    });
    assert!(captured.spans.contains(&"gc_pause:young".to_owned()), "{:?}", captured.spans);
    for phase in ["update_rs", "evacuate", "reference_processing", "cleanup"] {
        let span = format!("gc_phase:{phase}");
        assert!(captured.spans.contains(&span), "missing {span}");
    }
    assert!(captured.events.iter().any(|e| e == "pause_end"), "{:?}", captured.events);
}

#[test]
fn test_full_collection_events() {
    let heap = heap();
    let captured = capture(|| {
        assert!(heap.full_collect(true));
    });
    assert!(captured.spans.contains(&"gc_pause:full".to_owned()));
    let start = captured.events.iter().position(|e| e == "full_gc_start");
    let end = captured.events.iter().position(|e| e == "full_gc_end");
    assert!(start.is_some() && end.is_some());
    assert!(start < end);
}

#[test]
fn test_humongous_allocation_event() {
    let heap = heap();
    let captured = capture(|| {
        heap.humongous_obj_allocate(200 * 1024 / 8).unwrap();
    });
    assert!(captured.events.iter().any(|e| e == "humongous_allocated"));
}
