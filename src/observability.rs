//! Observability seam.
//!
//! Counters, histograms, and an activity/span API behind one trait so the
//! core never depends on a specific telemetry library. `NoopObserver` is
//! the default; `RecordingObserver` captures everything for assertions in
//! tests. Exporter-backed implementations live outside the core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Label set attached to a metric observation.
pub type Tags = Vec<(&'static str, String)>;

/// A started activity; attributes may be added until it is stopped.
pub trait ActivitySpan: Send {
    fn set_attribute(&mut self, key: &'static str, value: String);
    /// Explicit stop; implementations also stop on drop.
    fn stop(self: Box<Self>);
}

/// Counters, histograms, and activities.
pub trait Observer: Send + Sync {
    fn counter(&self, name: &'static str, value: u64, tags: Tags);
    fn histogram(&self, name: &'static str, value: f64, tags: Tags);
    fn span_start(&self, name: &'static str) -> Box<dyn ActivitySpan>;
}

// ============================================================================
// No-op implementation
// ============================================================================

/// Observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

struct NoopSpan;

impl ActivitySpan for NoopSpan {
    fn set_attribute(&mut self, _key: &'static str, _value: String) {}
    fn stop(self: Box<Self>) {}
}

impl Observer for NoopObserver {
    fn counter(&self, _name: &'static str, _value: u64, _tags: Tags) {}
    fn histogram(&self, _name: &'static str, _value: f64, _tags: Tags) {}
    fn span_start(&self, _name: &'static str) -> Box<dyn ActivitySpan> {
        Box::new(NoopSpan)
    }
}

// ============================================================================
// Recording implementation
// ============================================================================

/// A finished activity captured by the recording observer.
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: &'static str,
    pub attributes: Vec<(&'static str, String)>,
}

#[derive(Default)]
struct Recorded {
    counters: HashMap<&'static str, u64>,
    histograms: HashMap<&'static str, Vec<f64>>,
    spans: Vec<RecordedSpan>,
}

/// Observer that records observations for test assertions.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &'static str) -> u64 {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn histogram_samples(&self, name: &'static str) -> Vec<f64> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .histograms
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spans
            .clone()
    }
}

struct RecordingSpan {
    name: &'static str,
    attributes: Vec<(&'static str, String)>,
    recorded: Arc<Mutex<Recorded>>,
    finished: bool,
}

impl RecordingSpan {
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
        recorded.spans.push(RecordedSpan {
            name: self.name,
            attributes: std::mem::take(&mut self.attributes),
        });
    }
}

impl ActivitySpan for RecordingSpan {
    fn set_attribute(&mut self, key: &'static str, value: String) {
        self.attributes.push((key, value));
    }

    fn stop(mut self: Box<Self>) {
        self.finish();
    }
}

impl Drop for RecordingSpan {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Observer for RecordingObserver {
    fn counter(&self, name: &'static str, value: u64, _tags: Tags) {
        let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
        *recorded.counters.entry(name).or_insert(0) += value;
    }

    fn histogram(&self, name: &'static str, value: f64, _tags: Tags) {
        let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
        recorded.histograms.entry(name).or_default().push(value);
    }

    fn span_start(&self, name: &'static str) -> Box<dyn ActivitySpan> {
        Box::new(RecordingSpan {
            name,
            attributes: Vec::new(),
            recorded: Arc::clone(&self.recorded),
            finished: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_counts() {
        let observer = RecordingObserver::new();
        observer.counter("processed", 1, vec![]);
        observer.counter("processed", 2, vec![]);
        observer.histogram("duration_ms", 12.5, vec![]);

        assert_eq!(observer.counter_value("processed"), 3);
        assert_eq!(observer.histogram_samples("duration_ms"), vec![12.5]);
        assert_eq!(observer.counter_value("missing"), 0);
    }

    #[test]
    fn test_span_records_on_stop_and_on_drop() {
        let observer = RecordingObserver::new();

        let mut span = observer.span_start("dispatch");
        span.set_attribute("destination", "orders".to_string());
        span.stop();

        {
            let _dropped = observer.span_start("implicit");
        }

        let spans = observer.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].name, "dispatch");
        assert_eq!(spans[0].attributes[0].1, "orders");
        assert_eq!(spans[1].name, "implicit");
    }

    #[test]
    fn test_noop_observer_is_silent() {
        let observer = NoopObserver;
        observer.counter("anything", 1, vec![]);
        let mut span = observer.span_start("anything");
        span.set_attribute("k", "v".to_string());
        span.stop();
    }
}
