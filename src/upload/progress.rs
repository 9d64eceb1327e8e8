//! Throttled, monotonic transfer progress

use std::sync::Arc;

use parking_lot::Mutex;

use crate::events::{EventBus, ProgressEvent};

/// Publishes `upload:progress` for one file.
///
/// Reported values never decrease, and a new event is only emitted once the
/// value has moved by at least `step` percent. The first report and 100 are
/// always emitted.
pub struct ProgressReporter {
    filename: String,
    step: u8,
    last: Mutex<Option<u8>>,
    events: Arc<EventBus>,
}

impl ProgressReporter {
    pub fn new(events: Arc<EventBus>, filename: impl Into<String>, step: u8) -> Self {
        Self {
            filename: filename.into(),
            step: step.max(1),
            last: Mutex::new(None),
            events,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Report `percent`. Returns whether an event was emitted
    pub fn report(&self, percent: u8) -> bool {
        let percent = percent.min(100);
        {
            let mut last = self.last.lock();
            let emit = match *last {
                None => true,
                Some(prev) if percent <= prev => false,
                Some(_) if percent == 100 => true,
                Some(prev) => percent - prev >= self.step,
            };
            if !emit {
                return false;
            }
            *last = Some(percent);
        }

        self.events.progress(ProgressEvent::new(self.filename.clone(), percent));
        true
    }

    /// Report a byte count against a total
    pub fn report_bytes(&self, sent: u64, total: u64) -> bool {
        let percent = if total == 0 {
            100
        } else {
            (sent.min(total) * 100 / total) as u8
        };
        self.report(percent)
    }

    pub fn complete(&self) -> bool {
        self.report(100)
    }

    /// Last value emitted
    pub fn last(&self) -> Option<u8> {
        *self.last.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, UploadEvent};

    fn recorded(bus: &EventBus) -> Arc<Mutex<Vec<u8>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(EventKind::UploadProgress, move |event| {
            if let UploadEvent::Progress(p) = event {
                sink.lock().push(p.progress);
            }
        });
        seen
    }

    #[test]
    fn test_reports_are_monotonic_and_throttled() {
        let bus = Arc::new(EventBus::new());
        let seen = recorded(&bus);
        let reporter = ProgressReporter::new(bus, "a.png", 10);

        for p in [0u8, 3, 9, 10, 25, 20, 26, 40, 99, 100, 100] {
            reporter.report(p);
        }

        assert_eq!(*seen.lock(), vec![0, 10, 25, 40, 99, 100]);
        assert_eq!(reporter.last(), Some(100));
    }

    #[test]
    fn test_byte_progress() {
        let bus = Arc::new(EventBus::new());
        let seen = recorded(&bus);
        let reporter = ProgressReporter::new(bus, "a.png", 25);

        reporter.report_bytes(10, 100);
        reporter.report_bytes(50, 100);
        reporter.report_bytes(60, 100);
        reporter.report_bytes(100, 100);

        assert_eq!(*seen.lock(), vec![10, 50, 100]);
    }

    #[test]
    fn test_empty_total_completes() {
        let bus = Arc::new(EventBus::new());
        let reporter = ProgressReporter::new(bus, "empty.png", 10);
        assert!(reporter.report_bytes(0, 0));
        assert_eq!(reporter.last(), Some(100));
    }
}
