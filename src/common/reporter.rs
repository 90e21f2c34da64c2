//! Bounded, de-duplicating event reporter
//!
//! Per-packet failures (drops, filter rejections, scan limits) can fire
//! thousands of times a second. The reporter counts every event but emits
//! at most one log line per key within the de-dup window, with the count
//! accumulated since the last emission.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// De-dup window between log lines for the same key
const DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// Keys tracked before the oldest are pruned
const MAX_KEYS: usize = 256;

struct EventState {
    pending: u64,
    total: u64,
    last_logged: Option<Instant>,
    last_seen: Instant,
}

pub struct EventReporter {
    scope: &'static str,
    events: Mutex<HashMap<String, EventState>>,
}

impl EventReporter {
    pub fn new(scope: &'static str) -> Self {
        Self {
            scope,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Count an event and maybe emit a log line for it.
    pub fn report(&self, key: &str, detail: &str) {
        self.report_at(Instant::now(), key, detail)
    }

    fn report_at(&self, now: Instant, key: &str, detail: &str) {
        let mut events = self.events.lock();
        if events.len() >= MAX_KEYS && !events.contains_key(key) {
            let oldest = events
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                events.remove(&oldest);
            }
        }

        let state = events.entry(key.to_string()).or_insert(EventState {
            pending: 0,
            total: 0,
            last_logged: None,
            last_seen: now,
        });
        state.pending += 1;
        state.total += 1;
        state.last_seen = now;

        let due = match state.last_logged {
            None => true,
            Some(at) => now.duration_since(at) >= DEDUP_WINDOW,
        };
        if due {
            warn!(
                "[{}] {}: {} ({} in window, {} total)",
                self.scope, key, detail, state.pending, state.total
            );
            state.pending = 0;
            state.last_logged = Some(now);
        }
    }

    /// Total count for a key.
    pub fn count(&self, key: &str) -> u64 {
        self.events.lock().get(key).map(|s| s.total).unwrap_or(0)
    }

    #[cfg(test)]
    fn pending(&self, key: &str) -> u64 {
        self.events.lock().get(key).map(|s| s.pending).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_within_window() {
        let reporter = EventReporter::new("test");
        let t0 = Instant::now();

        reporter.report_at(t0, "packet_drop", "queue full");
        // First report logs immediately, resetting pending
        assert_eq!(reporter.pending("packet_drop"), 0);

        reporter.report_at(t0 + Duration::from_secs(1), "packet_drop", "queue full");
        reporter.report_at(t0 + Duration::from_secs(2), "packet_drop", "queue full");
        assert_eq!(reporter.pending("packet_drop"), 2);
        assert_eq!(reporter.count("packet_drop"), 3);

        // Past the window the pending count is flushed by the next report
        reporter.report_at(t0 + Duration::from_secs(11), "packet_drop", "queue full");
        assert_eq!(reporter.pending("packet_drop"), 0);
        assert_eq!(reporter.count("packet_drop"), 4);
    }

    #[test]
    fn keys_are_bounded() {
        let reporter = EventReporter::new("test");
        let t0 = Instant::now();
        for i in 0..(MAX_KEYS + 10) {
            reporter.report_at(t0 + Duration::from_millis(i as u64), &format!("key-{}", i), "x");
        }
        assert!(reporter.events.lock().len() <= MAX_KEYS);
        // The newest key survived, the oldest was pruned
        assert_eq!(reporter.count(&format!("key-{}", MAX_KEYS + 9)), 1);
        assert_eq!(reporter.count("key-0"), 0);
    }
}
