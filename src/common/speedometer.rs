//! Rolling throughput sampler
//!
//! The tunnel feeds cumulative traffic into the speedometer once per
//! second; `speed()` reports bytes per second over the sampled window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::traffic::Traffic;

/// Number of 1 Hz samples kept
const SAMPLE_WINDOW: usize = 10;

pub struct Speedometer {
    samples: Mutex<VecDeque<(Instant, Traffic)>>,
}

impl Speedometer {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW + 1)),
        }
    }

    /// Record a cumulative traffic snapshot.
    pub fn sample(&self, cumulative: Traffic) {
        self.sample_at(Instant::now(), cumulative)
    }

    fn sample_at(&self, at: Instant, cumulative: Traffic) {
        let mut samples = self.samples.lock();
        samples.push_back((at, cumulative));
        while samples.len() > SAMPLE_WINDOW {
            samples.pop_front();
        }
    }

    /// Current speed in bytes per second, derived from the oldest and
    /// newest samples in the window. Returns zero until two samples exist.
    pub fn speed(&self) -> Traffic {
        let samples = self.samples.lock();
        let (Some(&(t0, first)), Some(&(t1, last))) = (samples.front(), samples.back()) else {
            return Traffic::default();
        };
        let span = t1.saturating_duration_since(t0);
        if span < Duration::from_millis(100) {
            return Traffic::default();
        }
        let secs = span.as_secs_f64();
        let delta = last - first;
        Traffic {
            sent: (delta.sent as f64 / secs) as u64,
            received: (delta.received as f64 / secs) as u64,
        }
    }
}

impl Default for Speedometer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_over_window() {
        let meter = Speedometer::new();
        let start = Instant::now();
        meter.sample_at(start, Traffic::new(0, 0));
        meter.sample_at(start + Duration::from_secs(2), Traffic::new(2000, 4000));

        let speed = meter.speed();
        assert_eq!(speed.sent, 1000);
        assert_eq!(speed.received, 2000);
    }

    #[test]
    fn no_speed_from_single_sample() {
        let meter = Speedometer::new();
        meter.sample(Traffic::new(1000, 1000));
        assert_eq!(meter.speed(), Traffic::default());
    }

    #[test]
    fn window_is_bounded() {
        let meter = Speedometer::new();
        let start = Instant::now();
        for i in 0..30u64 {
            meter.sample_at(start + Duration::from_secs(i), Traffic::new(i * 100, 0));
        }
        // Only the last SAMPLE_WINDOW samples count: 900 bytes over 9 s
        assert_eq!(meter.speed().sent, 100);
    }
}
