//! Traffic counters

use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Byte counters for one direction pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    pub fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    pub fn total(&self) -> u64 {
        self.sent + self.received
    }

    /// The same traffic seen from the other end of the wire.
    pub fn swapped(&self) -> Self {
        Self {
            sent: self.received,
            received: self.sent,
        }
    }
}

impl Add for Traffic {
    type Output = Traffic;

    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent + rhs.sent,
            received: self.received + rhs.received,
        }
    }
}

impl AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Traffic) {
        self.sent += rhs.sent;
        self.received += rhs.received;
    }
}

impl Sub for Traffic {
    type Output = Traffic;

    fn sub(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent.saturating_sub(rhs.sent),
            received: self.received.saturating_sub(rhs.received),
        }
    }
}

impl std::fmt::Display for Traffic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "\u{2191}{} \u{2193}{}",
            format_bytes(self.sent),
            format_bytes(self.received)
        )
    }
}

/// Lock-free accumulator shared between I/O tasks and samplers.
#[derive(Debug, Default)]
pub struct TrafficMeter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Traffic {
        Traffic {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_swap() {
        let a = Traffic::new(100, 40);
        let b = Traffic::new(1, 2);
        assert_eq!(a + b, Traffic::new(101, 42));
        assert_eq!(a - b, Traffic::new(99, 38));
        assert_eq!(a.swapped(), Traffic::new(40, 100));
        assert_eq!(a.total(), 140);
    }

    #[test]
    fn subtraction_saturates() {
        let a = Traffic::new(1, 1);
        let b = Traffic::new(5, 5);
        assert_eq!(a - b, Traffic::default());
    }

    #[test]
    fn meter_snapshot() {
        let meter = TrafficMeter::new();
        meter.add_sent(10);
        meter.add_received(20);
        meter.add_sent(5);
        assert_eq!(meter.snapshot(), Traffic::new(15, 20));
    }
}
