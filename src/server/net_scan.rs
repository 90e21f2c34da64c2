//! NetScan detector
//!
//! Limits how many distinct destination endpoints one session may contact
//! within a sliding window. Port scanners and worms touch hundreds of
//! unique endpoints per minute; ordinary clients do not.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::common::IpProtocol;

pub struct NetScanDetector {
    /// Maximum distinct destinations per window; 0 disables the detector
    limit: usize,
    window: Duration,
    seen: Mutex<HashMap<(u8, SocketAddr), Instant>>,
}

impl NetScanDetector {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Admit or reject a destination. Known destinations refresh their
    /// window slot; new ones are rejected once the window is full.
    pub fn verify(&self, protocol: IpProtocol, destination: SocketAddr) -> bool {
        self.verify_at(Instant::now(), protocol, destination)
    }

    fn verify_at(&self, now: Instant, protocol: IpProtocol, destination: SocketAddr) -> bool {
        if self.limit == 0 {
            return true;
        }
        let key = (protocol.number(), destination);
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < self.window);

        if let Some(at) = seen.get_mut(&key) {
            *at = now;
            return true;
        }
        if seen.len() >= self.limit {
            return false;
        }
        seen.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(n: u8) -> SocketAddr {
        format!("10.0.0.{}:80", n).parse().unwrap()
    }

    #[test]
    fn limit_blocks_new_destinations() {
        let detector = NetScanDetector::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        for n in 1..=3 {
            assert!(detector.verify_at(t0, IpProtocol::Tcp, endpoint(n)));
        }
        assert!(!detector.verify_at(t0, IpProtocol::Tcp, endpoint(4)));

        // Revisiting a known destination is fine
        assert!(detector.verify_at(t0, IpProtocol::Tcp, endpoint(2)));
    }

    #[test]
    fn window_expiry_frees_slots() {
        let detector = NetScanDetector::new(2, Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(detector.verify_at(t0, IpProtocol::Udp, endpoint(1)));
        assert!(detector.verify_at(t0, IpProtocol::Udp, endpoint(2)));
        assert!(!detector.verify_at(t0, IpProtocol::Udp, endpoint(3)));

        let later = t0 + Duration::from_secs(11);
        assert!(detector.verify_at(later, IpProtocol::Udp, endpoint(3)));
    }

    #[test]
    fn protocols_count_separately() {
        let detector = NetScanDetector::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(detector.verify_at(t0, IpProtocol::Tcp, endpoint(1)));
        assert!(detector.verify_at(t0, IpProtocol::Tcp, endpoint(1)));
        assert!(!detector.verify_at(t0, IpProtocol::Udp, endpoint(2)));
    }

    #[test]
    fn zero_limit_disables() {
        let detector = NetScanDetector::new(0, Duration::from_secs(60));
        assert!(!detector.is_enabled());
        let t0 = Instant::now();
        for n in 0..50 {
            assert!(detector.verify_at(t0, IpProtocol::Tcp, endpoint(n)));
        }
    }
}
