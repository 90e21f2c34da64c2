//! Included-IP-range filter
//!
//! An ordered, non-overlapping list of CIDR ranges; membership is decided
//! by binary search on the range start address. Hot callers go through the
//! cached lookup, whose map is flushed in bulk once it exceeds 65,535
//! entries.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Cache flush threshold
const MAX_CACHE_ENTRIES: usize = 65_535;

/// An ordered set of CIDR ranges with a bounded membership cache.
pub struct IpRangeFilter {
    /// Sorted by network address, overlaps merged
    ranges: Vec<IpNet>,
    cache: RwLock<HashMap<IpAddr, bool>>,
}

impl IpRangeFilter {
    /// Build a filter from arbitrary ranges. Input is sorted and
    /// overlapping or adjacent-equal entries are merged so binary search
    /// stays sound.
    pub fn new(mut ranges: Vec<IpNet>) -> Self {
        ranges.sort_by_key(|net| (is_v6(net), net.network(), net.prefix_len()));
        let mut merged: Vec<IpNet> = Vec::with_capacity(ranges.len());
        for net in ranges {
            match merged.last() {
                Some(last) if same_family(last, &net) && last.contains(&net.network()) => {
                    // fully covered by the previous range
                    if !last.contains(&net.broadcast()) {
                        merged.push(net);
                    }
                }
                _ => merged.push(net),
            }
        }
        Self {
            ranges: merged,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Parse a list of `a.b.c.d/n` strings.
    pub fn parse(items: &[String]) -> Result<Self> {
        let ranges = items
            .iter()
            .map(|s| {
                s.parse::<IpNet>()
                    .map_err(|e| Error::Config(format!("bad IP range '{}': {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(ranges))
    }

    /// A filter that matches every address.
    pub fn all() -> Self {
        Self::new(vec![
            "0.0.0.0/0".parse().unwrap(),
            "::/0".parse().unwrap(),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[IpNet] {
        &self.ranges
    }

    /// Uncached membership check via binary search.
    pub fn contains(&self, ip: IpAddr) -> bool {
        // Candidate is the last range whose network address <= ip within
        // the same family.
        let idx = self
            .ranges
            .partition_point(|net| (is_v6(net), net.network()) <= (ip.is_ipv6(), ip));
        idx.checked_sub(1)
            .map(|i| self.ranges[i].contains(&ip))
            .unwrap_or(false)
    }

    /// Cached membership check. The cache is flushed in bulk when it grows
    /// past 65,535 entries.
    pub fn contains_cached(&self, ip: IpAddr) -> bool {
        if let Some(hit) = self.cache.read().get(&ip) {
            return *hit;
        }
        let result = self.contains(ip);
        let mut cache = self.cache.write();
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }
        cache.insert(ip, result);
        result
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.read().len()
    }
}

fn is_v6(net: &IpNet) -> bool {
    matches!(net, IpNet::V6(_))
}

fn same_family(a: &IpNet, b: &IpNet) -> bool {
    is_v6(a) == is_v6(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(ranges: &[&str]) -> IpRangeFilter {
        IpRangeFilter::parse(&ranges.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn membership_basics() {
        let f = filter(&["10.0.0.0/8", "192.168.1.0/24", "2001:db8::/32"]);
        assert!(f.contains(ip("10.1.2.3")));
        assert!(f.contains(ip("192.168.1.200")));
        assert!(!f.contains(ip("192.168.2.1")));
        assert!(!f.contains(ip("11.0.0.1")));
        assert!(f.contains(ip("2001:db8::1")));
        assert!(!f.contains(ip("2001:db9::1")));
    }

    #[test]
    fn binary_search_matches_linear_scan() {
        let f = filter(&[
            "1.0.0.0/24",
            "1.0.2.0/23",
            "8.8.8.0/24",
            "100.64.0.0/10",
            "172.16.0.0/12",
            "203.0.113.0/24",
        ]);
        let probes = [
            "0.255.255.255",
            "1.0.0.0",
            "1.0.0.255",
            "1.0.1.0",
            "1.0.2.5",
            "1.0.3.255",
            "1.0.4.0",
            "8.8.8.8",
            "100.127.255.255",
            "100.128.0.0",
            "172.31.255.255",
            "172.32.0.0",
            "203.0.113.77",
            "255.255.255.255",
        ];
        for probe in probes {
            let addr = ip(probe);
            let linear = f.ranges().iter().any(|net| net.contains(&addr));
            assert_eq!(f.contains(addr), linear, "mismatch for {}", probe);
        }
    }

    #[test]
    fn family_boundaries_do_not_leak() {
        let f = filter(&["0.0.0.0/0"]);
        assert!(f.contains(ip("8.8.8.8")));
        assert!(!f.contains(ip("::1")));

        let f6 = filter(&["::/0"]);
        assert!(f6.contains(ip("::1")));
        assert!(!f6.contains(ip("8.8.8.8")));
    }

    #[test]
    fn overlaps_are_merged() {
        let f = filter(&["10.0.0.0/8", "10.1.0.0/16", "10.0.0.0/8"]);
        assert_eq!(f.ranges().len(), 1);
        assert!(f.contains(ip("10.1.2.3")));
    }

    #[test]
    fn cache_flushes_in_bulk() {
        let f = filter(&["10.0.0.0/8"]);
        for i in 0..MAX_CACHE_ENTRIES {
            let addr = IpAddr::V4(std::net::Ipv4Addr::from(0x0a00_0000u32 + i as u32));
            f.contains_cached(addr);
        }
        assert_eq!(f.cache_len(), MAX_CACHE_ENTRIES);

        // One more lookup crosses the threshold and flushes
        f.contains_cached(ip("11.0.0.1"));
        assert_eq!(f.cache_len(), 1);
    }

    #[test]
    fn cached_equals_uncached() {
        let f = filter(&["10.0.0.0/8", "2001:db8::/32"]);
        for probe in ["10.0.0.1", "11.0.0.1", "2001:db8::5", "fe80::1"] {
            let addr = ip(probe);
            assert_eq!(f.contains_cached(addr), f.contains(addr));
            // Second call hits the cache
            assert_eq!(f.contains_cached(addr), f.contains(addr));
        }
    }
}
