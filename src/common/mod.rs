//! Core types shared by every layer: streams, packets, ranges, counters.

pub mod packet;
pub mod ranges;
pub mod reporter;
pub mod sni;
pub mod speedometer;
pub mod stream;
pub mod traffic;

pub use packet::{IpPacket, IpProtocol, IpVersion};
pub use ranges::IpRangeFilter;
pub use reporter::EventReporter;
pub use sni::DomainFilter;
pub use speedometer::Speedometer;
pub use stream::{IntoStream, Stream};
pub use traffic::{format_bytes, Traffic, TrafficMeter};
