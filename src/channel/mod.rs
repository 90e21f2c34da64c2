//! Packet and proxy channels
//!
//! A packet channel carries whole IP packets over one transport: a framed
//! byte stream handed over by the connector, or the shared UDP socket. A
//! proxy channel splices one TCP byte stream end-to-end. Channels own
//! their transport; the tunnel owns the channels.

pub mod proxy;
pub mod stream;
pub mod udp;

pub use proxy::ProxyChannel;
pub use stream::StreamPacketChannel;
pub use udp::{UdpPacketChannel, UdpTransmitter};

use std::sync::Arc;

use crate::common::{IpPacket, Traffic};
use crate::error::Result;

/// Where inbound packets go. Handlers must not block the channel's reader;
/// anything slow hands off through its own queue.
pub type PacketSink = Arc<dyn Fn(IpPacket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Stream,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Connected,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// A framed transport carrying whole IP packets.
///
/// Invariant: a channel in [`ChannelState::Closed`] accepts no packets and
/// emits none.
pub trait PacketChannel: Send + Sync {
    /// Opaque channel id, unique within the process
    fn id(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    fn state(&self) -> ChannelState;

    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Cumulative traffic carried by this channel
    fn traffic(&self) -> Traffic;

    /// Packets discarded by backpressure
    fn dropped_packets(&self) -> u64;

    /// Non-blocking enqueue. A full queue drops the newest packet and
    /// records the drop; only a closing or closed channel returns
    /// `channel_closed`.
    fn send(&self, packet: IpPacket) -> Result<()>;

    /// Begin shutdown: drain the outgoing queue, then stop both halves.
    fn close(&self);
}
