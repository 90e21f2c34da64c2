//! Tunnel: the packet-channel multiplexer
//!
//! One tunnel belongs to one session. Outgoing packets round-robin across
//! connected channels; incoming packets from every channel fan in to the
//! session's sink. The tunnel enforces the channel-count cap and the
//! UDP-mode invariant (exactly one UDP channel, no stream channels), and
//! its traffic always equals the sum over current and removed channels.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::channel::{ChannelKind, ChannelState, PacketChannel, PacketSink};
use crate::common::{IpPacket, Speedometer, Traffic, TrafficMeter};
use crate::error::{Error, Result};

pub struct Tunnel {
    channels: RwLock<Vec<Arc<dyn PacketChannel>>>,
    rr_index: AtomicUsize,
    max_packet_channels: AtomicUsize,
    /// Traffic and drops carried over from channels that were removed
    removed_traffic: Mutex<Traffic>,
    removed_drops: AtomicU64,
    /// Meters of proxy channels riding this session; their bytes count as
    /// tunnel traffic too
    meters: Mutex<Vec<Arc<TrafficMeter>>>,
    speedometer: Speedometer,
    sink: PacketSink,
    closed: AtomicBool,
}

impl Tunnel {
    /// Create a tunnel whose inbound packets go to `sink`, with a 1 Hz
    /// speed sampler running until the tunnel is dropped or closed.
    pub fn new(sink: PacketSink, max_packet_channels: usize) -> Arc<Self> {
        let tunnel = Arc::new(Self {
            channels: RwLock::new(Vec::new()),
            rr_index: AtomicUsize::new(0),
            max_packet_channels: AtomicUsize::new(max_packet_channels.max(1)),
            removed_traffic: Mutex::new(Traffic::default()),
            removed_drops: AtomicU64::new(0),
            meters: Mutex::new(Vec::new()),
            speedometer: Speedometer::new(),
            sink,
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&tunnel);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(tunnel) = weak.upgrade() else { break };
                if tunnel.closed.load(Ordering::Acquire) {
                    break;
                }
                tunnel.speedometer.sample(tunnel.traffic());
            }
        });

        tunnel
    }

    /// The sink channels should publish into. Cloning is cheap.
    pub fn packet_sink(&self) -> PacketSink {
        Arc::clone(&self.sink)
    }

    /// Non-blocking send: pick the next connected channel round-robin. A
    /// full channel queue drops inside the channel; no channel at all is
    /// an error the caller counts.
    pub fn send(&self, packet: IpPacket) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        let channels = self.channels.read();
        if channels.is_empty() {
            return Err(Error::ChannelClosed);
        }
        let start = self.rr_index.fetch_add(1, Ordering::Relaxed);
        let mut saw_closed = false;
        let mut packet = Some(packet);
        let mut outcome = Err(Error::ChannelClosed);
        for offset in 0..channels.len() {
            let channel = &channels[(start + offset) % channels.len()];
            match channel.state() {
                ChannelState::Connected => {
                    let Some(taken) = packet.take() else { break };
                    match channel.send(taken) {
                        Ok(()) => {
                            outcome = Ok(());
                        }
                        Err(_) => {
                            // The channel raced into closing; the packet
                            // is gone either way
                            saw_closed = true;
                        }
                    }
                    break;
                }
                ChannelState::Closing | ChannelState::Closed => {
                    saw_closed = true;
                    continue;
                }
                ChannelState::Connecting => continue,
            }
        }
        drop(channels);
        if saw_closed {
            self.collect_finished();
        }
        outcome
    }

    /// Add a channel. The cap and the UDP-mode invariant are enforced
    /// atomically with respect to `send`.
    pub fn add_channel(&self, channel: Arc<dyn PacketChannel>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            channel.close();
            return Err(Error::ChannelClosed);
        }
        let mut channels = self.channels.write();

        match channel.kind() {
            ChannelKind::Udp => {
                // UDP mode: this channel replaces everything else
                for old in channels.drain(..) {
                    old.close();
                    self.absorb(&*old);
                }
            }
            ChannelKind::Stream => {
                if channels.iter().any(|c| c.kind() == ChannelKind::Udp) {
                    channel.close();
                    return Err(Error::Protocol(
                        "stream channel rejected while in UDP mode".into(),
                    ));
                }
                let active = channels
                    .iter()
                    .filter(|c| c.state() != ChannelState::Closed)
                    .count();
                if active >= self.max_packet_channels.load(Ordering::Relaxed) {
                    channel.close();
                    return Err(Error::MaxTcpChannel);
                }
            }
        }

        debug!("tunnel adding channel {}", channel.id());
        channels.push(channel);
        Ok(())
    }

    /// Close and remove every packet channel, keeping their traffic.
    pub fn remove_all_packet_channels(&self) {
        let mut channels = self.channels.write();
        for channel in channels.drain(..) {
            channel.close();
            self.absorb(&*channel);
        }
    }

    /// Lowering the cap does not evict channels; the tunnel just stops
    /// accepting new ones until the count falls below it.
    pub fn set_max_packet_channels(&self, max: usize) {
        self.max_packet_channels.store(max.max(1), Ordering::Relaxed);
    }

    pub fn max_packet_channels(&self) -> usize {
        self.max_packet_channels.load(Ordering::Relaxed)
    }

    /// Channels not yet closed.
    pub fn channel_count(&self) -> usize {
        self.collect_finished();
        self.channels
            .read()
            .iter()
            .filter(|c| c.state() != ChannelState::Closed)
            .count()
    }

    pub fn is_udp_mode(&self) -> bool {
        self.channels
            .read()
            .iter()
            .any(|c| c.kind() == ChannelKind::Udp && c.state() != ChannelState::Closed)
    }

    /// Count a proxy channel's bytes as this tunnel's traffic. Finished
    /// meters (no other holder left) are folded into the removed totals.
    pub fn attach_meter(&self, meter: Arc<TrafficMeter>) {
        self.meters.lock().push(meter);
    }

    /// Cumulative traffic: removed channels, live channels, proxy meters.
    pub fn traffic(&self) -> Traffic {
        let mut meters = self.meters.lock();
        let mut index = 0;
        while index < meters.len() {
            if Arc::strong_count(&meters[index]) == 1 {
                let finished = meters.swap_remove(index);
                *self.removed_traffic.lock() += finished.snapshot();
            } else {
                index += 1;
            }
        }
        let metered: Traffic = meters
            .iter()
            .fold(Traffic::default(), |acc, m| acc + m.snapshot());
        drop(meters);

        let removed = *self.removed_traffic.lock();
        let live: Traffic = self
            .channels
            .read()
            .iter()
            .fold(Traffic::default(), |acc, c| acc + c.traffic());
        removed + live + metered
    }

    pub fn dropped_packets(&self) -> u64 {
        let live: u64 = self.channels.read().iter().map(|c| c.dropped_packets()).sum();
        self.removed_drops.load(Ordering::Relaxed) + live
    }

    /// Rolling send/receive speed in bytes per second.
    pub fn speed(&self) -> Traffic {
        self.speedometer.speed()
    }

    /// Close every channel and stop the sampler. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.remove_all_packet_channels();
    }

    fn absorb(&self, channel: &dyn PacketChannel) {
        *self.removed_traffic.lock() += channel.traffic();
        self.removed_drops
            .fetch_add(channel.dropped_packets(), Ordering::Relaxed);
    }

    /// Drop closed channels out of the list, folding their counters into
    /// the removed totals.
    fn collect_finished(&self) {
        let mut channels = self.channels.write();
        let mut index = 0;
        while index < channels.len() {
            if channels[index].state() == ChannelState::Closed {
                let channel = channels.swap_remove(index);
                self.absorb(&*channel);
            } else {
                index += 1;
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::stream::{StreamChannelConfig, StreamPacketChannel};
    use crate::channel::UdpTransmitter;
    use crate::common::IntoStream;
    use crate::crypto::random_key;
    use std::net::Ipv4Addr;

    fn test_packet() -> IpPacket {
        IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 0, 0, 1), 1000),
            (Ipv4Addr::new(10, 0, 0, 2), 2000),
            b"payload",
        )
        .unwrap()
    }

    fn null_sink() -> PacketSink {
        Arc::new(|_| {})
    }

    fn stream_channel(id: &str, sink: PacketSink) -> Arc<StreamPacketChannel> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        std::mem::forget(far); // keep the peer half open
        StreamPacketChannel::spawn(id, near.into_stream(), sink, StreamChannelConfig::default())
    }

    #[tokio::test]
    async fn round_robin_spreads_packets() {
        let tunnel = Tunnel::new(null_sink(), 4);
        let a = stream_channel("a", tunnel.packet_sink());
        let b = stream_channel("b", tunnel.packet_sink());
        tunnel.add_channel(a.clone()).unwrap();
        tunnel.add_channel(b.clone()).unwrap();

        for _ in 0..10 {
            tunnel.send(test_packet()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(a.traffic().sent > 0, "channel a got nothing");
        assert!(b.traffic().sent > 0, "channel b got nothing");
        assert_eq!(tunnel.traffic().sent, a.traffic().sent + b.traffic().sent);
    }

    #[tokio::test]
    async fn cap_is_enforced_without_eviction() {
        let tunnel = Tunnel::new(null_sink(), 2);
        tunnel.add_channel(stream_channel("a", tunnel.packet_sink())).unwrap();
        tunnel.add_channel(stream_channel("b", tunnel.packet_sink())).unwrap();
        assert!(matches!(
            tunnel.add_channel(stream_channel("c", tunnel.packet_sink())),
            Err(Error::MaxTcpChannel)
        ));

        // Lowering the cap keeps existing channels
        tunnel.set_max_packet_channels(1);
        assert_eq!(tunnel.channel_count(), 2);
        assert!(tunnel.add_channel(stream_channel("d", tunnel.packet_sink())).is_err());
    }

    #[tokio::test]
    async fn udp_mode_closes_stream_channels() {
        let tunnel = Tunnel::new(null_sink(), 4);
        let a = stream_channel("a", tunnel.packet_sink());
        tunnel.add_channel(a.clone()).unwrap();
        assert!(!tunnel.is_udp_mode());

        let transmitter = UdpTransmitter::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let udp = transmitter
            .create_channel(1, &random_key(), None, tunnel.packet_sink())
            .unwrap();
        tunnel.add_channel(udp).unwrap();

        assert!(tunnel.is_udp_mode());
        assert_eq!(tunnel.channel_count(), 1);
        assert_eq!(a.state(), ChannelState::Closed);

        // And no stream channel may join while UDP mode is on
        assert!(tunnel.add_channel(stream_channel("late", tunnel.packet_sink())).is_err());
    }

    #[tokio::test]
    async fn traffic_survives_channel_removal() {
        let tunnel = Tunnel::new(null_sink(), 4);
        let a = stream_channel("a", tunnel.packet_sink());
        tunnel.add_channel(a.clone()).unwrap();

        for _ in 0..3 {
            tunnel.send(test_packet()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent_before = tunnel.traffic().sent;
        assert!(sent_before > 0);

        tunnel.remove_all_packet_channels();
        assert_eq!(tunnel.channel_count(), 0);
        assert_eq!(tunnel.traffic().sent, sent_before);
    }

    #[tokio::test]
    async fn send_without_channels_fails() {
        let tunnel = Tunnel::new(null_sink(), 4);
        assert!(tunnel.send(test_packet()).is_err());
        tunnel.close();
        assert!(tunnel.send(test_packet()).is_err());
    }
}
