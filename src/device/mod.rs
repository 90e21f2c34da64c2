//! External device seams
//!
//! The TUN adapter driver and the raw socket factory live outside this
//! crate; the tunnel core consumes them through these traits. The
//! in-memory implementations back the end-to-end tests and any embedder
//! that wants a userspace-only deployment.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::channel::PacketSink;
use crate::common::{IpPacket, IpVersion};
use crate::error::{Error, Result};

/// A virtual network interface delivering whole IP packets.
///
/// `send` pushes a packet toward the OS; packets arriving from the OS are
/// published into the sink registered with `set_sink`.
pub trait TunAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn mtu(&self) -> u16;

    fn supports(&self, version: IpVersion) -> bool;

    /// Hand a packet to the adapter (toward the OS network stack).
    fn send(&self, packet: IpPacket) -> Result<()>;

    /// Register the single receiver for packets coming out of the adapter.
    fn set_sink(&self, sink: PacketSink);
}

/// Creates the outbound sockets the proxy pools NAT through.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// An ephemeral UDP socket on the public interface.
    async fn bind_udp(&self, v6: bool) -> Result<UdpSocket>;

    /// An ICMP echo handle. Raw sockets need platform privileges, so the
    /// system factory only provides this where the embedder wires one in.
    async fn open_icmp(&self, v6: bool) -> Result<Box<dyn IcmpSocket>>;
}

/// An ICMP echo handle: send requests, await replies.
#[async_trait]
pub trait IcmpSocket: Send + Sync {
    async fn send_echo(&self, dst: IpAddr, id: u16, seq: u16, payload: &[u8]) -> Result<()>;

    async fn recv_echo_reply(&self) -> Result<EchoReply>;
}

#[derive(Debug, Clone)]
pub struct EchoReply {
    pub from: IpAddr,
    pub id: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Factory over the host network stack. ICMP is unavailable here; a
/// platform integration supplies it.
pub struct SystemSocketFactory;

#[async_trait]
impl SocketFactory for SystemSocketFactory {
    async fn bind_udp(&self, v6: bool) -> Result<UdpSocket> {
        let bind_addr = if v6 { "[::]:0" } else { "0.0.0.0:0" };
        Ok(UdpSocket::bind(bind_addr).await?)
    }

    async fn open_icmp(&self, _v6: bool) -> Result<Box<dyn IcmpSocket>> {
        Err(Error::Config(
            "raw ICMP sockets require a platform socket factory".into(),
        ))
    }
}

/// Socket factory whose ICMP handles answer their own echoes, as if every
/// destination were reachable. Used by tests and demos.
pub struct LoopbackSocketFactory;

#[async_trait]
impl SocketFactory for LoopbackSocketFactory {
    async fn bind_udp(&self, v6: bool) -> Result<UdpSocket> {
        let bind_addr = if v6 { "[::1]:0" } else { "127.0.0.1:0" };
        Ok(UdpSocket::bind(bind_addr).await?)
    }

    async fn open_icmp(&self, _v6: bool) -> Result<Box<dyn IcmpSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(LoopbackIcmpSocket {
            replies: tokio::sync::Mutex::new(rx),
            sender: tx,
        }))
    }
}

struct LoopbackIcmpSocket {
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<EchoReply>>,
    sender: mpsc::UnboundedSender<EchoReply>,
}

#[async_trait]
impl IcmpSocket for LoopbackIcmpSocket {
    async fn send_echo(&self, dst: IpAddr, id: u16, seq: u16, payload: &[u8]) -> Result<()> {
        let _ = self.sender.send(EchoReply {
            from: dst,
            id,
            seq,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn recv_echo_reply(&self) -> Result<EchoReply> {
        self.replies
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ChannelClosed)
    }
}

/// In-memory TUN adapter backed by channels; the "OS side" is the test.
pub struct InMemoryTunAdapter {
    name: String,
    mtu: u16,
    ipv6: bool,
    sink: RwLock<Option<PacketSink>>,
    outbound_tx: mpsc::UnboundedSender<IpPacket>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IpPacket>>,
}

impl InMemoryTunAdapter {
    pub fn new(name: impl Into<String>, mtu: u16, ipv6: bool) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.into(),
            mtu,
            ipv6,
            sink: RwLock::new(None),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        })
    }

    /// Simulate a packet arriving from the OS network stack.
    pub fn inject(&self, packet: IpPacket) {
        if let Some(sink) = self.sink.read().as_ref() {
            sink(packet);
        }
    }

    /// Await the next packet the tunnel pushed toward the OS.
    pub async fn next_outbound(&self) -> Option<IpPacket> {
        self.outbound_rx.lock().await.recv().await
    }
}

impl TunAdapter for InMemoryTunAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn supports(&self, version: IpVersion) -> bool {
        match version {
            IpVersion::V4 => true,
            IpVersion::V6 => self.ipv6,
        }
    }

    fn send(&self, packet: IpPacket) -> Result<()> {
        self.outbound_tx
            .send(packet)
            .map_err(|_| Error::ChannelClosed)
    }

    fn set_sink(&self, sink: PacketSink) {
        *self.sink.write() = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn in_memory_adapter_moves_packets_both_ways() {
        let adapter = InMemoryTunAdapter::new("tun-test", 1420, false);
        assert!(adapter.supports(IpVersion::V4));
        assert!(!adapter.supports(IpVersion::V6));

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.set_sink(Arc::new(move |packet| {
            let _ = tx.send(packet);
        }));

        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 0, 0, 1), 1),
            (Ipv4Addr::new(10, 0, 0, 2), 2),
            b"x",
        )
        .unwrap();

        adapter.inject(packet.clone());
        assert_eq!(rx.recv().await.unwrap().as_bytes(), packet.as_bytes());

        adapter.send(packet.clone()).unwrap();
        assert_eq!(
            adapter.next_outbound().await.unwrap().as_bytes(),
            packet.as_bytes()
        );
    }

    #[tokio::test]
    async fn loopback_icmp_answers_itself() {
        let factory = LoopbackSocketFactory;
        let icmp = factory.open_icmp(false).await.unwrap();
        icmp.send_echo("10.255.0.1".parse().unwrap(), 7, 1, b"ping")
            .await
            .unwrap();
        let reply = icmp.recv_echo_reply().await.unwrap();
        assert_eq!(reply.id, 7);
        assert_eq!(reply.payload, b"ping");
    }
}
