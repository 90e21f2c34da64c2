//! Local TCP proxy host
//!
//! TCP flows that do not ride the packet tunnel are looped back through
//! the OS: the outbound packet is rewritten so the connection lands on a
//! local listener (the catcher address marks these packets), the listener
//! looks the original destination up in its NAT table and splices the
//! accepted stream onto a real connection. In-range destinations are
//! carried through a server stream proxy, the rest connect out directly.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tracing::{debug, trace, warn};

use crate::channel::{PacketSink, ProxyChannel};
use crate::common::{DomainFilter, IntoStream, IpPacket, IpVersion, Stream, Traffic, TrafficMeter};
use crate::error::{Error, Result};

/// Stale NAT entries are pruned after this
const NAT_ENTRY_TTL: Duration = Duration::from_secs(300);

/// An accepted flow may briefly race its own NAT entry
const NAT_LOOKUP_WINDOW: Duration = Duration::from_millis(500);

/// How long the SNI peek waits for a flow's first segment
const SNI_PEEK_TIMEOUT: Duration = Duration::from_millis(250);

/// Opens the real connection for an intercepted flow. The session
/// provides this: in-range flows go through a server stream proxy,
/// everything else connects directly.
#[async_trait]
pub trait FlowConnector: Send + Sync {
    async fn connect(&self, destination: SocketAddr) -> Result<Stream>;
}

struct NatEntry {
    destination: SocketAddrV4,
    created: Instant,
}

pub struct TcpProxyHost {
    /// Marker address; packets to or from it belong to this host
    catcher_v4: Ipv4Addr,
    virtual_v4: RwLock<Option<Ipv4Addr>>,
    listener_port: AtomicU16,
    nat: Mutex<HashMap<u16, NatEntry>>,
    device_sink: RwLock<Option<PacketSink>>,
    flow_connector: RwLock<Option<Arc<dyn FlowConnector>>>,
    domain_filter: DomainFilter,
    buffer_size: usize,
    meter: Arc<TrafficMeter>,
}

impl TcpProxyHost {
    pub fn new(catcher_v4: Ipv4Addr, blocked_domains: &[String], buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            catcher_v4,
            virtual_v4: RwLock::new(None),
            listener_port: AtomicU16::new(0),
            nat: Mutex::new(HashMap::new()),
            device_sink: RwLock::new(None),
            flow_connector: RwLock::new(None),
            domain_filter: DomainFilter::new(blocked_domains),
            buffer_size,
            meter: Arc::new(TrafficMeter::new()),
        })
    }

    pub fn traffic(&self) -> Traffic {
        self.meter.snapshot()
    }

    /// Bind the listener and start accepting intercepted flows.
    pub async fn start(
        self: &Arc<Self>,
        virtual_v4: Ipv4Addr,
        device_sink: PacketSink,
        flow_connector: Arc<dyn FlowConnector>,
    ) -> Result<()> {
        *self.virtual_v4.write() = Some(virtual_v4);
        *self.device_sink.write() = Some(device_sink);
        *self.flow_connector.write() = Some(flow_connector);

        if self.listener_port.load(Ordering::Acquire) != 0 {
            return Ok(()); // already listening; a reconnect reuses it
        }
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        self.listener_port.store(port, Ordering::Release);
        debug!("tcp proxy host listening on port {}", port);

        let host = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let Some(host) = host.upgrade() else { break };
                tokio::spawn(async move {
                    if let Err(e) = host.handle_flow(stream, peer).await {
                        trace!("intercepted flow from {} ended: {}", peer, e);
                    }
                });
            }
        });
        Ok(())
    }

    /// Does this packet belong to the catcher loop?
    pub fn is_catcher_packet(&self, packet: &IpPacket) -> bool {
        packet.version() == IpVersion::V4
            && (packet.source() == IpAddr::V4(self.catcher_v4)
                || packet.destination() == IpAddr::V4(self.catcher_v4))
    }

    /// First leg: an outbound TCP packet is redirected onto the listener
    /// and its original destination remembered under the source port.
    pub fn process_outbound(&self, mut packet: IpPacket) -> Result<()> {
        let virtual_v4 = (*self.virtual_v4.read())
            .ok_or_else(|| Error::Config("tcp proxy host not started".into()))?;
        let listener_port = self.listener_port.load(Ordering::Acquire);
        if listener_port == 0 {
            return Err(Error::Config("tcp proxy host not started".into()));
        }

        let (IpAddr::V4(dst), Some(dst_port)) = (packet.destination(), packet.destination_port())
        else {
            return Err(Error::PacketDrop);
        };
        let src_port = packet.source_port().ok_or(Error::PacketDrop)?;

        {
            let mut nat = self.nat.lock();
            nat.retain(|_, entry| entry.created.elapsed() < NAT_ENTRY_TTL);
            nat.insert(
                src_port,
                NatEntry {
                    destination: SocketAddrV4::new(dst, dst_port),
                    created: Instant::now(),
                },
            );
        }

        packet.rewrite_source_v4(self.catcher_v4, None)?;
        packet.rewrite_destination_v4(virtual_v4, Some(listener_port))?;
        self.to_device(packet)
    }

    /// Return leg: a packet from the listener back toward the catcher is
    /// restored to look like it came from the original destination.
    pub fn process_catcher_packet(&self, mut packet: IpPacket) -> Result<()> {
        let virtual_v4 = (*self.virtual_v4.read())
            .ok_or_else(|| Error::Config("tcp proxy host not started".into()))?;
        let client_port = packet.destination_port().ok_or(Error::PacketDrop)?;
        let destination = self
            .nat
            .lock()
            .get(&client_port)
            .map(|entry| entry.destination)
            .ok_or(Error::PacketDrop)?;

        packet.rewrite_source_v4(*destination.ip(), Some(destination.port()))?;
        packet.rewrite_destination_v4(virtual_v4, Some(client_port))?;
        self.to_device(packet)
    }

    fn to_device(&self, packet: IpPacket) -> Result<()> {
        let sink = self.device_sink.read();
        let sink = sink
            .as_ref()
            .ok_or_else(|| Error::Config("tcp proxy host not started".into()))?;
        sink(packet);
        Ok(())
    }

    /// One accepted flow: NAT lookup, SNI peek, connect, splice.
    async fn handle_flow(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;

        // The SYN we rewrote races our own bookkeeping; poll briefly
        let deadline = tokio::time::Instant::now() + NAT_LOOKUP_WINDOW;
        let destination = loop {
            if let Some(destination) = self
                .nat
                .lock()
                .get(&peer.port())
                .map(|entry| entry.destination)
            {
                break destination;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("no NAT entry for intercepted flow from {}", peer);
                return Err(Error::PacketDrop);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        let mut upstream: Stream = stream.into_stream();

        // The single allowed layer-7 peek: TLS SNI on the first segment
        let mut first_segment = vec![0u8; 16 * 1024];
        let peeked = match tokio::time::timeout(SNI_PEEK_TIMEOUT, async {
            use tokio::io::AsyncReadExt;
            upstream.read(&mut first_segment).await
        })
        .await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => 0,
        };
        first_segment.truncate(peeked);

        if let Some(domain) = self.domain_filter.check_first_segment(&first_segment) {
            debug!("flow to {} blocked by domain filter ({})", destination, domain);
            return Err(Error::NetFilter(domain));
        }

        let connector = self
            .flow_connector
            .read()
            .clone()
            .ok_or_else(|| Error::Config("tcp proxy host not started".into()))?;
        let mut downstream = connector.connect(SocketAddr::V4(destination)).await?;

        if !first_segment.is_empty() {
            use tokio::io::AsyncWriteExt;
            downstream.write_all(&first_segment).await?;
            downstream.flush().await?;
        }

        let channel = ProxyChannel::new(format!("host-{}", peer.port()), self.buffer_size);
        let traffic = channel.run(upstream, downstream).await;
        self.meter.add_sent(traffic.sent);
        self.meter.add_received(traffic.received);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn test_host() -> Arc<TcpProxyHost> {
        TcpProxyHost::new(Ipv4Addr::new(10, 254, 254, 254), &[], 4096)
    }

    fn collecting_sink() -> (PacketSink, mpsc::UnboundedReceiver<IpPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: PacketSink = Arc::new(move |packet| {
            let _ = tx.send(packet);
        });
        (sink, rx)
    }

    struct DirectConnector;

    #[async_trait]
    impl FlowConnector for DirectConnector {
        async fn connect(&self, destination: SocketAddr) -> Result<Stream> {
            Ok(tokio::net::TcpStream::connect(destination)
                .await?
                .into_stream())
        }
    }

    fn tcp_packet(
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
    ) -> IpPacket {
        // A minimal TCP header is enough for rewrite tests
        let mut raw = IpPacket::build_udp_v4(src, dst, &[0u8; 12]).unwrap().into_bytes();
        raw[9] = 6;
        let mut packet = IpPacket::new(raw).unwrap();
        packet.update_checksums();
        packet
    }

    #[tokio::test]
    async fn outbound_and_return_rewrites() {
        let host = test_host();
        let (sink, mut device) = collecting_sink();
        let virtual_ip = Ipv4Addr::new(10, 255, 0, 2);
        host.start(virtual_ip, sink, Arc::new(DirectConnector))
            .await
            .unwrap();

        let remote = Ipv4Addr::new(93, 184, 216, 34);
        let listener_port = host.listener_port.load(Ordering::Acquire);

        // Outbound: virtual:40000 -> remote:443 becomes catcher:40000 ->
        // virtual:listener
        host.process_outbound(tcp_packet((virtual_ip, 40000), (remote, 443)))
            .unwrap();
        let rewritten = device.recv().await.unwrap();
        assert_eq!(rewritten.source(), IpAddr::V4(host.catcher_v4));
        assert_eq!(rewritten.source_port(), Some(40000));
        assert_eq!(rewritten.destination(), IpAddr::V4(virtual_ip));
        assert_eq!(rewritten.destination_port(), Some(listener_port));

        // Return: virtual:listener -> catcher:40000 is restored to
        // remote:443 -> virtual:40000
        host.process_catcher_packet(tcp_packet(
            (virtual_ip, listener_port),
            (host.catcher_v4, 40000),
        ))
        .unwrap();
        let restored = device.recv().await.unwrap();
        assert_eq!(restored.source(), IpAddr::V4(remote));
        assert_eq!(restored.source_port(), Some(443));
        assert_eq!(restored.destination(), IpAddr::V4(virtual_ip));
        assert_eq!(restored.destination_port(), Some(40000));
    }

    #[tokio::test]
    async fn catcher_detection() {
        let host = test_host();
        let catcher = host.catcher_v4;
        assert!(host.is_catcher_packet(&tcp_packet((catcher, 1), (Ipv4Addr::new(1, 1, 1, 1), 2))));
        assert!(host.is_catcher_packet(&tcp_packet((Ipv4Addr::new(1, 1, 1, 1), 1), (catcher, 2))));
        assert!(!host.is_catcher_packet(&tcp_packet(
            (Ipv4Addr::new(10, 0, 0, 1), 1),
            (Ipv4Addr::new(1, 1, 1, 1), 2)
        )));
    }

    #[tokio::test]
    async fn intercepted_flow_is_spliced_to_its_destination() {
        // A local echo server plays the original destination
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let host = test_host();
        host.start(
            Ipv4Addr::new(10, 255, 0, 2),
            Arc::new(|_| {}),
            Arc::new(DirectConnector),
        )
        .await
        .unwrap();
        let listener_port = host.listener_port.load(Ordering::Acquire);

        // Connect to the host listener the way a rewritten flow would,
        // then register the NAT entry for our ephemeral port
        let mut flow = tokio::net::TcpStream::connect(("127.0.0.1", listener_port))
            .await
            .unwrap();
        let local_port = flow.local_addr().unwrap().port();
        let SocketAddr::V4(echo_v4) = echo_addr else { panic!() };
        host.nat.lock().insert(
            local_port,
            NatEntry {
                destination: echo_v4,
                created: Instant::now(),
            },
        );

        flow.write_all(b"hello through the catcher").await.unwrap();
        let mut buf = [0u8; 25];
        tokio::time::timeout(Duration::from_secs(2), flow.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello through the catcher");
        assert!(host.traffic().sent >= 25);
    }
}
