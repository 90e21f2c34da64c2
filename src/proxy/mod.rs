//! Proxy pool: userspace cone NAT for UDP and ICMP echo
//!
//! Maps a client's virtual 5-tuple to an ephemeral outbound socket on the
//! public interface. One sub-pool per protocol: UDP workers keyed by the
//! client source endpoint, ping workers keyed by `(source ip, echo id)`.
//! Idle workers are evicted on a timeout, hard caps evict least recently
//! used. The server runs one pool per session; the client runs one for
//! out-of-range traffic it handles locally.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::PacketSink;
use crate::common::{IpPacket, IpProtocol};
use crate::device::{IcmpSocket, SocketFactory};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    pub udp_timeout: Duration,
    pub icmp_timeout: Duration,
    pub max_udp_client_count: usize,
    pub max_ping_client_count: usize,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            udp_timeout: Duration::from_secs(120),
            icmp_timeout: Duration::from_secs(30),
            max_udp_client_count: 500,
            max_ping_client_count: 100,
        }
    }
}

/// Hooks the owner of the pool registers: flow admission (NetScan feeds
/// off new destinations) and mapping announcements (tracking logs).
pub trait ProxyPoolEvents: Send + Sync {
    /// A flow wants to reach a destination it has not contacted before.
    /// Returning false rejects the packet.
    fn on_new_destination(&self, protocol: IpProtocol, destination: SocketAddr) -> bool;

    /// A client endpoint was mapped onto a local outbound endpoint.
    fn on_mapping(&self, client_source: SocketAddr, local: SocketAddr);
}

struct UdpWorker {
    socket: Arc<UdpSocket>,
    last_used: Mutex<Instant>,
    seen_remotes: Mutex<HashSet<SocketAddr>>,
    task: JoinHandle<()>,
}

impl Drop for UdpWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct PingWorker {
    socket: Arc<dyn IcmpSocket>,
    last_used: Mutex<Instant>,
    seen_remotes: Mutex<HashSet<IpAddr>>,
    task: JoinHandle<()>,
}

impl Drop for PingWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ProxyPool {
    config: ProxyPoolConfig,
    factory: Arc<dyn SocketFactory>,
    /// Reply packets flow back through here
    sink: PacketSink,
    events: Option<Arc<dyn ProxyPoolEvents>>,
    udp: Mutex<HashMap<SocketAddr, Arc<UdpWorker>>>,
    ping: Mutex<HashMap<(IpAddr, u16), Arc<PingWorker>>>,
}

impl ProxyPool {
    pub fn new(
        config: ProxyPoolConfig,
        factory: Arc<dyn SocketFactory>,
        sink: PacketSink,
        events: Option<Arc<dyn ProxyPoolEvents>>,
    ) -> Self {
        Self {
            config,
            factory,
            sink,
            events,
            udp: Mutex::new(HashMap::new()),
            ping: Mutex::new(HashMap::new()),
        }
    }

    /// NAT one outbound packet. UDP and ICMP echo requests are supported;
    /// anything else is a drop the caller reports.
    pub async fn send_packet(&self, packet: IpPacket) -> Result<()> {
        match packet.protocol() {
            IpProtocol::Udp => self.send_udp(packet).await,
            IpProtocol::Icmp | IpProtocol::IcmpV6 if packet.is_icmp_echo_request() => {
                self.send_ping(packet).await
            }
            _ => Err(Error::PacketDrop),
        }
    }

    async fn send_udp(&self, packet: IpPacket) -> Result<()> {
        let source = packet
            .source_endpoint()
            .ok_or_else(|| Error::Protocol("UDP packet without ports".into()))?;
        let destination = packet
            .destination_endpoint()
            .ok_or_else(|| Error::Protocol("UDP packet without ports".into()))?;
        let payload = packet
            .udp_payload()
            .ok_or_else(|| Error::Protocol("truncated UDP packet".into()))?
            .to_vec();

        let existing = self.udp.lock().get(&source).cloned();
        let worker = match existing {
            Some(worker) => worker,
            None => self.create_udp_worker(source).await?,
        };

        if worker.seen_remotes.lock().insert(destination) {
            if let Some(events) = &self.events {
                if !events.on_new_destination(IpProtocol::Udp, destination) {
                    worker.seen_remotes.lock().remove(&destination);
                    return Err(Error::NetScan);
                }
            }
        }

        *worker.last_used.lock() = Instant::now();
        worker.socket.send_to(&payload, destination).await?;
        trace!("udp {} -> {} ({} bytes)", source, destination, payload.len());
        Ok(())
    }

    async fn create_udp_worker(&self, client_source: SocketAddr) -> Result<Arc<UdpWorker>> {
        let socket = Arc::new(self.factory.bind_udp(client_source.is_ipv6()).await?);
        let local = socket.local_addr()?;

        let sink = Arc::clone(&self.sink);
        let reply_socket = Arc::clone(&socket);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 0xffff];
            loop {
                let Ok((len, from)) = reply_socket.recv_from(&mut buf).await else {
                    break;
                };
                let reply = match (from, client_source) {
                    (SocketAddr::V4(from), SocketAddr::V4(client)) => IpPacket::build_udp_v4(
                        (*from.ip(), from.port()),
                        (*client.ip(), client.port()),
                        &buf[..len],
                    ),
                    (SocketAddr::V6(from), SocketAddr::V6(client)) => IpPacket::build_udp_v6(
                        (*from.ip(), from.port()),
                        (*client.ip(), client.port()),
                        &buf[..len],
                    ),
                    _ => continue,
                };
                if let Ok(reply) = reply {
                    sink(reply);
                }
            }
        });

        let worker = Arc::new(UdpWorker {
            socket,
            last_used: Mutex::new(Instant::now()),
            seen_remotes: Mutex::new(HashSet::new()),
            task,
        });

        {
            let mut pool = self.udp.lock();
            Self::evict(&mut pool, self.config.udp_timeout, self.config.max_udp_client_count);
            pool.insert(client_source, Arc::clone(&worker));
            debug!("udp mapping {} -> {} ({} active)", client_source, local, pool.len());
        }
        if let Some(events) = &self.events {
            events.on_mapping(client_source, local);
        }
        Ok(worker)
    }

    async fn send_ping(&self, packet: IpPacket) -> Result<()> {
        let source = packet.source();
        let destination = packet.destination();
        let id = packet
            .icmp_echo_id()
            .ok_or_else(|| Error::Protocol("truncated echo request".into()))?;
        let seq = packet.icmp_echo_seq().unwrap_or(0);
        let payload = packet.icmp_echo_payload().unwrap_or_default().to_vec();

        let key = (source, id);
        let existing = self.ping.lock().get(&key).cloned();
        let worker = match existing {
            Some(worker) => worker,
            None => self.create_ping_worker(source, id).await?,
        };

        if worker.seen_remotes.lock().insert(destination) {
            if let Some(events) = &self.events {
                let endpoint = SocketAddr::new(destination, 0);
                if !events.on_new_destination(packet.protocol(), endpoint) {
                    worker.seen_remotes.lock().remove(&destination);
                    return Err(Error::NetScan);
                }
            }
        }

        *worker.last_used.lock() = Instant::now();
        worker.socket.send_echo(destination, id, seq, &payload).await?;
        trace!("icmp echo {} -> {} id={}", source, destination, id);
        Ok(())
    }

    async fn create_ping_worker(&self, client_source: IpAddr, id: u16) -> Result<Arc<PingWorker>> {
        let socket: Arc<dyn IcmpSocket> =
            Arc::from(self.factory.open_icmp(client_source.is_ipv6()).await?);

        let sink = Arc::clone(&self.sink);
        let reply_socket = Arc::clone(&socket);
        let task = tokio::spawn(async move {
            loop {
                let Ok(reply) = reply_socket.recv_echo_reply().await else {
                    break;
                };
                let built = IpPacket::build_icmp_echo(
                    reply.from,
                    client_source,
                    reply.id,
                    reply.seq,
                    &reply.payload,
                    true,
                );
                if let Ok(packet) = built {
                    sink(packet);
                }
            }
        });

        let worker = Arc::new(PingWorker {
            socket,
            last_used: Mutex::new(Instant::now()),
            seen_remotes: Mutex::new(HashSet::new()),
            task,
        });

        let mut pool = self.ping.lock();
        Self::evict(&mut pool, self.config.icmp_timeout, self.config.max_ping_client_count);
        pool.insert((client_source, id), Arc::clone(&worker));
        debug!("ping mapping {} id={} ({} active)", client_source, id, pool.len());
        Ok(worker)
    }

    /// Drop idle entries; if the pool is still at the cap, evict the least
    /// recently used to make room for one more.
    fn evict<K: std::hash::Hash + Eq + Clone>(
        pool: &mut HashMap<K, Arc<impl LastUsed>>,
        idle_timeout: Duration,
        cap: usize,
    ) {
        let now = Instant::now();
        pool.retain(|_, worker| now.duration_since(worker.last_used()) < idle_timeout);
        while pool.len() >= cap.max(1) {
            let oldest = pool
                .iter()
                .min_by_key(|(_, worker)| worker.last_used())
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    pool.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Periodic idle sweep, driven by the owner's cleanup timer.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut udp = self.udp.lock();
        let before = udp.len();
        udp.retain(|_, worker| now.duration_since(*worker.last_used.lock()) < self.config.udp_timeout);
        let removed = before - udp.len();
        drop(udp);

        let mut ping = self.ping.lock();
        let before = ping.len();
        ping.retain(|_, worker| {
            now.duration_since(*worker.last_used.lock()) < self.config.icmp_timeout
        });
        let removed = removed + before - ping.len();
        drop(ping);

        if removed > 0 {
            debug!("proxy pool evicted {} idle mappings", removed);
        }
    }

    pub fn udp_client_count(&self) -> usize {
        self.udp.lock().len()
    }

    pub fn ping_client_count(&self) -> usize {
        self.ping.lock().len()
    }
}

trait LastUsed {
    fn last_used(&self) -> Instant;
}

impl LastUsed for UdpWorker {
    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }
}

impl LastUsed for PingWorker {
    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackSocketFactory;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn pool_with_sink(
        config: ProxyPoolConfig,
        events: Option<Arc<dyn ProxyPoolEvents>>,
    ) -> (ProxyPool, mpsc::UnboundedReceiver<IpPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: PacketSink = Arc::new(move |packet| {
            let _ = tx.send(packet);
        });
        let pool = ProxyPool::new(config, Arc::new(LoopbackSocketFactory), sink, events);
        (pool, rx)
    }

    #[tokio::test]
    async fn udp_roundtrip_through_the_nat() {
        let (pool, mut replies) = pool_with_sink(ProxyPoolConfig::default(), None);

        // A local echo server stands in for the Internet
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..len], from).await;
            }
        });

        let SocketAddr::V4(echo_v4) = echo_addr else { panic!() };
        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 40000),
            (*echo_v4.ip(), echo_v4.port()),
            b"nat me",
        )
        .unwrap();

        pool.send_packet(packet).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();

        // The reply is addressed back to the client's virtual endpoint
        assert_eq!(reply.destination(), "10.255.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(reply.destination_port(), Some(40000));
        assert_eq!(reply.udp_payload().unwrap(), b"nat me");
        assert_eq!(pool.udp_client_count(), 1);
    }

    #[tokio::test]
    async fn ping_roundtrip_through_the_pool() {
        let (pool, mut replies) = pool_with_sink(ProxyPoolConfig::default(), None);

        let packet = IpPacket::build_icmp_echo_v4(
            Ipv4Addr::new(10, 255, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            0x77,
            3,
            b"echo data",
        )
        .unwrap();

        pool.send_packet(packet).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(reply.is_icmp_echo_reply());
        assert_eq!(reply.source(), "1.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(reply.destination(), "10.255.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(reply.icmp_echo_id(), Some(0x77));
        assert_eq!(reply.icmp_echo_payload().unwrap(), b"echo data");
    }

    #[tokio::test]
    async fn hard_cap_evicts_lru() {
        let config = ProxyPoolConfig {
            max_udp_client_count: 2,
            ..Default::default()
        };
        let (pool, _replies) = pool_with_sink(config, None);

        for port in 1..=3u16 {
            let packet = IpPacket::build_udp_v4(
                (Ipv4Addr::new(10, 255, 0, 2), 40000 + port),
                (Ipv4Addr::new(127, 0, 0, 1), 9),
                b"x",
            )
            .unwrap();
            pool.send_packet(packet).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(pool.udp_client_count() <= 2);
    }

    #[tokio::test]
    async fn events_can_reject_new_destinations() {
        struct DenyAll;
        impl ProxyPoolEvents for DenyAll {
            fn on_new_destination(&self, _: IpProtocol, _: SocketAddr) -> bool {
                false
            }
            fn on_mapping(&self, _: SocketAddr, _: SocketAddr) {}
        }

        let (pool, _replies) = pool_with_sink(ProxyPoolConfig::default(), Some(Arc::new(DenyAll)));
        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 40000),
            (Ipv4Addr::new(127, 0, 0, 1), 9),
            b"x",
        )
        .unwrap();

        assert!(matches!(
            pool.send_packet(packet).await,
            Err(Error::NetScan)
        ));
    }

    #[tokio::test]
    async fn non_echo_icmp_is_dropped() {
        let (pool, _replies) = pool_with_sink(ProxyPoolConfig::default(), None);
        // A TCP packet is not the pool's business
        let mut raw = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 1),
            (Ipv4Addr::new(1, 1, 1, 1), 2),
            b"",
        )
        .unwrap()
        .into_bytes();
        raw[9] = 6; // rewrite protocol to TCP
        let packet = IpPacket::new(raw).unwrap();

        assert!(matches!(
            pool.send_packet(packet).await,
            Err(Error::PacketDrop)
        ));
    }
}
