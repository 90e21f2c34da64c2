//! Server-side session
//!
//! Mirror of the client session: one tunnel, one proxy pool, the limits
//! and the traffic accounting for a single authenticated client. The
//! session manager owns every live session, applies the suppression
//! policy and sweeps idle or expired sessions.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{now_ms, AccessManager};
use crate::channel::PacketSink;
use crate::common::{EventReporter, IpPacket, IpProtocol, IpVersion, Traffic};
use crate::device::{SocketFactory, TunAdapter};
use crate::error::{Error, ErrorCode, Result};
use crate::proxy::{ProxyPool, ProxyPoolConfig, ProxyPoolEvents};
use crate::tunnel::Tunnel;
use crate::wire::SuppressedTo;

use super::net_scan::NetScanDetector;

/// Everything a session needs that comes from server options.
#[derive(Clone)]
pub struct SessionContext {
    pub gateway_v4: Ipv4Addr,
    pub gateway_v6: Ipv6Addr,
    pub include_local_network: bool,
    pub max_packet_channels: usize,
    pub max_tcp_channel_count: usize,
    pub max_tcp_connect_wait_count: usize,
    pub net_scan_limit: usize,
    pub net_scan_window: Duration,
    pub usage_sync_threshold: u64,
    pub proxy_pool: ProxyPoolConfig,
    pub session_timeout: Duration,
}

/// Why a session ended; answered to any later request for it.
#[derive(Debug, Clone, Copy)]
pub struct DisposeReason {
    pub code: ErrorCode,
    pub suppressed_to: SuppressedTo,
}

pub struct ServerSession {
    pub session_id: u64,
    pub session_key: [u8; 16],
    pub server_secret: [u8; 16],
    pub token_id: String,
    pub client_id: Uuid,
    pub virtual_v4: Ipv4Addr,
    pub virtual_v6: Ipv6Addr,
    pub is_ipv6_supported: bool,

    context: SessionContext,
    tunnel: Arc<Tunnel>,
    proxy_pool: Arc<ProxyPool>,
    net_scan: Arc<NetScanDetector>,
    reporter: EventReporter,
    tun: Option<Arc<dyn TunAdapter>>,
    access_manager: Arc<dyn AccessManager>,

    /// Tunnel traffic already metered against the token
    synced_traffic: Mutex<Traffic>,
    sync_in_flight: AtomicBool,
    last_activity: Mutex<Instant>,
    /// Stream proxies currently spliced
    tcp_channel_count: AtomicUsize,
    /// Outbound TCP connects in flight
    tcp_connect_wait: AtomicUsize,
    expiration: Mutex<Option<u64>>,
    dispose_reason: Mutex<Option<DisposeReason>>,
    disposed: AtomicBool,

    dispatch_tx: mpsc::UnboundedSender<IpPacket>,
}

/// NetScan verdicts ride the proxy pool's admission callback.
struct PoolEvents {
    net_scan: Arc<NetScanDetector>,
    reporter_scope: u64,
}

impl ProxyPoolEvents for PoolEvents {
    fn on_new_destination(&self, protocol: IpProtocol, destination: std::net::SocketAddr) -> bool {
        self.net_scan.verify(protocol, destination)
    }

    fn on_mapping(&self, client_source: std::net::SocketAddr, local: std::net::SocketAddr) {
        debug!(
            "session {}: mapped {} -> {}",
            self.reporter_scope, client_source, local
        );
    }
}

impl ServerSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: u64,
        token_id: String,
        client_id: Uuid,
        virtual_v4: Ipv4Addr,
        virtual_v6: Ipv6Addr,
        is_ipv6_supported: bool,
        expiration: Option<u64>,
        context: SessionContext,
        factory: Arc<dyn SocketFactory>,
        tun: Option<Arc<dyn TunAdapter>>,
        access_manager: Arc<dyn AccessManager>,
    ) -> Arc<Self> {
        let session_key = crate::crypto::random_key();
        let server_secret = crate::crypto::random_key();

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        // Inbound packets from the client's channels land in the
        // dispatcher queue; replies from the pool ride the tunnel back.
        let tunnel_tx = dispatch_tx.clone();
        let tunnel_sink: PacketSink = Arc::new(move |packet| {
            let _ = tunnel_tx.send(packet);
        });
        let tunnel = Tunnel::new(tunnel_sink, context.max_packet_channels);

        let reply_tunnel = Arc::downgrade(&tunnel);
        let pool_sink: PacketSink = Arc::new(move |packet| {
            if let Some(tunnel) = reply_tunnel.upgrade() {
                let _ = tunnel.send(packet);
            }
        });

        let net_scan = Arc::new(NetScanDetector::new(
            context.net_scan_limit,
            context.net_scan_window,
        ));
        let proxy_pool = Arc::new(ProxyPool::new(
            context.proxy_pool.clone(),
            factory,
            pool_sink,
            Some(Arc::new(PoolEvents {
                net_scan: Arc::clone(&net_scan),
                reporter_scope: session_id,
            })),
        ));

        let session = Arc::new(Self {
            session_id,
            session_key,
            server_secret,
            token_id,
            client_id,
            virtual_v4,
            virtual_v6,
            is_ipv6_supported,
            context,
            tunnel,
            proxy_pool,
            net_scan,
            reporter: EventReporter::new("server_session"),
            tun,
            access_manager,
            synced_traffic: Mutex::new(Traffic::default()),
            sync_in_flight: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            tcp_channel_count: AtomicUsize::new(0),
            tcp_connect_wait: AtomicUsize::new(0),
            expiration: Mutex::new(expiration),
            dispose_reason: Mutex::new(None),
            disposed: AtomicBool::new(false),
            dispatch_tx,
        });

        tokio::spawn(Self::dispatch_loop(Arc::downgrade(&session), dispatch_rx));
        session
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn dispose_reason(&self) -> Option<DisposeReason> {
        *self.dispose_reason.lock()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.expiration.lock().is_some_and(|at| now_ms() > at)
    }

    pub fn set_expiration(&self, expiration: Option<u64>) {
        *self.expiration.lock() = expiration;
    }

    /// Push a packet that arrived outside the tunnel channels (the
    /// `udp_packet` control op).
    pub fn inject_packet(&self, packet: IpPacket) {
        let _ = self.dispatch_tx.send(packet);
    }

    /// The session's traffic as the access manager counts it: the tunnel
    /// totals minus what was already synced, with sent and received
    /// swapped (the server's sent is the client's received).
    pub fn unsynced_traffic(&self) -> Traffic {
        (self.tunnel.traffic() - *self.synced_traffic.lock()).swapped()
    }

    /// Snapshot the tunnel traffic and return the delta to meter.
    fn reset_traffic(&self) -> Traffic {
        let mut synced = self.synced_traffic.lock();
        let current = self.tunnel.traffic();
        let delta = (current - *synced).swapped();
        *synced = current;
        delta
    }

    /// Meter outstanding traffic against the token. Terminal access
    /// errors dispose the session with the reported code.
    pub async fn sync_usage(self: &Arc<Self>, force: bool) {
        if self.is_disposed() {
            return;
        }
        if !force && self.unsynced_traffic().total() < self.context.usage_sync_threshold {
            return;
        }
        if self.sync_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let delta = self.reset_traffic();
        let result = self
            .access_manager
            .session_add_usage(self.session_id, delta, None)
            .await;
        self.sync_in_flight.store(false, Ordering::Release);

        match result {
            Ok(usage) => {
                if let Some(expiration) = usage.expiration {
                    self.set_expiration(Some(expiration));
                }
            }
            Err(e) => {
                let code = e.error_code();
                if code.is_terminal() {
                    info!("session {} ended by access manager: {}", self.session_id, e);
                    self.dispose(code, SuppressedTo::None).await;
                } else {
                    warn!("session {} usage sync failed: {}", self.session_id, e);
                }
            }
        }
    }

    async fn dispatch_loop(
        session: std::sync::Weak<ServerSession>,
        mut queue: mpsc::UnboundedReceiver<IpPacket>,
    ) {
        while let Some(packet) = queue.recv().await {
            let Some(session) = session.upgrade() else { break };
            if session.is_disposed() {
                break;
            }
            session.touch();
            session.dispatch_packet(packet).await;
            session.sync_usage(false).await;
        }
    }

    /// Packet dispatch, server side: source check, filter policy, gateway
    /// responder, then TUN or proxy pool.
    async fn dispatch_packet(self: &Arc<Self>, packet: IpPacket) {
        // 1. The source must be the session's own virtual address
        let source_ok = match packet.version() {
            IpVersion::V4 => packet.source() == IpAddr::V4(self.virtual_v4),
            IpVersion::V6 => packet.source() == IpAddr::V6(self.virtual_v6),
        };
        if !source_ok {
            self.reporter.report(
                "net_filter",
                &format!("spoofed source {} discarded", packet.source()),
            );
            return;
        }

        // Gateway responder: pings addressed to the tunnel gateway are
        // answered right here
        let destination = packet.destination();
        let is_gateway = destination == IpAddr::V4(self.context.gateway_v4)
            || destination == IpAddr::V6(self.context.gateway_v6);
        if is_gateway {
            if packet.is_icmp_echo_request() {
                if let Ok(reply) = packet.into_icmp_echo_reply() {
                    let _ = self.tunnel.send(reply);
                }
            }
            return;
        }

        // 2. Filter policy: local networks stay out of the tunnel unless
        // explicitly included
        if !self.context.include_local_network && is_local_destination(destination) {
            self.reporter.report(
                "net_filter",
                &format!("local destination {} rejected", destination),
            );
            return;
        }

        // 3. A TUN adapter that speaks this IP version takes precedence
        if let Some(tun) = &self.tun {
            if tun.supports(packet.version()) {
                if let Err(e) = tun.send(packet) {
                    self.reporter.report("packet_drop", &format!("tun send failed: {}", e));
                }
                return;
            }
        }

        // 4. Everything else goes through the NAT pool
        match self.proxy_pool.send_packet(packet).await {
            Ok(()) => {}
            Err(Error::NetScan) => {
                self.reporter.report("net_scan", "destination rate limited");
            }
            Err(e) => {
                self.reporter.report("packet_drop", &format!("{}", e));
            }
        }
    }

    /// Guard for one outbound TCP connect; dropped when the connect ends.
    pub fn begin_tcp_connect(self: &Arc<Self>) -> Result<TcpConnectGuard> {
        let waiting = self.tcp_connect_wait.fetch_add(1, Ordering::AcqRel) + 1;
        if waiting > self.context.max_tcp_connect_wait_count {
            self.tcp_connect_wait.fetch_sub(1, Ordering::AcqRel);
            self.reporter.report("max_tcp_connect_wait", "connect backlog full");
            return Err(Error::MaxTcpConnectWait);
        }
        Ok(TcpConnectGuard {
            session: Arc::clone(self),
        })
    }

    /// Guard for one spliced proxy channel.
    pub fn begin_tcp_channel(self: &Arc<Self>) -> Result<TcpChannelGuard> {
        let active = self.tcp_channel_count.fetch_add(1, Ordering::AcqRel) + 1;
        if active > self.context.max_tcp_channel_count {
            self.tcp_channel_count.fetch_sub(1, Ordering::AcqRel);
            self.reporter.report("max_tcp_channel", "proxy channel cap reached");
            return Err(Error::MaxTcpChannel);
        }
        Ok(TcpChannelGuard {
            session: Arc::clone(self),
        })
    }

    pub fn verify_destination(&self, protocol: IpProtocol, dest: std::net::SocketAddr) -> bool {
        self.net_scan.verify(protocol, dest)
    }

    pub fn verify_key(&self, key: &[u8; 16]) -> Result<()> {
        if key == &self.session_key {
            Ok(())
        } else {
            Err(Error::session(ErrorCode::UnauthorizedAccess, "bad session key"))
        }
    }

    pub fn reporter(&self) -> &EventReporter {
        &self.reporter
    }

    pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
        &self.proxy_pool
    }

    /// Dispose the session: close the tunnel, record the reason, meter the
    /// final traffic. Calling it twice is a no-op.
    pub async fn dispose(self: &Arc<Self>, code: ErrorCode, suppressed_to: SuppressedTo) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.dispose_reason.lock() = Some(DisposeReason { code, suppressed_to });
        self.tunnel.close();

        let final_traffic = self.reset_traffic();
        let _ = self
            .access_manager
            .session_close(self.session_id, final_traffic)
            .await;
        info!("session {} disposed ({})", self.session_id, code);
    }
}

pub struct TcpConnectGuard {
    session: Arc<ServerSession>,
}

impl Drop for TcpConnectGuard {
    fn drop(&mut self) {
        self.session.tcp_connect_wait.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct TcpChannelGuard {
    session: Arc<ServerSession>,
}

impl Drop for TcpChannelGuard {
    fn drop(&mut self) {
        self.session.tcp_channel_count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn is_local_destination(destination: IpAddr) -> bool {
    match destination {
        IpAddr::V4(ip) => {
            ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.octets()[0] == 0
        }
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || (ip.segments()[0] & 0xffc0) == 0xfe80
                || (ip.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Registry of live sessions plus the suppression policy.
pub struct SessionManager {
    sessions: Mutex<HashMap<u64, Arc<ServerSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<ServerSession>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    pub fn insert(&self, session: Arc<ServerSession>) {
        self.sessions.lock().insert(session.session_id, session);
    }

    pub fn remove(&self, session_id: u64) {
        self.sessions.lock().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn virtual_v4_in_use(&self) -> Vec<Ipv4Addr> {
        self.sessions
            .lock()
            .values()
            .filter(|s| !s.is_disposed())
            .map(|s| s.virtual_v4)
            .collect()
    }

    /// Apply the suppression policy for a new session on `token_id` /
    /// `client_id`. Returns what the new session should report.
    ///
    /// A second session from the same client replaces the first (the old
    /// one is told `other` displaced it, the new one that it displaced
    /// `self`). When the token's client cap is exceeded, the oldest
    /// other-client session is displaced and the new session reports
    /// `other`.
    pub async fn suppress_for(
        &self,
        token_id: &str,
        client_id: Uuid,
        max_client_count: Option<u32>,
    ) -> SuppressedTo {
        let same_client: Vec<Arc<ServerSession>> = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .filter(|s| {
                    !s.is_disposed() && s.token_id == token_id && s.client_id == client_id
                })
                .cloned()
                .collect()
        };

        let mut suppressed = SuppressedTo::None;
        for old in same_client {
            old.dispose(ErrorCode::SessionSuppressed, SuppressedTo::Other).await;
            suppressed = SuppressedTo::SelfSession;
        }

        if let Some(max) = max_client_count {
            loop {
                let victim = {
                    let sessions = self.sessions.lock();
                    let mut others: Vec<&Arc<ServerSession>> = sessions
                        .values()
                        .filter(|s| {
                            !s.is_disposed() && s.token_id == token_id && s.client_id != client_id
                        })
                        .collect();
                    if (others.len() as u32) < max {
                        break;
                    }
                    others.sort_by_key(|s| s.session_id);
                    others.first().map(|s| Arc::clone(s))
                };
                match victim {
                    Some(old) => {
                        old.dispose(ErrorCode::SessionSuppressed, SuppressedTo::Other).await;
                        if suppressed == SuppressedTo::None {
                            suppressed = SuppressedTo::Other;
                        }
                    }
                    None => break,
                }
            }
        }

        suppressed
    }

    /// Sweep: sync usage everywhere, dispose idle and expired sessions,
    /// forget disposed ones (their reason stays answerable until then).
    pub async fn cleanup(&self, session_timeout: Duration) {
        let sessions: Vec<Arc<ServerSession>> =
            self.sessions.lock().values().cloned().collect();

        for session in sessions {
            if session.is_disposed() {
                // Keep the reason answerable for a while, then forget
                if session.idle_for() > session_timeout {
                    self.remove(session.session_id);
                }
                continue;
            }
            if session.is_expired() {
                session.dispose(ErrorCode::AccessExpired, SuppressedTo::None).await;
                continue;
            }
            if session.idle_for() > session_timeout {
                session.dispose(ErrorCode::SessionClosed, SuppressedTo::None).await;
                continue;
            }
            session.sync_usage(true).await;
            session.proxy_pool().cleanup();
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessToken, AdRequirement, FileAccessManager, SessionRequest};
    use crate::crypto::{encrypt_client_id, random_key};
    use crate::device::{InMemoryTunAdapter, LoopbackSocketFactory};

    fn context() -> SessionContext {
        SessionContext {
            gateway_v4: Ipv4Addr::new(10, 255, 0, 1),
            gateway_v6: "fd00:5ef::1".parse().unwrap(),
            include_local_network: false,
            max_packet_channels: 8,
            max_tcp_channel_count: 2,
            max_tcp_connect_wait_count: 2,
            net_scan_limit: 0,
            net_scan_window: Duration::from_secs(300),
            usage_sync_threshold: 5 * 1024 * 1024,
            proxy_pool: ProxyPoolConfig::default(),
            session_timeout: Duration::from_secs(300),
        }
    }

    async fn test_manager(dir: &std::path::Path) -> (Arc<FileAccessManager>, u64) {
        let manager = Arc::new(FileAccessManager::new(dir).unwrap());
        let token = AccessToken {
            token_id: "tok-s".into(),
            secret: random_key(),
            expiration: None,
            max_traffic: None,
            max_client_count: None,
            ad_requirement: AdRequirement::None,
            name: None,
            endpoints: vec![],
            host_name: "localhost".into(),
            certificate_hash: None,
        };
        let token = manager.create_token(token).await.unwrap();
        let client_id = Uuid::new_v4();
        let grant = manager
            .session_add(SessionRequest {
                token_id: token.token_id.clone(),
                client_id,
                encrypted_client_id: encrypt_client_id(&token.secret, client_id.as_bytes()),
                client_address: "127.0.0.1:1".parse().unwrap(),
            })
            .await
            .unwrap();
        (manager, grant.session_id)
    }

    fn session_with(
        session_id: u64,
        manager: Arc<FileAccessManager>,
        tun: Option<Arc<dyn TunAdapter>>,
    ) -> Arc<ServerSession> {
        ServerSession::new(
            session_id,
            "tok-s".into(),
            Uuid::new_v4(),
            Ipv4Addr::new(10, 255, 0, 2),
            "fd00:5ef::2".parse().unwrap(),
            false,
            None,
            context(),
            Arc::new(LoopbackSocketFactory),
            tun,
            manager,
        )
    }

    #[tokio::test]
    async fn spoofed_source_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, id) = test_manager(dir.path()).await;
        let tun = InMemoryTunAdapter::new("srv-tun", 1420, false);
        let session = session_with(id, manager, Some(tun.clone()));

        // Wrong source: not the session's virtual address
        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 99), 1000),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            b"spoof",
        )
        .unwrap();
        session.inject_packet(packet);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.reporter().count("net_filter") > 0);

        // Correct source reaches the TUN
        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 1000),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            b"legit",
        )
        .unwrap();
        session.inject_packet(packet);
        let delivered = tokio::time::timeout(Duration::from_secs(1), tun.next_outbound())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.udp_payload().unwrap(), b"legit");
    }

    #[tokio::test]
    async fn local_destinations_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, id) = test_manager(dir.path()).await;
        let session = session_with(id, manager, None);

        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 1000),
            (Ipv4Addr::new(192, 168, 1, 1), 80),
            b"lan probe",
        )
        .unwrap();
        session.inject_packet(packet);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.reporter().count("net_filter") > 0);
    }

    #[tokio::test]
    async fn limit_guards_enforce_caps() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, id) = test_manager(dir.path()).await;
        let session = session_with(id, manager, None);

        let a = session.begin_tcp_channel().unwrap();
        let _b = session.begin_tcp_channel().unwrap();
        assert!(matches!(session.begin_tcp_channel(), Err(Error::MaxTcpChannel)));
        drop(a);
        assert!(session.begin_tcp_channel().is_ok());

        let _c = session.begin_tcp_connect().unwrap();
        let _d = session.begin_tcp_connect().unwrap();
        assert!(matches!(
            session.begin_tcp_connect(),
            Err(Error::MaxTcpConnectWait)
        ));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, id) = test_manager(dir.path()).await;
        let session = session_with(id, manager, None);

        session
            .dispose(ErrorCode::SessionSuppressed, SuppressedTo::Other)
            .await;
        session
            .dispose(ErrorCode::GeneralError, SuppressedTo::None)
            .await;

        // The first reason wins
        let reason = session.dispose_reason().unwrap();
        assert_eq!(reason.code, ErrorCode::SessionSuppressed);
        assert_eq!(reason.suppressed_to, SuppressedTo::Other);
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn suppression_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (access, id) = test_manager(dir.path()).await;
        let manager = SessionManager::new();
        let client = Uuid::new_v4();

        let first = ServerSession::new(
            id,
            "tok-s".into(),
            client,
            Ipv4Addr::new(10, 255, 0, 2),
            "fd00:5ef::2".parse().unwrap(),
            false,
            None,
            context(),
            Arc::new(LoopbackSocketFactory),
            None,
            Arc::clone(&access) as Arc<dyn AccessManager>,
        );
        manager.insert(Arc::clone(&first));

        // Same client connects again with a non-shareable token
        let verdict = manager.suppress_for("tok-s", client, Some(1)).await;
        assert_eq!(verdict, SuppressedTo::SelfSession);
        assert!(first.is_disposed());
        let reason = first.dispose_reason().unwrap();
        assert_eq!(reason.code, ErrorCode::SessionSuppressed);
        assert_eq!(reason.suppressed_to, SuppressedTo::Other);

        // A different client displacing someone else reports `other`
        let second = ServerSession::new(
            id.wrapping_add(1),
            "tok-s".into(),
            Uuid::new_v4(),
            Ipv4Addr::new(10, 255, 0, 3),
            "fd00:5ef::3".parse().unwrap(),
            false,
            None,
            context(),
            Arc::new(LoopbackSocketFactory),
            None,
            Arc::clone(&access) as Arc<dyn AccessManager>,
        );
        manager.remove(first.session_id);
        manager.insert(Arc::clone(&second));
        let verdict = manager.suppress_for("tok-s", Uuid::new_v4(), Some(1)).await;
        assert_eq!(verdict, SuppressedTo::Other);
        assert!(second.is_disposed());
    }
}
