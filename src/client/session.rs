//! Client session
//!
//! Drives the client state machine (`none → connecting → connected ⇄
//! waiting → disposed`), dispatches every packet coming off the TUN
//! adapter, keeps the packet-channel set filled, and meters the session
//! against its access token via periodic status requests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::access::{now_ms, AccessToken, AdRequirement};
use crate::channel::stream::{StreamChannelConfig, StreamPacketChannel};
use crate::channel::{PacketSink, UdpTransmitter};
use crate::common::{
    EventReporter, IntoStream, IpPacket, IpProtocol, IpRangeFilter, IpVersion, Stream, Traffic,
};
use crate::config::ClientOptions;
use crate::crypto::encrypt_client_id;
use crate::device::{SocketFactory, TunAdapter};
use crate::error::{Error, ErrorCode, Result};
use crate::proxy::{ProxyPool, ProxyPoolConfig};
use crate::tunnel::Tunnel;
use crate::wire::{
    ByeRequest, ClientInfo, HelloRequest, HelloResponse, OpCode, RewardedAdRequest,
    SessionStatusRequest, StreamProxyRequest, SuppressedTo, TcpPacketChannelRequest,
    MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};

use super::connector::{Connector, ConnectorConfig};
use super::finder::find_best_endpoint;
use super::state::{ConnectionInfo, ConnectionInfoFile, SessionInfo, SessionStatus};
use super::tcp_host::{FlowConnector, TcpProxyHost};
use super::{AdProvider, ClientState};

/// Marker address for packets looping through the local TCP host
const CATCHER_V4: Ipv4Addr = Ipv4Addr::new(10, 254, 254, 254);

/// Pause between reconnect attempts while `connecting`
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

/// The negotiated session as the client holds it.
#[derive(Clone)]
struct Active {
    session_id: u64,
    session_key: [u8; 16],
    server_secret: [u8; 16],
    protocol_version: u32,
    udp_endpoint: Option<SocketAddr>,
    virtual_v4: Ipv4Addr,
    virtual_v6: Ipv6Addr,
    server_ipv6: bool,
    max_packet_channels: usize,
    expiration: Option<u64>,
    ad_requirement: AdRequirement,
    client_public_address: Option<IpAddr>,
    suppressed_to: SuppressedTo,
}

struct Inner {
    token: AccessToken,
    options: ClientOptions,
    device: Arc<dyn TunAdapter>,
    factory: Arc<dyn SocketFactory>,
    ad_provider: Mutex<Option<Arc<dyn AdProvider>>>,

    state_tx: watch::Sender<ClientState>,
    active: Mutex<Option<Active>>,
    connector: Mutex<Option<Arc<Connector>>>,
    tunnel: Mutex<Option<Arc<Tunnel>>>,
    ranges: Mutex<Option<Arc<IpRangeFilter>>>,
    local_pool: Mutex<Option<Arc<ProxyPool>>>,
    udp_transmitter: Mutex<Option<Arc<UdpTransmitter>>>,
    tcp_host: Arc<TcpProxyHost>,
    info_file: Option<ConnectionInfoFile>,

    reporter: EventReporter,
    last_ok: Mutex<Instant>,
    pause_started: Mutex<Option<Instant>>,
    /// At most one channel refill in flight
    channel_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    cleanup_started: AtomicBool,
    reached_connected: AtomicBool,
    fatal: AtomicBool,
    disposed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Client-side session handle. Cheap to clone; the last clone dropping
/// does not dispose the session, `shutdown` does.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl ClientSession {
    pub fn new(
        token: AccessToken,
        options: ClientOptions,
        device: Arc<dyn TunAdapter>,
        factory: Arc<dyn SocketFactory>,
    ) -> Self {
        let tcp_host = TcpProxyHost::new(CATCHER_V4, &options.blocked_domains, options.tcp_buffer_size);
        let info_file = options
            .connection_info_path
            .clone()
            .map(ConnectionInfoFile::new);
        let (state_tx, _) = watch::channel(ClientState::None);

        let inner = Arc::new(Inner {
            token,
            options,
            device,
            factory,
            ad_provider: Mutex::new(None),
            state_tx,
            active: Mutex::new(None),
            connector: Mutex::new(None),
            tunnel: Mutex::new(None),
            ranges: Mutex::new(None),
            local_pool: Mutex::new(None),
            udp_transmitter: Mutex::new(None),
            tcp_host,
            info_file,
            reporter: EventReporter::new("client_session"),
            last_ok: Mutex::new(Instant::now()),
            pause_started: Mutex::new(None),
            channel_lock: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
            reached_connected: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        // Device packets flow through an unbounded hand-off queue so the
        // adapter's reader is never blocked by dispatch
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let sink: PacketSink = {
            let dispatch_tx = dispatch_tx.clone();
            Arc::new(move |packet| {
                let _ = dispatch_tx.send(packet);
            })
        };
        inner.device.set_sink(sink);
        tokio::spawn(Inner::dispatch_loop(Arc::downgrade(&inner), dispatch_rx));

        Self { inner }
    }

    pub fn set_ad_provider(&self, provider: Arc<dyn AdProvider>) {
        *self.inner.ad_provider.lock() = Some(provider);
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state_tx.borrow()
    }

    /// Await a particular state; false on timeout.
    pub async fn wait_for_state(&self, target: ClientState, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if *rx.borrow() == target {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return *rx.borrow() == target,
            }
        }
    }

    /// Establish the session. Valid only from `none`.
    pub async fn connect(&self) -> Result<()> {
        if self.state() != ClientState::None {
            return Err(Error::Protocol("session already started".into()));
        }
        self.inner.set_state(ClientState::Connecting);
        match self.inner.clone().establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.handle_request_error(&e).await;
                Err(e)
            }
        }
    }

    /// Graceful shutdown: bye (when the session ever connected), then
    /// dispose everything.
    pub async fn shutdown(&self) {
        self.inner.set_state(ClientState::Disconnecting);
        self.inner.send_bye().await;
        self.inner.dispose(None).await;
    }

    /// Live status; refreshes access usage from the server.
    pub async fn session_status(&self) -> Result<SessionStatus> {
        let (connector, active) = self.inner.connection()?;
        let request = SessionStatusRequest {
            session_id: active.session_id,
            session_key: active.session_key,
        };
        let usage = match connector.request(OpCode::SessionStatus, &request).await {
            Ok(response) => {
                self.inner.mark_request_ok();
                response.access_usage
            }
            Err(e) => {
                self.inner.handle_request_error(&e).await;
                return Err(e);
            }
        };

        let tunnel = self.inner.tunnel.lock().clone();
        let (traffic, speed, channel_count, is_udp_mode) = match tunnel {
            Some(tunnel) => (
                tunnel.traffic() + self.inner.tcp_host.traffic(),
                tunnel.speed(),
                tunnel.channel_count(),
                tunnel.is_udp_mode(),
            ),
            None => (Traffic::default(), Traffic::default(), 0, false),
        };
        Ok(SessionStatus {
            state: self.state(),
            traffic,
            speed,
            channel_count,
            is_udp_mode,
            access_usage: usage,
        })
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.session_info()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Who this session displaced at hello, if anyone.
    pub fn suppressed_to(&self) -> SuppressedTo {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.suppressed_to)
            .unwrap_or_default()
    }
}

impl Inner {
    fn set_state(self: &Arc<Self>, state: ClientState) {
        let changed = {
            let current = *self.state_tx.borrow();
            current != state
        };
        if !changed {
            return;
        }
        debug!("client state -> {:?}", state);
        self.state_tx.send_replace(state);
        self.write_connection_info(state);
    }

    fn write_connection_info(self: &Arc<Self>, state: ClientState) {
        let Some(_file) = self.info_file.as_ref() else { return };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut info = ConnectionInfo::new(state);
            info.api_endpoint = inner.connector.lock().as_ref().map(|c| c.endpoint());
            info.api_key = Some(inner.token.token_id.clone());
            info.session_info = inner.session_info();
            info.error = inner.last_error.lock().clone();
            if let Some(file) = inner.info_file.as_ref() {
                file.write(&info).await;
            }
        });
    }

    fn session_info(&self) -> Option<SessionInfo> {
        self.active.lock().as_ref().map(|active| SessionInfo {
            session_id: active.session_id,
            virtual_ip_v4: active.virtual_v4,
            virtual_ip_v6: active.virtual_v6,
            protocol_version: active.protocol_version,
            client_public_address: active.client_public_address,
        })
    }

    fn connection(&self) -> Result<(Arc<Connector>, Active)> {
        let connector = self.connector.lock().clone().ok_or(Error::Disposed)?;
        let active = self.active.lock().clone().ok_or(Error::Disposed)?;
        Ok((connector, active))
    }

    fn mark_request_ok(&self) {
        *self.last_ok.lock() = Instant::now();
    }

    /// Full establishment: find a server, hello (following at most one
    /// redirect), apply the session, fill channels, start the cleanup
    /// timer, and clear the ad obligation if there is one.
    async fn establish(self: Arc<Self>) -> Result<()> {
        let endpoint = find_best_endpoint(
            &self.token.endpoints,
            self.device.supports(IpVersion::V6),
            Duration::from_secs(self.options.server_query_timeout_secs),
        )
        .await?;

        let hello = match self.try_hello(endpoint, true).await {
            Ok(hello) => hello,
            Err(Error::RedirectHost(endpoints)) => {
                info!("hello redirected to {:?}", endpoints);
                let endpoint = find_best_endpoint(
                    &endpoints,
                    self.device.supports(IpVersion::V6),
                    Duration::from_secs(self.options.server_query_timeout_secs),
                )
                .await?;
                match self.try_hello(endpoint, false).await {
                    Ok(hello) => hello,
                    Err(Error::RedirectHost(_)) => return Err(Error::RedirectLoop),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        self.apply_hello(hello).await?;
        self.mark_request_ok();
        self.complete_ad_requirement().await?;
        self.manage_channels().await;
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        self.spawn_cleanup_timer();
        self.set_state(ClientState::Connected);
        self.reached_connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn try_hello(self: &Arc<Self>, endpoint: SocketAddr, allow_redirect: bool) -> Result<HelloResponse> {
        let connector = Connector::new(ConnectorConfig {
            endpoint,
            host_name: self.token.host_name.clone(),
            certificate_hash: self.token.certificate_hash,
            request_timeout: self.options.request_timeout(),
            tcp_reuse_timeout: Duration::from_secs(self.options.tcp_reuse_timeout_secs),
        })?;

        let request = HelloRequest {
            client_info: ClientInfo {
                client_id: self.options.client_id,
                client_version: env!("CARGO_PKG_VERSION").to_string(),
                min_protocol_version: MIN_PROTOCOL_VERSION,
                max_protocol_version: MAX_PROTOCOL_VERSION,
                user_agent: self.options.user_agent.clone(),
            },
            token_id: self.token.token_id.clone(),
            encrypted_client_id: encrypt_client_id(
                &self.token.secret,
                self.options.client_id.as_bytes(),
            ),
            server_location: self.options.server_location.clone(),
            plan_id: self.options.plan_id.clone(),
            access_code: self.options.access_code.clone(),
            allow_redirect,
            is_ipv6_supported: self.device.supports(IpVersion::V6),
            use_udp_channel: self.options.use_udp_channel,
        };

        let response = connector.hello(&request).await?;
        *self.connector.lock() = Some(connector);
        Ok(response)
    }

    async fn apply_hello(self: &Arc<Self>, hello: HelloResponse) -> Result<()> {
        let connector = self.connector.lock().clone().ok_or(Error::Disposed)?;
        let udp_endpoint = hello
            .udp_port
            .map(|port| SocketAddr::new(connector.endpoint().ip(), port));

        let ranges = if hello.include_ip_ranges.is_empty() {
            Arc::new(IpRangeFilter::all())
        } else {
            Arc::new(IpRangeFilter::parse(&hello.include_ip_ranges)?)
        };

        let expiration = hello.response.access_usage.and_then(|usage| usage.expiration);
        let active = Active {
            session_id: hello.session_id,
            session_key: hello.session_key,
            server_secret: hello.server_secret,
            protocol_version: hello.protocol_version,
            udp_endpoint,
            virtual_v4: hello.virtual_ip_v4,
            virtual_v6: hello.virtual_ip_v6,
            server_ipv6: hello.is_ipv6_supported,
            max_packet_channels: hello
                .max_packet_channel_count
                .min(self.options.max_packet_channels)
                .max(1),
            expiration,
            ad_requirement: hello.ad_requirement,
            client_public_address: hello.client_public_address,
            suppressed_to: hello.response.suppressed_to,
        };

        // The old tunnel (reconnect path) is torn down first
        if let Some(old) = self.tunnel.lock().take() {
            old.close();
        }

        // Inbound tunnel packets go straight to the TUN adapter; catcher
        // loop packets go back through the host
        let device = Arc::clone(&self.device);
        let host = Arc::clone(&self.tcp_host);
        let reporter_inner = Arc::downgrade(self);
        let tunnel_sink: PacketSink = Arc::new(move |packet| {
            let result = if host.is_catcher_packet(&packet) {
                host.process_catcher_packet(packet)
            } else {
                device.send(packet)
            };
            if result.is_err() {
                if let Some(inner) = reporter_inner.upgrade() {
                    inner.reporter.report("packet_drop", "inbound packet not deliverable");
                }
            }
        });
        let tunnel = Tunnel::new(tunnel_sink, active.max_packet_channels);

        // Local proxies for traffic the server will not carry
        let pool_device = Arc::clone(&self.device);
        let pool_sink: PacketSink = Arc::new(move |packet| {
            let _ = pool_device.send(packet);
        });
        let local_pool = Arc::new(ProxyPool::new(
            ProxyPoolConfig::default(),
            Arc::clone(&self.factory),
            pool_sink,
            None,
        ));

        let device_host_sink: PacketSink = {
            let device = Arc::clone(&self.device);
            Arc::new(move |packet| {
                let _ = device.send(packet);
            })
        };
        self.tcp_host
            .start(
                active.virtual_v4,
                device_host_sink,
                Arc::new(SessionFlowConnector {
                    inner: Arc::downgrade(self),
                }),
            )
            .await?;

        *self.ranges.lock() = Some(ranges);
        *self.local_pool.lock() = Some(local_pool);
        *self.tunnel.lock() = Some(tunnel);
        *self.active.lock() = Some(active);
        info!(
            "session {} established (virtual {}, proto {})",
            hello.session_id, hello.virtual_ip_v4, hello.protocol_version
        );
        Ok(())
    }

    /// Rewarded tokens hold the session in `waiting_for_ad` until the ad
    /// completes; flexible ones try and move on.
    async fn complete_ad_requirement(self: &Arc<Self>) -> Result<()> {
        let (connector, active) = self.connection()?;
        match active.ad_requirement {
            AdRequirement::None => Ok(()),
            AdRequirement::Flexible => {
                let provider = self.ad_provider.lock().clone();
                if let Some(provider) = provider {
                    if let Ok(ad_data) = provider.show_ad(active.session_id).await {
                        let request = RewardedAdRequest {
                            session_id: active.session_id,
                            session_key: active.session_key,
                            ad_data,
                        };
                        let _ = connector.request(OpCode::RewardedAd, &request).await;
                    }
                }
                Ok(())
            }
            AdRequirement::Rewarded => {
                self.set_state(ClientState::WaitingForAd);
                let provider = self.ad_provider.lock().clone();
                let Some(provider) = provider else {
                    let err = Error::session(
                        ErrorCode::RewardedAdRejected,
                        "token requires a rewarded ad but no provider is set",
                    );
                    self.dispose(Some(ErrorCode::RewardedAdRejected)).await;
                    return Err(err);
                };
                let ad_data = match provider.show_ad(active.session_id).await {
                    Ok(ad_data) => ad_data,
                    Err(_) => {
                        self.dispose(Some(ErrorCode::RewardedAdRejected)).await;
                        return Err(Error::session(
                            ErrorCode::RewardedAdRejected,
                            "rewarded ad was not completed",
                        ));
                    }
                };
                let request = RewardedAdRequest {
                    session_id: active.session_id,
                    session_key: active.session_key,
                    ad_data,
                };
                connector.request(OpCode::RewardedAd, &request).await?;
                self.mark_request_ok();
                Ok(())
            }
        }
    }

    /// Keep the channel set filled: exactly one UDP channel in UDP mode,
    /// otherwise stream channels up to the cap. Guarded by a try-lock so
    /// at most one refill runs.
    async fn manage_channels(self: &Arc<Self>) {
        let Ok(_guard) = self.channel_lock.try_lock() else { return };
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let Ok((connector, active)) = self.connection() else { return };
        let Some(tunnel) = self.tunnel.lock().clone() else { return };

        if self.options.use_udp_channel && active.udp_endpoint.is_some() {
            if tunnel.is_udp_mode() {
                return;
            }
            if let Err(e) = self.open_udp_channel(&active, &tunnel).await {
                warn!("udp channel setup failed: {}", e);
                self.handle_request_error(&e).await;
            }
            return;
        }

        while tunnel.channel_count() < tunnel.max_packet_channels() {
            let request = TcpPacketChannelRequest {
                session_id: active.session_id,
                session_key: active.session_key,
                with_lifespan: self.options.channel_lifespan().is_some(),
            };
            match connector.request_stream(OpCode::TcpPacketChannel, &request).await {
                Ok((_response, stream)) => {
                    self.mark_request_ok();
                    let lifespan = self.options.channel_lifespan().map(|(min, max)| {
                        Duration::from_secs(
                            rand::thread_rng().gen_range(min.as_secs()..=max.as_secs()),
                        )
                    });
                    let channel = StreamPacketChannel::spawn(
                        format!("cli-{}", uuid::Uuid::new_v4().simple()),
                        stream,
                        tunnel.packet_sink(),
                        StreamChannelConfig {
                            queue_capacity: self.options.packet_queue_capacity,
                            lifespan,
                        },
                    );
                    if tunnel.add_channel(channel).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    self.handle_request_error(&e).await;
                    break;
                }
            }
        }
    }

    async fn open_udp_channel(self: &Arc<Self>, active: &Active, tunnel: &Arc<Tunnel>) -> Result<()> {
        let endpoint = active.udp_endpoint.ok_or(Error::ChannelClosed)?;
        let transmitter = {
            let existing = self.udp_transmitter.lock().clone();
            match existing {
                Some(transmitter) => transmitter,
                None => {
                    let bind: SocketAddr = if endpoint.is_ipv6() {
                        "[::]:0".parse().unwrap()
                    } else {
                        "0.0.0.0:0".parse().unwrap()
                    };
                    let transmitter = UdpTransmitter::bind(bind).await?;
                    *self.udp_transmitter.lock() = Some(Arc::clone(&transmitter));
                    transmitter
                }
            }
        };
        let channel = transmitter.create_channel(
            active.session_id,
            &active.server_secret,
            Some(endpoint),
            tunnel.packet_sink(),
        )?;
        tunnel.add_channel(channel)?;
        info!("udp packet channel open to {}", endpoint);
        Ok(())
    }

    /// The per-packet decision tree (TUN → tunnel / local proxy / drop).
    async fn dispatch_packet(self: &Arc<Self>, packet: IpPacket) {
        // 1. Paused: drop until the wait window has passed, then let the
        // packet trigger a reconnect
        let state = *self.state_tx.borrow();
        match state {
            ClientState::Waiting => {
                let elapsed = (*self.pause_started.lock())
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed < Duration::from_secs(self.options.auto_wait_timeout_secs) {
                    return;
                }
                self.begin_reconnect();
                return;
            }
            ClientState::Connected => {}
            _ => return,
        }

        // 2. Multicast never crosses the tunnel
        if packet.is_multicast_destination() {
            return;
        }

        // 3. Catcher loop packets belong to the local TCP host
        if self.tcp_host.is_catcher_packet(&packet) {
            if let Err(e) = self.tcp_host.process_catcher_packet(packet) {
                self.reporter.report("packet_drop", &format!("catcher: {}", e));
            }
            return;
        }

        let Some(ranges) = self.ranges.lock().clone() else { return };
        let protocol = packet.protocol();
        let destination = packet.destination();
        let in_range = ranges.contains_cached(destination);

        // 4./5. TCP either rides the tunnel as packets or loops through
        // the local host (which proxies in-range flows via the server)
        if protocol == IpProtocol::Tcp {
            if self.options.use_tcp_over_tun && in_range {
                self.send_to_tunnel(packet);
            } else if let Err(e) = self.tcp_host.process_outbound(packet) {
                self.reporter.report("packet_drop", &format!("tcp host: {}", e));
            }
            return;
        }

        // 6. IPv6 without server support is dropped
        if packet.version() == IpVersion::V6 {
            let server_ipv6 = self.active.lock().as_ref().is_some_and(|a| a.server_ipv6);
            if !server_ipv6 {
                return;
            }
        }

        // 7. ICMP echo cannot use the local proxies
        if packet.is_icmp_echo_request() {
            self.send_to_tunnel(packet);
            return;
        }

        // 8. Out-of-range traffic is proxied locally
        if !in_range {
            let pool = self.local_pool.lock().clone();
            if let Some(pool) = pool {
                if let Err(e) = pool.send_packet(packet).await {
                    self.reporter.report("packet_drop", &format!("local proxy: {}", e));
                }
            }
            return;
        }

        // 9./10. Policy drops for UDP and QUIC
        if protocol == IpProtocol::Udp {
            if self.options.drop_udp {
                return;
            }
            if self.options.drop_quic
                && matches!(packet.destination_port(), Some(80) | Some(443))
            {
                return;
            }
        }

        // 11. Everything left rides the tunnel
        self.send_to_tunnel(packet);
    }

    fn send_to_tunnel(self: &Arc<Self>, packet: IpPacket) {
        let tunnel = self.tunnel.lock().clone();
        let Some(tunnel) = tunnel else { return };
        if let Err(e) = tunnel.send(packet) {
            self.reporter.report("packet_drop", &format!("tunnel: {}", e));
            // No healthy channel; poke the refill path
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.manage_channels().await;
            });
        }
    }

    async fn dispatch_loop(
        inner: std::sync::Weak<Inner>,
        mut queue: mpsc::UnboundedReceiver<IpPacket>,
    ) {
        while let Some(packet) = queue.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            if inner.disposed.load(Ordering::Acquire) {
                break;
            }
            inner.dispatch_packet(packet).await;
        }
    }

    /// The retry/pause/die ladder for any failed request.
    async fn handle_request_error(self: &Arc<Self>, error: &Error) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        *self.last_error.lock() = Some(error.to_string());

        if error.is_terminal() {
            self.fatal.store(true, Ordering::Release);
            self.dispose(Some(error.error_code())).await;
            return;
        }

        let elapsed = self.last_ok.lock().elapsed();
        let reconnect_window = Duration::from_secs(self.options.reconnect_timeout_secs);
        let session_window = Duration::from_secs(self.options.session_timeout_secs);

        if elapsed <= reconnect_window {
            debug!("request failed ({}); retrying", error);
            self.begin_reconnect();
        } else if elapsed <= session_window {
            info!("request failed ({}); pausing", error);
            *self.pause_started.lock() = Some(Instant::now());
            self.set_state(ClientState::Waiting);
            self.reconnecting.store(false, Ordering::Release);
        } else {
            warn!("request failures exceeded the session window; disposing");
            self.dispose(Some(ErrorCode::GeneralError)).await;
        }
    }

    /// Switch to `connecting` and run hello attempts until one sticks or
    /// the error ladder says otherwise.
    fn begin_reconnect(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ClientState::Connecting);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if inner.disposed.load(Ordering::Acquire) {
                    break;
                }
                if *inner.state_tx.borrow() != ClientState::Connecting {
                    break;
                }
                match inner.clone().establish().await {
                    Ok(()) => break,
                    Err(e) => {
                        inner.handle_request_error(&e).await;
                        if *inner.state_tx.borrow() != ClientState::Connecting {
                            break;
                        }
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                }
            }
            inner.reconnecting.store(false, Ordering::Release);
        });
    }

    fn spawn_cleanup_timer(self: &Arc<Self>) {
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::downgrade(self);
        let period = Duration::from_secs(self.options.cleanup_period_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                if inner.disposed.load(Ordering::Acquire) {
                    break;
                }

                let expired = inner
                    .active
                    .lock()
                    .as_ref()
                    .and_then(|a| a.expiration)
                    .is_some_and(|at| now_ms() > at);
                if expired {
                    info!("session expired; disposing");
                    inner.dispose(Some(ErrorCode::AccessExpired)).await;
                    break;
                }

                if *inner.state_tx.borrow() == ClientState::Connected {
                    inner.manage_channels().await;
                }
                let pool = inner.local_pool.lock().clone();
                if let Some(pool) = pool {
                    pool.cleanup();
                }
            }
        });
    }

    async fn send_bye(self: &Arc<Self>) {
        if !self.reached_connected.load(Ordering::Acquire)
            || self.fatal.load(Ordering::Acquire)
            || self.disposed.load(Ordering::Acquire)
        {
            return;
        }
        let Ok((connector, active)) = self.connection() else { return };
        let request = ByeRequest {
            session_id: active.session_id,
            session_key: active.session_key,
        };
        let bye = connector.request(OpCode::Bye, &request);
        if tokio::time::timeout(self.options.bye_timeout(), bye).await.is_err() {
            debug!("bye timed out; ignoring");
        }
    }

    /// Release everything the session transitively owns. Idempotent.
    async fn dispose(self: &Arc<Self>, code: Option<ErrorCode>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(code) = code {
            *self.last_error.lock() = Some(code.to_string());
        }
        if let Some(tunnel) = self.tunnel.lock().take() {
            tunnel.close();
        }
        if let Some(connector) = self.connector.lock().take() {
            connector.clear_pool();
        }
        if let Some(transmitter) = self.udp_transmitter.lock().take() {
            transmitter.close();
        }
        *self.local_pool.lock() = None;
        *self.active.lock() = None;
        self.set_state(ClientState::Disposed);
        info!("client session disposed ({:?})", code);
    }
}

/// Routes intercepted TCP flows: in-range destinations through a server
/// stream proxy, the rest straight out.
struct SessionFlowConnector {
    inner: std::sync::Weak<Inner>,
}

#[async_trait]
impl FlowConnector for SessionFlowConnector {
    async fn connect(&self, destination: SocketAddr) -> Result<Stream> {
        let inner = self.inner.upgrade().ok_or(Error::Disposed)?;
        let in_range = inner
            .ranges
            .lock()
            .clone()
            .map(|ranges| ranges.contains_cached(destination.ip()))
            .unwrap_or(false);

        if in_range {
            let (connector, active) = inner.connection()?;
            let request = StreamProxyRequest {
                session_id: active.session_id,
                session_key: active.session_key,
                destination: destination.to_string(),
            };
            let (_response, stream) = connector
                .request_stream(OpCode::StreamProxy, &request)
                .await?;
            inner.mark_request_ok();
            Ok(stream)
        } else {
            let stream = tokio::net::TcpStream::connect(destination).await?;
            stream.set_nodelay(true)?;
            Ok(stream.into_stream())
        }
    }
}
