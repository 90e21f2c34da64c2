//! Tunnel server
//!
//! Accepts TLS connections, parses framed control requests and routes
//! them to the session layer: hello creates sessions, channel ops hand
//! their stream over, the rest are request/response. One shared UDP
//! transmitter serves every session in UDP mode.

mod net_scan;
mod session;

pub use net_scan::NetScanDetector;
pub use session::{DisposeReason, ServerSession, SessionContext, SessionManager};

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::access::{AccessManager, SessionRequest};
use crate::channel::stream::{StreamChannelConfig, StreamPacketChannel};
use crate::channel::{ProxyChannel, UdpTransmitter};
use crate::common::{DomainFilter, IntoStream, IpProtocol, Stream};
use crate::config::ServerOptions;
use crate::crypto::sha256;
use crate::device::{SocketFactory, TunAdapter};
use crate::error::{Error, ErrorCode, Result};
use crate::proxy::ProxyPoolConfig;
use crate::wire::{
    self, ByeRequest, HelloRequest, HelloResponse, OpCode, RewardedAdRequest, SessionResponse,
    SessionStatusRequest, StreamProxyRequest, SuppressedTo, TcpPacketChannelRequest,
    UdpPacketRequest, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};

/// Idle limit for a reused control stream between requests
const REQUEST_STREAM_IDLE: Duration = Duration::from_secs(60);

/// Deadline for one outbound proxy connect
const PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the SNI peek waits for a flow's first segment
const SNI_PEEK_TIMEOUT: Duration = Duration::from_millis(250);

/// Certificate and key the TLS acceptor serves.
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load a PEM certificate chain and private key.
    pub fn load(cert_file: &str, key_file: &str) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
            std::fs::File::open(cert_file)
                .map_err(|e| Error::Config(format!("failed to open {}: {}", cert_file, e)))?,
        ))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
            std::fs::File::open(key_file)
                .map_err(|e| Error::Config(format!("failed to open {}: {}", key_file, e)))?,
        ))
        .map_err(|e| Error::Config(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::Config("no private key found".into()))?;

        Ok(Self {
            cert_chain: certs,
            key,
        })
    }

    /// SHA-256 of the end-entity certificate, for token pinning.
    pub fn certificate_hash(&self) -> Option<[u8; 32]> {
        self.cert_chain.first().map(|cert| sha256(cert.as_ref()))
    }
}

struct ServerState {
    options: ServerOptions,
    access: Arc<dyn AccessManager>,
    factory: Arc<dyn SocketFactory>,
    tun: Option<Arc<dyn TunAdapter>>,
    sessions: SessionManager,
    acceptor: TlsAcceptor,
    udp: Mutex<Option<Arc<UdpTransmitter>>>,
    network_v4: Ipv4Net,
    network_v6: Ipv6Net,
    gateway_v4: Ipv4Addr,
    gateway_v6: Ipv6Addr,
    domain_filter: DomainFilter,
    running: AtomicBool,
}

pub struct TunnelServer {
    state: Arc<ServerState>,
    shutdown: Arc<Notify>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TunnelServer {
    pub fn new(
        options: ServerOptions,
        identity: TlsIdentity,
        access: Arc<dyn AccessManager>,
        factory: Arc<dyn SocketFactory>,
        tun: Option<Arc<dyn TunAdapter>>,
    ) -> Result<Arc<Self>> {
        let network_v4: Ipv4Net = options
            .virtual_network_v4
            .parse()
            .map_err(|e| Error::Config(format!("bad virtual_network_v4: {}", e)))?;
        let network_v6: Ipv6Net = options
            .virtual_network_v6
            .parse()
            .map_err(|e| Error::Config(format!("bad virtual_network_v6: {}", e)))?;
        let gateway_v4 = network_v4
            .hosts()
            .next()
            .ok_or_else(|| Error::Config("virtual_network_v4 has no hosts".into()))?;
        let gateway_v6 = first_v6_host(&network_v6);

        let mut tls_config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain, identity.key)
            .map_err(|e| Error::Config(format!("bad TLS identity: {}", e)))?;
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let domain_filter = DomainFilter::new(&options.blocked_domains);

        Ok(Arc::new(Self {
            state: Arc::new(ServerState {
                options,
                access,
                factory,
                tun,
                sessions: SessionManager::new(),
                acceptor: TlsAcceptor::from(Arc::new(tls_config)),
                udp: Mutex::new(None),
                network_v4,
                network_v6,
                gateway_v4,
                gateway_v6,
                domain_filter,
                running: AtomicBool::new(false),
            }),
            shutdown: Arc::new(Notify::new()),
            local_addr: Mutex::new(None),
        }))
    }

    /// TCP address actually bound, available once `run` has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.state.sessions
    }

    /// Stop accepting and dispose every session.
    pub async fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
        self.state
            .sessions
            .cleanup(Duration::from_secs(0))
            .await;
        if let Some(transmitter) = self.state.udp.lock().take() {
            transmitter.close();
        }
        info!("tunnel server stopped");
    }

    /// Bind and serve until `stop` is called.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.state.options.listen).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        self.state.running.store(true, Ordering::Release);

        if self.state.options.enable_udp_channel {
            let udp_listen = self
                .state
                .options
                .udp_listen
                .unwrap_or_else(|| SocketAddr::new(local.ip(), 0));
            let transmitter = UdpTransmitter::bind(udp_listen).await?;
            debug!("udp transmitter on {}", transmitter.local_addr()?);
            *self.state.udp.lock() = Some(transmitter);
        }

        // Periodic sweep: usage sync, idle sessions, pool eviction
        let state = Arc::clone(&self.state);
        let period = Duration::from_secs(self.state.options.cleanup_period_secs.max(1));
        let timeout = Duration::from_secs(self.state.options.session_timeout_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if !state.running.load(Ordering::Acquire) {
                    break;
                }
                state.sessions.cleanup(timeout).await;
            }
        });

        info!("tunnel server listening on {}", local);
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, peer).await {
                    debug!("connection {} ended: {}", peer, e);
                }
            });
        }
        Ok(())
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let tls = state.acceptor.accept(stream).await?;
    let mut stream: Stream = tls.into_stream();

    // One TLS stream carries a sequence of requests until a channel op
    // takes it over or the client goes away
    loop {
        let request = tokio::time::timeout(REQUEST_STREAM_IDLE, wire::read_request(&mut stream));
        let (op, body) = match request.await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(Error::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()), // idle, reap the stream
        };

        match op {
            OpCode::Hello => {
                let request: HelloRequest = wire::parse_body(&body)?;
                match handle_hello(&state, request, peer).await {
                    Ok(response) => wire::write_response(&mut stream, &response).await?,
                    Err(e) => {
                        let response = error_response(&e);
                        wire::write_response(&mut stream, &response).await?;
                    }
                }
            }
            OpCode::Bye => {
                let request: ByeRequest = wire::parse_body(&body)?;
                let response = match authorized_session(&state, request.session_id, &request.session_key) {
                    Ok(session) => {
                        session.dispose(ErrorCode::SessionClosed, SuppressedTo::None).await;
                        SessionResponse::ok()
                    }
                    Err(e) => error_response(&e),
                };
                wire::write_response(&mut stream, &response).await?;
                return Ok(());
            }
            OpCode::SessionStatus => {
                let request: SessionStatusRequest = wire::parse_body(&body)?;
                let response = handle_status(&state, &request).await;
                wire::write_response(&mut stream, &response).await?;
            }
            OpCode::RewardedAd => {
                let request: RewardedAdRequest = wire::parse_body(&body)?;
                let response = handle_rewarded_ad(&state, request).await;
                wire::write_response(&mut stream, &response).await?;
            }
            OpCode::TcpPacketChannel => {
                let request: TcpPacketChannelRequest = wire::parse_body(&body)?;
                let session = match authorized_session(&state, request.session_id, &request.session_key)
                {
                    Ok(session) => session,
                    Err(e) => {
                        wire::write_response(&mut stream, &error_response(&e)).await?;
                        return Ok(());
                    }
                };
                wire::write_response(&mut stream, &SessionResponse::ok()).await?;

                // The stream now belongs to the packet channel
                session.touch();
                let channel = StreamPacketChannel::spawn(
                    format!("srv-{}-{}", session.session_id, uuid::Uuid::new_v4().simple()),
                    stream,
                    session.tunnel().packet_sink(),
                    StreamChannelConfig {
                        queue_capacity: state.options.packet_queue_capacity,
                        lifespan: None,
                    },
                );
                session.tunnel().add_channel(channel)?;
                return Ok(());
            }
            OpCode::StreamProxy => {
                let request: StreamProxyRequest = wire::parse_body(&body)?;
                return handle_stream_proxy(&state, request, stream).await;
            }
            OpCode::UdpPacket => {
                let request: UdpPacketRequest = wire::parse_body(&body)?;
                let response = match authorized_session(&state, request.session_id, &request.session_key)
                {
                    Ok(session) => {
                        use base64::Engine;
                        for encoded in &request.packets {
                            let Ok(raw) =
                                base64::engine::general_purpose::STANDARD.decode(encoded)
                            else {
                                continue;
                            };
                            if let Ok(packet) = crate::common::IpPacket::new(raw) {
                                session.inject_packet(packet);
                            }
                        }
                        SessionResponse::ok()
                    }
                    Err(e) => error_response(&e),
                };
                wire::write_response(&mut stream, &response).await?;
            }
        }
    }
}

/// Look up a live session and verify its key.
fn authorized_session(
    state: &ServerState,
    session_id: u64,
    session_key: &[u8; 16],
) -> Result<Arc<ServerSession>> {
    let session = state
        .sessions
        .get(session_id)
        .ok_or_else(|| Error::session(ErrorCode::SessionClosed, "unknown session"))?;
    session.verify_key(session_key)?;
    if let Some(reason) = session.dispose_reason() {
        return Err(Error::session(reason.code, "session ended"));
    }
    Ok(session)
}

fn error_response(error: &Error) -> SessionResponse {
    let mut response = SessionResponse::error(error.error_code(), error.to_string());
    if let Error::RedirectHost(endpoints) = error {
        response.redirect_endpoints = Some(endpoints.clone());
    }
    response
}

async fn handle_hello(
    state: &Arc<ServerState>,
    request: HelloRequest,
    peer: SocketAddr,
) -> Result<HelloResponse> {
    // Version negotiation first; nothing else matters if we cannot talk
    let protocol_version = MAX_PROTOCOL_VERSION.min(request.client_info.max_protocol_version);
    if protocol_version < MIN_PROTOCOL_VERSION.max(request.client_info.min_protocol_version) {
        return Err(Error::session(
            ErrorCode::GeneralError,
            format!(
                "no common protocol version (server {}..={})",
                MIN_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION
            ),
        ));
    }

    if let Some(endpoints) = &state.options.redirect_endpoints {
        if request.allow_redirect {
            return Err(Error::RedirectHost(endpoints.clone()));
        }
    }

    let grant = state
        .access
        .session_add(SessionRequest {
            token_id: request.token_id.clone(),
            client_id: request.client_info.client_id,
            encrypted_client_id: request.encrypted_client_id,
            client_address: peer,
        })
        .await?;

    let suppressed_to = state
        .sessions
        .suppress_for(
            &request.token_id,
            request.client_info.client_id,
            grant.max_client_count,
        )
        .await;

    let (virtual_v4, virtual_v6) = allocate_virtual_ips(state)?;
    let server_ipv6 = state.tun.as_ref().is_some_and(|t| t.supports(crate::common::IpVersion::V6));
    let is_ipv6_supported = request.is_ipv6_supported && server_ipv6;

    let session = ServerSession::new(
        grant.session_id,
        request.token_id.clone(),
        request.client_info.client_id,
        virtual_v4,
        virtual_v6,
        is_ipv6_supported,
        grant.expiration,
        SessionContext {
            gateway_v4: state.gateway_v4,
            gateway_v6: state.gateway_v6,
            include_local_network: state.options.include_local_network,
            max_packet_channels: state.options.max_packet_channels,
            max_tcp_channel_count: state.options.max_tcp_channel_count,
            max_tcp_connect_wait_count: state.options.max_tcp_connect_wait_count,
            net_scan_limit: state.options.net_scan_limit,
            net_scan_window: Duration::from_secs(state.options.net_scan_window_secs),
            usage_sync_threshold: state.options.usage_sync_threshold,
            proxy_pool: ProxyPoolConfig {
                udp_timeout: Duration::from_secs(state.options.udp_timeout_secs),
                icmp_timeout: Duration::from_secs(state.options.icmp_timeout_secs),
                max_udp_client_count: state.options.max_udp_client_count,
                max_ping_client_count: state.options.max_ping_client_count,
            },
            session_timeout: Duration::from_secs(state.options.session_timeout_secs),
        },
        Arc::clone(&state.factory),
        state.tun.clone(),
        Arc::clone(&state.access),
    );

    // UDP mode is decided at hello: register the shared-socket channel now
    let mut udp_port = None;
    if state.options.enable_udp_channel {
        let transmitter = state.udp.lock().clone();
        if let Some(transmitter) = transmitter {
            udp_port = Some(transmitter.local_addr()?.port());
            if request.use_udp_channel {
                let channel = transmitter.create_channel(
                    session.session_id,
                    &session.server_secret,
                    None,
                    session.tunnel().packet_sink(),
                )?;
                session.tunnel().add_channel(channel)?;
            }
        }
    }

    state.sessions.insert(Arc::clone(&session));
    info!(
        "session {} created for {} from {} ({})",
        session.session_id, request.token_id, peer, virtual_v4
    );

    Ok(HelloResponse {
        response: SessionResponse {
            suppressed_to,
            ..SessionResponse::ok().with_usage(grant.usage)
        },
        session_id: session.session_id,
        session_key: session.session_key,
        server_secret: session.server_secret,
        protocol_version,
        udp_port,
        virtual_ip_v4: virtual_v4,
        virtual_ip_v6: virtual_v6,
        is_ipv6_supported,
        mtu: state.options.mtu,
        max_packet_channel_count: state.options.max_packet_channels,
        include_ip_ranges: vec!["0.0.0.0/0".into(), "::/0".into()],
        vpn_adapter_include_ip_ranges: vec!["0.0.0.0/0".into(), "::/0".into()],
        dns_servers: state.options.dns_servers.clone(),
        client_public_address: Some(peer.ip()),
        ad_requirement: grant.ad_requirement,
    })
}

fn allocate_virtual_ips(state: &ServerState) -> Result<(Ipv4Addr, Ipv6Addr)> {
    let in_use = state.sessions.virtual_v4_in_use();
    // Gateway holds the first host address; clients get the rest
    for candidate in state.network_v4.hosts().skip(1) {
        if !in_use.contains(&candidate) {
            let offset = u32::from(candidate) - u32::from(state.network_v4.network());
            let v6 = v6_at_offset(&state.network_v6, offset);
            return Ok((candidate, v6));
        }
    }
    Err(Error::session(
        ErrorCode::GeneralError,
        "virtual address space exhausted",
    ))
}

fn first_v6_host(network: &Ipv6Net) -> Ipv6Addr {
    v6_at_offset(network, 1)
}

fn v6_at_offset(network: &Ipv6Net, offset: u32) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(network.network()) + offset as u128)
}

async fn handle_status(state: &Arc<ServerState>, request: &SessionStatusRequest) -> SessionResponse {
    let session = match authorized_session(state, request.session_id, &request.session_key) {
        Ok(session) => session,
        Err(e) => {
            // A suppressed or expired session answers with its reason and
            // who displaced it
            if let Some(session) = state.sessions.get(request.session_id) {
                if session.verify_key(&request.session_key).is_ok() {
                    if let Some(reason) = session.dispose_reason() {
                        let mut response = SessionResponse::error(reason.code, "session ended");
                        response.suppressed_to = reason.suppressed_to;
                        return response;
                    }
                }
            }
            return error_response(&e);
        }
    };

    session.touch();
    session.sync_usage(true).await;
    if session.is_disposed() {
        let reason = session.dispose_reason();
        let (code, suppressed_to) = reason
            .map(|r| (r.code, r.suppressed_to))
            .unwrap_or((ErrorCode::SessionClosed, SuppressedTo::None));
        let mut response = SessionResponse::error(code, "session ended");
        response.suppressed_to = suppressed_to;
        return response;
    }

    match state.access.session_get(session.session_id).await {
        Ok(grant) => SessionResponse::ok().with_usage(grant.usage),
        Err(e) => error_response(&e),
    }
}

async fn handle_rewarded_ad(state: &Arc<ServerState>, request: RewardedAdRequest) -> SessionResponse {
    let session = match authorized_session(state, request.session_id, &request.session_key) {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };
    session.touch();
    match state
        .access
        .session_add_usage(session.session_id, Default::default(), Some(request.ad_data))
        .await
    {
        Ok(usage) => {
            session.set_expiration(usage.expiration);
            SessionResponse::ok().with_usage(usage)
        }
        Err(e) => error_response(&e),
    }
}

async fn handle_stream_proxy(
    state: &Arc<ServerState>,
    request: StreamProxyRequest,
    mut stream: Stream,
) -> Result<()> {
    let session = match authorized_session(&state, request.session_id, &request.session_key) {
        Ok(session) => session,
        Err(e) => {
            wire::write_response(&mut stream, &error_response(&e)).await?;
            return Ok(());
        }
    };
    session.touch();

    let outcome = async {
        let destination = resolve_destination(&request.destination).await?;
        if !session.verify_destination(IpProtocol::Tcp, destination) {
            session.reporter().report("net_scan", "stream proxy rate limited");
            return Err(Error::NetScan);
        }

        let connect_guard = session.begin_tcp_connect()?;
        let downstream =
            tokio::time::timeout(PROXY_CONNECT_TIMEOUT, TcpStream::connect(destination))
                .await
                .map_err(|_| Error::RequestTimeout)??;
        downstream.set_nodelay(true)?;
        drop(connect_guard);

        let channel_guard = session.begin_tcp_channel()?;
        Ok((downstream, channel_guard))
    }
    .await;

    let (downstream, channel_guard) = match outcome {
        Ok(pair) => pair,
        Err(e) => {
            wire::write_response(&mut stream, &error_response(&e)).await?;
            return Ok(());
        }
    };
    wire::write_response(&mut stream, &SessionResponse::ok()).await?;

    // SNI peek on the first segment; a blocked domain ends the flow here
    let mut first_segment = vec![0u8; 16 * 1024];
    let peeked = match tokio::time::timeout(SNI_PEEK_TIMEOUT, async {
        use tokio::io::AsyncReadExt;
        stream.read(&mut first_segment).await
    })
    .await
    {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => 0,
    };
    first_segment.truncate(peeked);

    if let Some(domain) = state.domain_filter.check_first_segment(&first_segment) {
        session
            .reporter()
            .report("net_filter", &format!("blocked domain {}", domain));
        return Ok(());
    }

    let mut downstream: Stream = downstream.into_stream();
    if !first_segment.is_empty() {
        use tokio::io::AsyncWriteExt;
        downstream.write_all(&first_segment).await?;
        downstream.flush().await?;
    }

    let channel = ProxyChannel::new(
        format!("srv-proxy-{}", session.session_id),
        state.options.tcp_buffer_size,
    );
    session.tunnel().attach_meter(channel.meter());
    let traffic = channel.run(stream, downstream).await;
    debug!(
        "session {} stream proxy to {} done ({})",
        session.session_id, request.destination, traffic
    );
    drop(channel_guard);
    Ok(())
}

async fn resolve_destination(destination: &str) -> Result<SocketAddr> {
    if let Ok(addr) = destination.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(destination)
        .await?
        .next()
        .ok_or_else(|| Error::Protocol(format!("cannot resolve {}", destination)))
}
