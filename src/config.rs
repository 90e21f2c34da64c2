//! Configuration
//!
//! JSON configuration for the client and the server, loadable from disk.
//! Durations are plain seconds so the files stay hand-editable; the two
//! deadlines that interact with breakpoints (`request_timeout`,
//! `bye_timeout`) get accessor methods that stretch under debug builds.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::AccessToken;
use crate::error::{Error, Result};

/// Timeout multiplier for debug builds, where a breakpoint would
/// otherwise trip request deadlines
#[cfg(debug_assertions)]
const DEBUG_TIMEOUT_FACTOR: u32 = 3;

/// Client-side tuning and policy switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Stable device identity; generated once and persisted by the caller
    pub client_id: Uuid,
    pub use_udp_channel: bool,
    pub drop_udp: bool,
    pub drop_quic: bool,
    pub use_tcp_over_tun: bool,
    pub include_local_network: bool,
    pub max_packet_channels: usize,
    pub packet_queue_capacity: usize,
    pub tcp_buffer_size: usize,
    /// Stream channel lifespan bounds in seconds; 0/0 disables lifespans
    pub channel_min_lifespan_secs: u64,
    pub channel_max_lifespan_secs: u64,
    pub request_timeout_secs: u64,
    pub tcp_reuse_timeout_secs: u64,
    pub reconnect_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub auto_wait_timeout_secs: u64,
    pub bye_timeout_secs: u64,
    pub server_query_timeout_secs: u64,
    pub cleanup_period_secs: u64,
    pub server_location: Option<String>,
    pub plan_id: Option<String>,
    pub access_code: Option<String>,
    /// Domain suffixes rejected by the SNI peek on proxied flows
    pub blocked_domains: Vec<String>,
    /// Where the persisted `ConnectionInfo` JSON goes, if anywhere
    pub connection_info_path: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4(),
            use_udp_channel: false,
            drop_udp: false,
            drop_quic: false,
            use_tcp_over_tun: true,
            include_local_network: false,
            max_packet_channels: 8,
            packet_queue_capacity: 255,
            tcp_buffer_size: 32 * 1024,
            channel_min_lifespan_secs: 300,
            channel_max_lifespan_secs: 600,
            request_timeout_secs: 30,
            tcp_reuse_timeout_secs: 60,
            reconnect_timeout_secs: 30,
            session_timeout_secs: 300,
            auto_wait_timeout_secs: 10,
            bye_timeout_secs: 10,
            server_query_timeout_secs: 10,
            cleanup_period_secs: 30,
            server_location: None,
            plan_id: None,
            access_code: None,
            blocked_domains: Vec::new(),
            connection_info_path: None,
            user_agent: concat!("tunelay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientOptions {
    pub fn request_timeout(&self) -> Duration {
        stretch(Duration::from_secs(self.request_timeout_secs))
    }

    pub fn bye_timeout(&self) -> Duration {
        stretch(Duration::from_secs(self.bye_timeout_secs))
    }

    /// Lifespan bounds, `None` when disabled.
    pub fn channel_lifespan(&self) -> Option<(Duration, Duration)> {
        if self.channel_max_lifespan_secs == 0 {
            return None;
        }
        let min = self.channel_min_lifespan_secs.min(self.channel_max_lifespan_secs);
        Some((
            Duration::from_secs(min),
            Duration::from_secs(self.channel_max_lifespan_secs),
        ))
    }
}

#[cfg(debug_assertions)]
fn stretch(base: Duration) -> Duration {
    base * DEBUG_TIMEOUT_FACTOR
}

#[cfg(not(debug_assertions))]
fn stretch(base: Duration) -> Duration {
    base
}

/// Server-side tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub enable_udp_channel: bool,
    /// UDP bind address; defaults to the TCP listen address
    pub udp_listen: Option<SocketAddr>,
    pub certificate_file: Option<String>,
    pub key_file: Option<String>,
    /// Token and usage storage directory
    pub storage_dir: PathBuf,
    pub virtual_network_v4: String,
    pub virtual_network_v6: String,
    pub mtu: u16,
    pub max_packet_channels: usize,
    pub packet_queue_capacity: usize,
    pub tcp_buffer_size: usize,
    pub session_timeout_secs: u64,
    pub cleanup_period_secs: u64,
    /// Proxy (stream) channels per session
    pub max_tcp_channel_count: usize,
    /// Outbound TCP connects in flight per session
    pub max_tcp_connect_wait_count: usize,
    /// Distinct destinations per window; 0 disables NetScan
    pub net_scan_limit: usize,
    pub net_scan_window_secs: u64,
    pub udp_timeout_secs: u64,
    pub icmp_timeout_secs: u64,
    pub max_udp_client_count: usize,
    pub max_ping_client_count: usize,
    pub include_local_network: bool,
    /// Domain suffixes rejected by the SNI peek on stream proxies
    pub blocked_domains: Vec<String>,
    /// Unsynced session traffic that forces an access-manager sync
    pub usage_sync_threshold: u64,
    pub dns_servers: Vec<IpAddr>,
    /// When set, every hello that allows redirects is bounced here
    pub redirect_endpoints: Option<Vec<SocketAddr>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9443".parse().unwrap(),
            enable_udp_channel: true,
            udp_listen: None,
            certificate_file: None,
            key_file: None,
            storage_dir: PathBuf::from("./tokens"),
            virtual_network_v4: "10.255.0.0/24".into(),
            virtual_network_v6: "fd00:5ef::/64".into(),
            mtu: 1420,
            max_packet_channels: 8,
            packet_queue_capacity: 255,
            tcp_buffer_size: 32 * 1024,
            session_timeout_secs: 300,
            cleanup_period_secs: 30,
            max_tcp_channel_count: 128,
            max_tcp_connect_wait_count: 64,
            net_scan_limit: 200,
            net_scan_window_secs: 300,
            udp_timeout_secs: 120,
            icmp_timeout_secs: 30,
            max_udp_client_count: 500,
            max_ping_client_count: 100,
            include_local_network: false,
            blocked_domains: Vec::new(),
            usage_sync_threshold: 5 * 1024 * 1024,
            dns_servers: vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            redirect_endpoints: None,
        }
    }
}

/// Client configuration file: the access token plus options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub token: AccessToken,
    #[serde(default)]
    pub options: ClientOptions,
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }
}

/// Server configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub options: ServerOptions,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }
}
