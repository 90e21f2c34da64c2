//! Persisted connection state
//!
//! The VPN service writes a `ConnectionInfo` JSON after every state
//! change so UI front-ends can follow along without holding the session.
//! A UI reader may hold the file briefly, so writes retry for up to two
//! seconds before giving up with a warning.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::access::now_ms;
use crate::common::Traffic;
use crate::wire::AccessUsage;

use super::ClientState;

/// Total time spent retrying a failed write
const WRITE_RETRY_WINDOW: Duration = Duration::from_secs(2);

/// Pause between retries
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub virtual_ip_v4: Ipv4Addr,
    pub virtual_ip_v6: Ipv6Addr,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_public_address: Option<IpAddr>,
}

/// Live throughput and usage snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: ClientState,
    pub traffic: Traffic,
    pub speed: Traffic,
    pub channel_count: usize,
    pub is_udp_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_usage: Option<AccessUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub client_state: ClientState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_time: u64,
}

impl ConnectionInfo {
    pub fn new(client_state: ClientState) -> Self {
        Self {
            client_state,
            api_endpoint: None,
            api_key: None,
            session_info: None,
            session_status: None,
            error: None,
            created_time: now_ms(),
        }
    }
}

pub struct ConnectionInfoFile {
    path: PathBuf,
}

impl ConnectionInfoFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Write with retry; a persistent failure is logged, never fatal.
    pub async fn write(&self, info: &ConnectionInfo) {
        let json = match serde_json::to_vec_pretty(info) {
            Ok(json) => json,
            Err(e) => {
                warn!("connection info serialization failed: {}", e);
                return;
            }
        };

        let deadline = tokio::time::Instant::now() + WRITE_RETRY_WINDOW;
        loop {
            match tokio::fs::write(&self.path, &json).await {
                Ok(()) => return,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::debug!("connection info write retry: {}", e);
                    tokio::time::sleep(WRITE_RETRY_PAUSE).await;
                }
                Err(e) => {
                    warn!("connection info write failed: {}", e);
                    return;
                }
            }
        }
    }
}
