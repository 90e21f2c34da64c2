//! Tunnel client
//!
//! The client session owns the whole client side: the server finder, the
//! connector, the tunnel and its channels, the local proxies, and the
//! state machine that decides per packet whether to tunnel, proxy
//! locally, or drop.

mod connector;
mod finder;
mod session;
mod state;
mod tcp_host;

pub use connector::{Connector, ConnectorConfig};
pub use finder::find_best_endpoint;
pub use session::ClientSession;
pub use state::{ConnectionInfo, ConnectionInfoFile, SessionInfo, SessionStatus};
pub use tcp_host::{FlowConnector, TcpProxyHost};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Client session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    #[default]
    None,
    Connecting,
    WaitingForAd,
    Connected,
    /// Paused after repeated request failures; the next device packet
    /// past the wait window triggers a reconnect
    Waiting,
    Disconnecting,
    Disposed,
}

/// Shows rewarded or flexible ads when the token demands them. The UI
/// layer implements this; the session only awaits the completion data.
#[async_trait]
pub trait AdProvider: Send + Sync {
    async fn show_ad(&self, session_id: u64) -> Result<String>;
}
