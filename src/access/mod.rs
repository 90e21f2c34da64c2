//! Access management
//!
//! The access manager is the external authority that authorizes sessions,
//! meters traffic and issues tokens. The tunnel core consumes this trait;
//! [`FileAccessManager`] is the bundled file-backed implementation.

mod file;
mod token;

pub use file::FileAccessManager;
pub use token::{
    now_ms, AccessToken, AccessTokenUsage, AdRequirement, LegacyAccessToken, USAGE_SCHEMA_VERSION,
};

use std::net::SocketAddr;

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::Traffic;
use crate::error::Result;
use crate::wire::AccessUsage;

/// What the server hands to the manager when a hello arrives.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub token_id: String,
    pub client_id: Uuid,
    pub encrypted_client_id: [u8; 16],
    pub client_address: SocketAddr,
}

/// A successfully authorized session, as seen by the access layer.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session_id: u64,
    pub usage: AccessUsage,
    pub ad_requirement: AdRequirement,
    /// Concurrent client cap carried over from the token; drives
    /// suppression in the server session manager
    pub max_client_count: Option<u32>,
    /// Session hard stop, unix epoch milliseconds
    pub expiration: Option<u64>,
}

/// Authorizes sessions and meters usage.
///
/// All failures are reported as `Error::Session` carrying the wire error
/// code (`access_error`, `access_expired`, `access_traffic_overflow`,
/// `unauthorized_access`), so the server can answer with the exact
/// taxonomy the client expects.
#[async_trait]
pub trait AccessManager: Send + Sync {
    /// Authorize a hello and register a new session.
    async fn session_add(&self, request: SessionRequest) -> Result<SessionGrant>;

    /// Look up a live session.
    async fn session_get(&self, session_id: u64) -> Result<SessionGrant>;

    /// Meter traffic (and optionally an ad completion) against a session's
    /// token. Returns the updated usage snapshot.
    async fn session_add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        ad_data: Option<String>,
    ) -> Result<AccessUsage>;

    /// Close a session, metering its final traffic.
    async fn session_close(&self, session_id: u64, traffic: Traffic) -> Result<()>;
}
