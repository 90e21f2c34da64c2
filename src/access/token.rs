//! Access tokens and their usage records
//!
//! A token is issued out of band by the access manager and consumed
//! read-only by sessions. Usage is the mutable sibling, updated under the
//! token's exclusive lock and persisted after every mutation.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::wire::{base64_bytes, base64_opt_bytes};

/// Usage file schema version written by this build
pub const USAGE_SCHEMA_VERSION: u32 = 2;

/// Advertising obligation attached to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdRequirement {
    #[default]
    None,
    /// An ad may be shown but the session proceeds either way
    Flexible,
    /// The session stays pending until a rewarded ad completes
    Rewarded,
}

/// Identity issued by the access manager (`<id>.token2`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token_id: String,
    #[serde(with = "base64_bytes")]
    pub secret: [u8; 16],
    /// Expiration as unix epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
    /// Traffic cap in bytes (sent + received)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_traffic: Option<u64>,
    /// Concurrent client cap; 1 means the token is not shareable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_client_count: Option<u32>,
    #[serde(default)]
    pub ad_requirement: AdRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Candidate server endpoints probed by the client's server finder
    #[serde(default)]
    pub endpoints: Vec<SocketAddr>,
    /// TLS server name presented to the connector
    pub host_name: String,
    /// Pinned SHA-256 of the server's end-entity certificate
    #[serde(default, with = "base64_opt_bytes", skip_serializing_if = "Option::is_none")]
    pub certificate_hash: Option<[u8; 32]>,
}

impl AccessToken {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration.is_some_and(|at| now_ms > at)
    }
}

/// Per-token metering record (`<id>.usage`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenUsage {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    /// Creation time, unix epoch milliseconds
    pub created_time: u64,
    /// Last activity, unix epoch milliseconds
    pub last_used_time: u64,
    pub version: u32,
}

impl AccessTokenUsage {
    pub fn new(now_ms: u64) -> Self {
        Self {
            sent_bytes: 0,
            received_bytes: 0,
            created_time: now_ms,
            last_used_time: now_ms,
            version: USAGE_SCHEMA_VERSION,
        }
    }

    pub fn total(&self) -> u64 {
        self.sent_bytes + self.received_bytes
    }
}

/// Schema-1 token file (`<id>.token`), auto-converted on open.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyAccessToken {
    pub token_id: String,
    #[serde(with = "base64_bytes")]
    pub secret: [u8; 16],
    #[serde(default)]
    pub expiration: Option<u64>,
    #[serde(default)]
    pub max_traffic: Option<u64>,
    #[serde(default)]
    pub max_client_count: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<SocketAddr>,
    pub host_name: String,
    #[serde(default, with = "base64_opt_bytes")]
    pub certificate_hash: Option<[u8; 32]>,
}

impl From<LegacyAccessToken> for AccessToken {
    fn from(legacy: LegacyAccessToken) -> Self {
        AccessToken {
            token_id: legacy.token_id,
            secret: legacy.secret,
            expiration: legacy.expiration,
            max_traffic: legacy.max_traffic,
            max_client_count: legacy.max_client_count,
            ad_requirement: AdRequirement::None,
            name: legacy.name,
            endpoints: legacy.endpoints,
            host_name: legacy.host_name,
            certificate_hash: legacy.certificate_hash,
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> AccessToken {
        AccessToken {
            token_id: "tok-sample".into(),
            secret: [3u8; 16],
            expiration: Some(1_700_000_000_000),
            max_traffic: Some(1024 * 1024),
            max_client_count: Some(1),
            ad_requirement: AdRequirement::Flexible,
            name: Some("sample".into()),
            endpoints: vec!["127.0.0.1:9443".parse().unwrap()],
            host_name: "vpn.example.com".into(),
            certificate_hash: Some([0xab; 32]),
        }
    }

    #[test]
    fn token_json_roundtrip() {
        let token = sample_token();
        let json = serde_json::to_string_pretty(&token).unwrap();
        let back: AccessToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back.token_id, token.token_id);
        assert_eq!(back.secret, token.secret);
        assert_eq!(back.certificate_hash, token.certificate_hash);
        assert_eq!(back.ad_requirement, AdRequirement::Flexible);
        assert_eq!(back.endpoints, token.endpoints);
    }

    #[test]
    fn expiration_check() {
        let token = sample_token();
        assert!(!token.is_expired(1_600_000_000_000));
        assert!(token.is_expired(1_800_000_000_000));
    }

    #[test]
    fn legacy_token_converts_without_ad_requirement() {
        let json = r#"{
            "token_id": "tok-legacy",
            "secret": "AQEBAQEBAQEBAQEBAQEBAQ==",
            "host_name": "old.example.com",
            "max_traffic": 5000
        }"#;
        let legacy: LegacyAccessToken = serde_json::from_str(json).unwrap();
        let token: AccessToken = legacy.into();
        assert_eq!(token.token_id, "tok-legacy");
        assert_eq!(token.ad_requirement, AdRequirement::None);
        assert_eq!(token.max_traffic, Some(5000));
        assert_eq!(token.secret, [1u8; 16]);
    }
}
