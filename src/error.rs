//! Error types for Tunelay

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error taxonomy, shared verbatim by client and server.
///
/// Carried in every [`SessionResponse`](crate::wire::SessionResponse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    Ok,
    SessionClosed,
    SessionSuppressed,
    AccessExpired,
    AccessTrafficOverflow,
    AccessError,
    RedirectHost,
    RewardedAdRejected,
    UnauthorizedAccess,
    GeneralError,
}

impl ErrorCode {
    /// Codes that end the session; no retry or pause path applies.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorCode::AccessExpired
                | ErrorCode::AccessTrafficOverflow
                | ErrorCode::UnauthorizedAccess
                | ErrorCode::SessionSuppressed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::SessionClosed => "session_closed",
            ErrorCode::SessionSuppressed => "session_suppressed",
            ErrorCode::AccessExpired => "access_expired",
            ErrorCode::AccessTrafficOverflow => "access_traffic_overflow",
            ErrorCode::AccessError => "access_error",
            ErrorCode::RedirectHost => "redirect_host",
            ErrorCode::RewardedAdRejected => "rewarded_ad_rejected",
            ErrorCode::UnauthorizedAccess => "unauthorized_access",
            ErrorCode::GeneralError => "general_error",
        };
        f.write_str(s)
    }
}

/// Main error type for Tunelay
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session error ({code}): {message}")]
    Session { code: ErrorCode, message: String },

    #[error("Server redirected to {0:?}")]
    RedirectHost(Vec<SocketAddr>),

    #[error("Second redirect received; refusing the loop")]
    RedirectLoop,

    #[error("Packet dropped")]
    PacketDrop,

    #[error("Packet rejected by net filter: {0}")]
    NetFilter(String),

    #[error("Destination rate limited by net scan detector")]
    NetScan,

    #[error("Too many proxy channels")]
    MaxTcpChannel,

    #[error("Too many TCP connects in flight")]
    MaxTcpConnectWait,

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("No server endpoint reachable")]
    NoServerAvailable,

    #[error("Session was disposed")]
    Disposed,
}

impl Error {
    /// Create a session error from a wire response code.
    pub fn session(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Session {
            code,
            message: message.into(),
        }
    }

    /// The wire code this error maps onto, `GeneralError` if it has none.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Session { code, .. } => *code,
            Error::RedirectHost(_) => ErrorCode::RedirectHost,
            _ => ErrorCode::GeneralError,
        }
    }

    /// Whether the error disposes the session immediately.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::Session { code, .. } => code.is_terminal(),
            Error::RedirectLoop | Error::Disposed => true,
            _ => false,
        }
    }
}

/// Result type alias for Tunelay
pub type Result<T> = std::result::Result<T, Error>;
