//! Session responses
//!
//! Every reply on the control plane is a `SessionResponse`; the hello reply
//! is a superset decoded separately. Error codes travel as snake_case
//! strings so both sides share one taxonomy.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::common::Traffic;
use crate::error::{Error, ErrorCode, Result};

/// Who a suppressed session was displaced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuppressedTo {
    #[default]
    None,
    /// The new session replaced an older session of the same client.
    #[serde(rename = "self")]
    SelfSession,
    /// Another client's session pushed this one out.
    Other,
}

/// Access usage snapshot attached to responses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccessUsage {
    /// Cumulative traffic metered against the token
    pub traffic: Traffic,
    /// Traffic cap in bytes, if the token carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_traffic: Option<u64>,
    /// Token expiration as unix epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
    /// Live sessions currently using the token
    #[serde(default)]
    pub active_client_count: u32,
}

/// The universal control-plane reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResponse {
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_usage: Option<AccessUsage>,
    /// Populated with `error_code == redirect_host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_endpoints: Option<Vec<SocketAddr>>,
    #[serde(default)]
    pub suppressed_to: SuppressedTo,
}

impl SessionResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn redirect(endpoints: Vec<SocketAddr>) -> Self {
        Self {
            error_code: ErrorCode::RedirectHost,
            redirect_endpoints: Some(endpoints),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: AccessUsage) -> Self {
        self.access_usage = Some(usage);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == ErrorCode::Ok
    }

    /// Turn an error response into the matching [`Error`]; an `ok`
    /// response passes through.
    pub fn into_result(self) -> Result<SessionResponse> {
        match self.error_code {
            ErrorCode::Ok => Ok(self),
            ErrorCode::RedirectHost => Err(Error::RedirectHost(
                self.redirect_endpoints.unwrap_or_default(),
            )),
            code => Err(Error::session(
                code,
                self.error_message.unwrap_or_else(|| code.to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_wire_names() {
        assert_eq!(
            serde_json::to_string(&SuppressedTo::SelfSession).unwrap(),
            "\"self\""
        );
        assert_eq!(serde_json::to_string(&SuppressedTo::Other).unwrap(), "\"other\"");
        let parsed: SuppressedTo = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(parsed, SuppressedTo::None);
    }

    #[test]
    fn into_result_maps_codes() {
        assert!(SessionResponse::ok().into_result().is_ok());

        let err = SessionResponse::error(ErrorCode::AccessExpired, "token expired")
            .into_result()
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::AccessExpired);
        assert!(err.is_terminal());

        let endpoints = vec!["127.0.0.1:5001".parse().unwrap()];
        let err = SessionResponse::redirect(endpoints.clone())
            .into_result()
            .unwrap_err();
        match err {
            Error::RedirectHost(got) => assert_eq!(got, endpoints),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn response_json_roundtrip() {
        let response = SessionResponse::ok().with_usage(AccessUsage {
            traffic: Traffic::new(84, 84),
            max_traffic: Some(1024 * 1024),
            expiration: None,
            active_client_count: 1,
        });
        let json = serde_json::to_string(&response).unwrap();
        let back: SessionResponse = serde_json::from_str(&json).unwrap();
        assert!(back.is_ok());
        let usage = back.access_usage.unwrap();
        assert_eq!(usage.traffic, Traffic::new(84, 84));
        assert_eq!(usage.max_traffic, Some(1024 * 1024));
    }
}
