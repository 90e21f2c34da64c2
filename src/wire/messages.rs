//! Control request and response bodies

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::AdRequirement;

use super::base64_bytes;
use super::response::SessionResponse;

/// Client identity and version data carried in the hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: Uuid,
    pub client_version: String,
    pub min_protocol_version: u32,
    pub max_protocol_version: u32,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub client_info: ClientInfo,
    pub token_id: String,
    /// AES-ECB(token secret, client id); proves token possession
    #[serde(with = "base64_bytes")]
    pub encrypted_client_id: [u8; 16],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    pub allow_redirect: bool,
    pub is_ipv6_supported: bool,
    /// Ask for the UDP packet channel to be set up for this session
    #[serde(default)]
    pub use_udp_channel: bool,
}

/// Hello reply: a [`SessionResponse`] plus the negotiated session.
///
/// On failure only the flattened response fields are present, so callers
/// decode the body as [`SessionResponse`] first and as `HelloResponse`
/// only after checking the error code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    #[serde(flatten)]
    pub response: SessionResponse,
    pub session_id: u64,
    #[serde(with = "base64_bytes")]
    pub session_key: [u8; 16],
    #[serde(with = "base64_bytes")]
    pub server_secret: [u8; 16],
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
    pub virtual_ip_v4: Ipv4Addr,
    pub virtual_ip_v6: Ipv6Addr,
    /// Whether the server will carry IPv6 for this session
    #[serde(default)]
    pub is_ipv6_supported: bool,
    pub mtu: u16,
    pub max_packet_channel_count: usize,
    /// Destinations the server is willing to carry
    #[serde(default)]
    pub include_ip_ranges: Vec<String>,
    /// Ranges the TUN adapter should route into the tunnel
    #[serde(default)]
    pub vpn_adapter_include_ip_ranges: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_public_address: Option<IpAddr>,
    #[serde(default)]
    pub ad_requirement: AdRequirement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByeRequest {
    pub session_id: u64,
    #[serde(with = "base64_bytes")]
    pub session_key: [u8; 16],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusRequest {
    pub session_id: u64,
    #[serde(with = "base64_bytes")]
    pub session_key: [u8; 16],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpPacketChannelRequest {
    pub session_id: u64,
    #[serde(with = "base64_bytes")]
    pub session_key: [u8; 16],
    /// Ask the server to honor a random channel lifespan
    #[serde(default)]
    pub with_lifespan: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProxyRequest {
    pub session_id: u64,
    #[serde(with = "base64_bytes")]
    pub session_key: [u8; 16],
    /// `host:port` the server should connect to
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardedAdRequest {
    pub session_id: u64,
    #[serde(with = "base64_bytes")]
    pub session_key: [u8; 16],
    pub ad_data: String,
}

/// Whole IP packets sent over the control plane (fallback when no packet
/// channel is up yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpPacketRequest {
    pub session_id: u64,
    #[serde(with = "base64_bytes")]
    pub session_key: [u8; 16],
    /// Base64-encoded IP packets
    pub packets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn hello_request_roundtrip() {
        let request = HelloRequest {
            client_info: ClientInfo {
                client_id: Uuid::new_v4(),
                client_version: "0.4.0".into(),
                min_protocol_version: 3,
                max_protocol_version: 4,
                user_agent: "tunelay/test".into(),
            },
            token_id: "tok-1".into(),
            encrypted_client_id: [7u8; 16],
            server_location: None,
            plan_id: None,
            access_code: None,
            allow_redirect: true,
            is_ipv6_supported: false,
            use_udp_channel: false,
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: HelloRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.token_id, "tok-1");
        assert_eq!(back.encrypted_client_id, [7u8; 16]);
        assert!(back.allow_redirect);
    }

    #[test]
    fn hello_response_roundtrip_without_loss() {
        let reply = HelloResponse {
            response: SessionResponse::ok(),
            session_id: 0xdead_beef_cafe,
            session_key: [1u8; 16],
            server_secret: [2u8; 16],
            protocol_version: 4,
            udp_port: Some(9091),
            virtual_ip_v4: Ipv4Addr::new(10, 255, 0, 2),
            virtual_ip_v6: "fd00:5ef::2".parse().unwrap(),
            is_ipv6_supported: true,
            mtu: 1420,
            max_packet_channel_count: 8,
            include_ip_ranges: vec!["0.0.0.0/0".into()],
            vpn_adapter_include_ip_ranges: vec!["0.0.0.0/0".into()],
            dns_servers: vec!["1.1.1.1".parse().unwrap()],
            client_public_address: Some("203.0.113.9".parse().unwrap()),
            ad_requirement: AdRequirement::None,
        };

        let json = serde_json::to_string(&reply).unwrap();

        // The flattened base decodes on its own
        let base: SessionResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(base.error_code, ErrorCode::Ok);

        let back: HelloResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, reply.session_id);
        assert_eq!(back.session_key, reply.session_key);
        assert_eq!(back.server_secret, reply.server_secret);
        assert_eq!(back.udp_port, Some(9091));
        assert_eq!(back.virtual_ip_v4, reply.virtual_ip_v4);
        assert_eq!(back.virtual_ip_v6, reply.virtual_ip_v6);
        assert_eq!(back.mtu, 1420);
        assert_eq!(back.max_packet_channel_count, 8);
        assert_eq!(back.dns_servers, reply.dns_servers);
        assert_eq!(back.client_public_address, reply.client_public_address);
    }
}
