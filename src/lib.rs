//! Tunelay - a client/server VPN tunnel core
//!
//! # Architecture
//!
//! ```text
//! TUN adapter
//! → client Session (packet dispatch)
//! → Tunnel → PacketChannel (TCP stream / UDP) → wire
//! → server Session (dispatch)
//! → server TUN or ProxyPool (NAT)
//! → Internet
//! ```
//!
//! The client captures IP packets from a virtual TUN adapter and carries
//! them over encrypted channels to a server that NATs or proxies them
//! out. Sessions are authenticated and metered by an access manager.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: packets, ranges, streams, counters
//! ├── crypto/          # Key derivation, client-id proof, UDP cipher
//! ├── wire/            # Request framing, op codes, session responses
//! ├── channel/         # Packet channels (stream/UDP) and proxy splice
//! ├── tunnel/          # Per-session channel multiplexer
//! ├── proxy/           # UDP/ICMP cone NAT pool
//! ├── client/          # Client session, connector, local proxies
//! ├── server/          # Server, sessions, suppression, NetScan
//! ├── access/          # Access manager trait + file-backed impl
//! └── device/          # TUN adapter and socket factory seams
//! ```

// Core types
pub mod common;
pub mod error;

// Protocol and transport
pub mod channel;
pub mod crypto;
pub mod tunnel;
pub mod wire;

// Endpoints
pub mod client;
pub mod proxy;
pub mod server;

// Supporting modules
pub mod access;
pub mod config;
pub mod device;

// Re-exports for convenience
pub use common::{IpPacket, Traffic};
pub use error::{Error, ErrorCode, Result};

// Architecture re-exports
pub use access::{AccessManager, AccessToken, FileAccessManager};
pub use client::{ClientSession, ClientState};
pub use config::{ClientConfig, ClientOptions, ServerConfig, ServerOptions};
pub use server::{TunnelServer, TlsIdentity};
pub use tunnel::Tunnel;
