//! Server finder
//!
//! Probes the candidate endpoints listed in the access token in parallel
//! and picks the first that completes a TCP handshake within the query
//! timeout, preferring IPv6 when the client supports it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

pub async fn find_best_endpoint(
    endpoints: &[SocketAddr],
    prefer_ipv6: bool,
    query_timeout: Duration,
) -> Result<SocketAddr> {
    if endpoints.is_empty() {
        return Err(Error::NoServerAvailable);
    }
    let has_ipv6_candidates = endpoints.iter().any(|e| e.is_ipv6());
    let prefer_ipv6 = prefer_ipv6 && has_ipv6_candidates;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for &endpoint in endpoints {
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(query_timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(_stream)) => {
                    let _ = tx.send(endpoint);
                }
                _ => debug!("endpoint {} did not answer", endpoint),
            }
        });
    }
    drop(tx);

    let deadline = tokio::time::Instant::now() + query_timeout;
    let mut first_success: Option<SocketAddr> = None;
    loop {
        let received = tokio::time::timeout_at(deadline, rx.recv()).await;
        match received {
            Ok(Some(endpoint)) => {
                if endpoint.is_ipv6() {
                    debug!("server finder chose {} (IPv6)", endpoint);
                    return Ok(endpoint);
                }
                if first_success.is_none() {
                    first_success = Some(endpoint);
                }
                // Without an IPv6 preference the earliest answer wins
                if !prefer_ipv6 {
                    break;
                }
            }
            // Probes exhausted or the window closed
            Ok(None) | Err(_) => break,
        }
    }

    match first_success {
        Some(endpoint) => {
            debug!("server finder chose {}", endpoint);
            Ok(endpoint)
        }
        None => Err(Error::NoServerAvailable),
    }
}
