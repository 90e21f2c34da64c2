//! Connector: the client's control-plane connection
//!
//! Opens TLS to the chosen server endpoint, verifies the certificate
//! against the pinned hash from the access token, and sends framed
//! requests. After the hello, idle request streams are pooled and reused
//! until `tcp_reuse_timeout`; channel-establishing requests mark their
//! stream `prevent_reuse` and keep it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::common::{IntoStream, Stream};
use crate::crypto::sha256;
use crate::error::{Error, Result};
use crate::wire::{self, HelloRequest, HelloResponse, OpCode, SessionResponse};

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub endpoint: SocketAddr,
    /// SNI name presented during the handshake
    pub host_name: String,
    /// Pinned SHA-256 of the server's end-entity certificate; `None`
    /// falls back to web-PKI validation
    pub certificate_hash: Option<[u8; 32]>,
    pub request_timeout: Duration,
    pub tcp_reuse_timeout: Duration,
}

struct PooledStream {
    stream: Stream,
    since: Instant,
}

pub struct Connector {
    config: ConnectorConfig,
    tls: TlsConnector,
    pool: Mutex<Vec<PooledStream>>,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Result<Arc<Self>> {
        let tls_config = match config.certificate_hash {
            Some(hash) => {
                let mut base = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier { hash }))
                    .with_no_client_auth();
                base.alpn_protocols = alpn();
                base
            }
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let mut base = ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                base.alpn_protocols = alpn();
                base
            }
        };

        Ok(Arc::new(Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
            pool: Mutex::new(Vec::new()),
        }))
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.config.endpoint
    }

    /// Take a pooled stream or open a fresh TLS connection.
    async fn open_stream(&self) -> Result<Stream> {
        {
            let mut pool = self.pool.lock();
            pool.retain(|p| p.since.elapsed() < self.config.tcp_reuse_timeout);
            if let Some(pooled) = pool.pop() {
                trace!("reusing request stream (age {:?})", pooled.since.elapsed());
                return Ok(pooled.stream);
            }
        }

        let tcp = TcpStream::connect(self.config.endpoint).await?;
        tcp.set_nodelay(true)?;
        let server_name = ServerName::try_from(self.config.host_name.clone())
            .map_err(|_| Error::Config(format!("invalid host name {}", self.config.host_name)))?;
        let tls = self.tls.connect(server_name, tcp).await?;
        debug!("connector opened stream to {}", self.config.endpoint);
        Ok(tls.into_stream())
    }

    fn return_to_pool(&self, stream: Stream) {
        self.pool.lock().push(PooledStream {
            stream,
            since: Instant::now(),
        });
    }

    /// Send one framed request and read the raw response bytes; the
    /// stream comes back to the caller for reuse or channel handover.
    async fn exchange<B: Serialize>(&self, op: OpCode, body: &B) -> Result<(Vec<u8>, Stream)> {
        let work = async {
            let mut stream = self.open_stream().await?;
            wire::write_request(&mut stream, op, body).await?;
            let bytes = wire::read_response_bytes(&mut stream).await?;
            Ok::<_, Error>((bytes, stream))
        };
        tokio::time::timeout(self.config.request_timeout, work)
            .await
            .map_err(|_| Error::RequestTimeout)?
    }

    /// Request/response; the stream is pooled again on success.
    pub async fn request<B: Serialize>(&self, op: OpCode, body: &B) -> Result<SessionResponse> {
        let (bytes, stream) = self.exchange(op, body).await?;
        let response: SessionResponse = serde_json::from_slice(&bytes)?;
        let response = response.into_result()?;
        self.return_to_pool(stream);
        Ok(response)
    }

    /// Request whose stream is handed over to the caller (packet and
    /// proxy channels). Never pooled.
    pub async fn request_stream<B: Serialize>(
        &self,
        op: OpCode,
        body: &B,
    ) -> Result<(SessionResponse, Stream)> {
        let (bytes, stream) = self.exchange(op, body).await?;
        let response: SessionResponse = serde_json::from_slice(&bytes)?;
        let response = response.into_result()?;
        Ok((response, stream))
    }

    /// The session hello. Its stream is deliberately not reused.
    pub async fn hello(&self, request: &HelloRequest) -> Result<HelloResponse> {
        let (bytes, _stream) = self.exchange(OpCode::Hello, request).await?;
        let base: SessionResponse = serde_json::from_slice(&bytes)?;
        base.into_result()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Drop every pooled stream.
    pub fn clear_pool(&self) {
        self.pool.lock().clear();
    }
}

fn alpn() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

/// Accepts exactly the certificate whose SHA-256 matches the token's pin.
#[derive(Debug)]
struct PinnedCertVerifier {
    hash: [u8; 32],
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if sha256(end_entity.as_ref()) == self.hash {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
