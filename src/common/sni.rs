//! TLS SNI peek and the domain filter
//!
//! The only layer-7 inspection in the system: the first segment of a
//! proxied flow to port 443 is checked for a TLS ClientHello, and the
//! server name it advertises is matched against a blocked-suffix list.
//! Anything that is not a ClientHello passes untouched.

use tls_parser::{
    parse_tls_client_hello_extensions, parse_tls_plaintext, SNIType, TlsExtension, TlsMessage,
    TlsMessageHandshake,
};

/// Pull the SNI host name out of a buffer if it starts a ClientHello.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    let (_, record) = parse_tls_plaintext(data).ok()?;
    let message = record.msg.first()?;
    let TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) = message else {
        return None;
    };
    let (_, extensions) = parse_tls_client_hello_extensions(hello.ext?).ok()?;
    for extension in extensions {
        if let TlsExtension::SNI(names) = extension {
            for (kind, name) in names {
                if kind == SNIType(0) {
                    return Some(String::from_utf8_lossy(name).into_owned());
                }
            }
        }
    }
    None
}

/// Blocked-domain suffix list, matched case-insensitively against the
/// sniffed server name.
pub struct DomainFilter {
    suffixes: Vec<String>,
}

impl DomainFilter {
    pub fn new(suffixes: &[String]) -> Self {
        Self {
            suffixes: suffixes.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.suffixes.iter().any(|suffix| {
            domain == *suffix || domain.ends_with(&format!(".{}", suffix))
        })
    }

    /// Peek a flow's first bytes; returns the blocked domain when the
    /// filter rejects it, `None` to let the flow through.
    pub fn check_first_segment(&self, data: &[u8]) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let sni = extract_sni(data)?;
        self.is_blocked(&sni).then_some(sni)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ClientHello carrying one SNI entry
    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let host = host.as_bytes();

        // SNI extension body
        let mut sni_entry = Vec::new();
        sni_entry.push(0u8); // host_name type
        sni_entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(host);
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_entry);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // extension type: SNI
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        // ClientHello body
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id length
        hello.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1); // compression methods length
        hello.push(0);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        // Handshake header
        let mut handshake = Vec::new();
        handshake.push(1); // client_hello
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        // TLS record
        let mut record = Vec::new();
        record.push(22); // handshake
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let data = client_hello_with_sni("blocked.example.com");
        assert_eq!(extract_sni(&data).as_deref(), Some("blocked.example.com"));
    }

    #[test]
    fn non_tls_yields_nothing() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
        assert_eq!(extract_sni(&[0x16, 0x03]), None);
    }

    #[test]
    fn suffix_matching() {
        let filter = DomainFilter::new(&["ads.example".to_string()]);
        assert!(filter.is_blocked("ads.example"));
        assert!(filter.is_blocked("tracker.ads.example"));
        assert!(filter.is_blocked("TRACKER.ADS.EXAMPLE"));
        assert!(!filter.is_blocked("fads.example"));
        assert!(!filter.is_blocked("example.com"));
    }

    #[test]
    fn first_segment_check() {
        let filter = DomainFilter::new(&["blocked.example.com".to_string()]);
        let hello = client_hello_with_sni("blocked.example.com");
        assert_eq!(
            filter.check_first_segment(&hello).as_deref(),
            Some("blocked.example.com")
        );

        let other = client_hello_with_sni("fine.example.org");
        assert_eq!(filter.check_first_segment(&other), None);
        // Plain HTTP is never filtered here
        assert_eq!(filter.check_first_segment(b"GET / HTTP/1.1\r\n"), None);
    }
}
