//! Positioned AEAD for the UDP packet channel
//!
//! Each datagram is sealed at an explicit 64-bit position: the nonce is the
//! position itself, the key is derived from the per-session server secret,
//! and the session id rides as associated data. The receiver needs nothing
//! but the position from the datagram header to decrypt, and a sliding
//! replay window rejects duplicates.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use crate::error::{Error, Result};

use super::derive_key;

/// HKDF info string for the UDP channel key
const UDP_KEY_INFO: &[u8] = b"tunelay udp";

/// Authentication tag overhead per datagram
pub const TAG_SIZE: usize = 16;

/// Ciphers the positioned AEAD can run on. Both sides of a session must
/// agree; ChaCha20-Poly1305 is the wire default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionCipherKind {
    #[default]
    ChaCha20Poly1305,
    Aes256Gcm,
}

enum CipherInner {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes256Gcm(Box<Aes256Gcm>),
}

/// AEAD cipher addressed by position instead of by an implicit counter.
pub struct PositionCipher {
    inner: CipherInner,
    aad: [u8; 8],
}

impl PositionCipher {
    pub fn new(server_secret: &[u8; 16], session_id: u64) -> Result<Self> {
        Self::with_kind(PositionCipherKind::default(), server_secret, session_id)
    }

    pub fn with_kind(
        kind: PositionCipherKind,
        server_secret: &[u8; 16],
        session_id: u64,
    ) -> Result<Self> {
        let key = derive_key(server_secret, UDP_KEY_INFO, 32)?;
        let inner = match kind {
            PositionCipherKind::ChaCha20Poly1305 => CipherInner::ChaCha20Poly1305(
                ChaCha20Poly1305::new_from_slice(&key)
                    .map_err(|e| Error::Crypto(format!("failed to create cipher: {}", e)))?,
            ),
            PositionCipherKind::Aes256Gcm => CipherInner::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| Error::Crypto(format!("failed to create cipher: {}", e)))?,
            )),
        };
        Ok(Self {
            inner,
            aad: session_id.to_be_bytes(),
        })
    }

    fn nonce(position: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&position.to_be_bytes());
        Nonce::from(bytes)
    }

    pub fn seal(&self, position: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad: &self.aad,
        };
        let sealed = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(&Self::nonce(position), payload),
            CipherInner::Aes256Gcm(cipher) => cipher.encrypt(&Self::nonce(position), payload),
        };
        sealed.map_err(|e| Error::Crypto(format!("seal failed: {}", e)))
    }

    pub fn open(&self, position: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: ciphertext,
            aad: &self.aad,
        };
        let opened = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(&Self::nonce(position), payload),
            CipherInner::Aes256Gcm(cipher) => cipher.decrypt(&Self::nonce(position), payload),
        };
        opened.map_err(|_| Error::Crypto("datagram failed authentication".into()))
    }
}

/// Sliding 64-position replay window.
///
/// Accepts each position at most once; positions more than 63 behind the
/// highest seen are rejected as stale.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the position is fresh; marks it seen.
    pub fn accept(&mut self, position: u64) -> bool {
        if position > self.highest {
            let shift = position - self.highest;
            self.bitmap = if shift >= 64 { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.highest = position;
            return true;
        }
        let behind = self.highest - position;
        if behind >= 64 {
            return false;
        }
        let bit = 1u64 << behind;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_key;

    #[test]
    fn seal_open_roundtrip() {
        let secret = random_key();
        for kind in [PositionCipherKind::ChaCha20Poly1305, PositionCipherKind::Aes256Gcm] {
            let cipher = PositionCipher::with_kind(kind, &secret, 42).unwrap();
            let sealed = cipher.seal(7, b"an ip packet").unwrap();
            assert_eq!(sealed.len(), b"an ip packet".len() + TAG_SIZE);
            assert_eq!(cipher.open(7, &sealed).unwrap(), b"an ip packet");
        }
    }

    #[test]
    fn ciphers_do_not_interoperate() {
        let secret = random_key();
        let chacha =
            PositionCipher::with_kind(PositionCipherKind::ChaCha20Poly1305, &secret, 1).unwrap();
        let gcm = PositionCipher::with_kind(PositionCipherKind::Aes256Gcm, &secret, 1).unwrap();
        let sealed = chacha.seal(0, b"payload").unwrap();
        assert!(gcm.open(0, &sealed).is_err());
    }

    #[test]
    fn wrong_position_fails() {
        let secret = random_key();
        let cipher = PositionCipher::new(&secret, 42).unwrap();
        let sealed = cipher.seal(7, b"payload").unwrap();
        assert!(cipher.open(8, &sealed).is_err());
    }

    #[test]
    fn session_id_is_bound() {
        let secret = random_key();
        let a = PositionCipher::new(&secret, 1).unwrap();
        let b = PositionCipher::new(&secret, 2).unwrap();
        let sealed = a.seal(0, b"payload").unwrap();
        assert!(b.open(0, &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let secret = random_key();
        let cipher = PositionCipher::new(&secret, 42).unwrap();
        let mut sealed = cipher.seal(3, b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert!(cipher.open(3, &sealed).is_err());
    }

    #[test]
    fn replay_window_rejects_duplicates() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(0));
        assert!(!window.accept(0));
        assert!(window.accept(1));
        assert!(window.accept(5));
        assert!(window.accept(3));
        assert!(!window.accept(3));
        assert!(!window.accept(5));
    }

    #[test]
    fn replay_window_rejects_stale() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(100));
        assert!(window.accept(37)); // within 64
        assert!(!window.accept(36)); // exactly 64 behind
        assert!(!window.accept(1));
    }

    #[test]
    fn replay_window_large_jump() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(1));
        assert!(window.accept(1000));
        assert!(!window.accept(1));
        assert!(window.accept(999));
    }
}
