//! Cryptography helpers
//!
//! - HKDF-SHA256 key derivation for channel keys
//! - the single AES-ECB block that proves token possession in the hello
//! - the positioned AEAD used by the UDP packet channel

mod position;

pub use position::{PositionCipher, PositionCipherKind, ReplayWindow};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{Error, Result};

/// Generate cryptographically secure random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random 128-bit key (session keys, server secrets)
pub fn random_key() -> [u8; 16] {
    use rand::RngCore;
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(secret: &[u8], info: &[u8], key_len: usize) -> Result<Vec<u8>> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut okm = vec![0u8; key_len];
    hk.expand(info, &mut okm)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Encrypt a 16-byte client id with the token secret (single AES-128-ECB
/// block). The server recomputes this to verify token possession without
/// the secret ever crossing the wire.
pub fn encrypt_client_id(secret: &[u8; 16], client_id: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(secret));
    let mut block = GenericArray::clone_from_slice(client_id);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Inverse of [`encrypt_client_id`], used by diagnostics and tests.
pub fn decrypt_client_id(secret: &[u8; 16], encrypted: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(secret));
    let mut block = GenericArray::clone_from_slice(encrypted);
    cipher.decrypt_block(&mut block);
    block.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_differ() {
        let a = random_bytes(32);
        let b = random_bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key(b"secret", b"tunelay udp", 32).unwrap();
        let b = derive_key(b"secret", b"tunelay udp", 32).unwrap();
        let c = derive_key(b"secret", b"other", 32).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn client_id_block_roundtrip() {
        let secret = random_key();
        let client_id = *uuid::Uuid::new_v4().as_bytes();

        let encrypted = encrypt_client_id(&secret, &client_id);
        assert_ne!(encrypted, client_id);
        assert_eq!(decrypt_client_id(&secret, &encrypted), client_id);

        // A different secret yields a different proof
        let other = random_key();
        assert_ne!(encrypt_client_id(&other, &client_id), encrypted);
    }
}
