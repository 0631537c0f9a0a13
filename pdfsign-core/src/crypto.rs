// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Cryptographic utilities for the license envelope and signature blocks

use crate::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Salt binding derived counter keys to this product
const COUNTER_KEY_SALT: &[u8] = b"pdfsign-license-counters-v1";

const NONCE_LEN: usize = 24;

/// Symmetric key protecting the persisted rate-limit counters
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct CounterKey([u8; 32]);

impl CounterKey {
    /// Derive the key as HMAC-SHA256(salt, license-bytes || public-key).
    ///
    /// Counters sealed under one license cannot be opened under another.
    pub fn derive(license_bytes: &[u8], public_key: &[u8]) -> Result<Self> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(COUNTER_KEY_SALT)
            .map_err(|e| Error::Crypto(format!("Invalid key length: {}", e)))?;
        mac.update(license_bytes);
        mac.update(public_key);

        let mut key = [0u8; 32];
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self(key))
    }

    /// Encrypt and authenticate `plaintext`; output is `nonce || ciphertext`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        use rand::RngCore;

        let cipher = XChaCha20Poly1305::new((&self.0).into());
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt data produced by [`CounterKey::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Crypto("Sealed data too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("Decryption failed".to_string()))
    }
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hex-encoded SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Stable fingerprint of the host, used to bind license counters to it
pub fn machine_fingerprint() -> String {
    let source = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "unknown-host".to_string());

    sha256_hex(source.as_bytes())
}

/// Encode bytes to base64 string
pub fn encode_base64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode base64 string to bytes
pub fn decode_base64(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| Error::Crypto(format!("Invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = CounterKey::derive(b"license", b"public-key").unwrap();
        let sealed = key.seal(b"counters").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"counters");
        assert_eq!(key.open(&sealed).unwrap(), b"counters");
    }

    #[test]
    fn test_key_bound_to_license() {
        let key = CounterKey::derive(b"license-a", b"public-key").unwrap();
        let other = CounterKey::derive(b"license-b", b"public-key").unwrap();

        let sealed = key.seal(b"counters").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = CounterKey::derive(b"license", b"public-key").unwrap();
        let mut sealed = key.seal(b"counters").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(key.open(&sealed).is_err());
        assert!(key.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(machine_fingerprint(), machine_fingerprint());
        assert_eq!(machine_fingerprint().len(), 64);
    }

    #[test]
    fn test_base64_encoding() {
        let data = b"hello world";
        let b64 = encode_base64(data);
        let decoded = decode_base64(&b64).unwrap();
        assert_eq!(decoded, data);
    }
}
