// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AES-256-GCM envelope construction and consumption.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::payload::SecretPayload;

/// Envelope wire-format version prefix.
const WIRE_VERSION: &str = "v1";

/// Length of an AES-256 key in bytes.
const KEY_LEN: usize = 32;

/// Errors from envelope operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// Key material could not be parsed.
    #[error("Invalid envelope key: {0}")]
    InvalidKey(String),

    /// Decryption failed: wrong key or tampered ciphertext.
    ///
    /// AES-GCM gives no more detail than the tag mismatch, deliberately.
    #[error("Envelope decryption failed (wrong key or tampered ciphertext)")]
    Decryption,

    /// The wire string carries a version this binary does not understand.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(String),

    /// The wire string is not a well-formed envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Payload serialization failed.
    #[error("Payload JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for envelope operations.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// A 32-byte AES-256-GCM key.
///
/// Parsed from base64, zeroized on drop, and never printed: the Debug impl
/// is redacted so the key cannot leak through logging.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey([u8; KEY_LEN]);

impl EnvelopeKey {
    /// Parse a key from its base64 form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| EnvelopeError::InvalidKey(format!("not valid base64: {}", e)))?;
        if bytes.len() != KEY_LEN {
            return Err(EnvelopeError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Base64 form, for handing the key to a worker environment variable.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvelopeKey(..)")
    }
}

/// Load the decrypt-key list from an environment variable.
///
/// The variable holds comma-separated base64 keys. The first entry is the
/// active encryption key; every entry is tried for decryption, which lets
/// envelopes from a previous key survive a rotation.
pub fn keys_from_env(var: &str) -> Result<Vec<EnvelopeKey>> {
    let raw = std::env::var(var)
        .map_err(|_| EnvelopeError::InvalidKey(format!("environment variable {} not set", var)))?;

    let keys: Vec<EnvelopeKey> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(EnvelopeKey::from_base64)
        .collect::<Result<_>>()?;

    if keys.is_empty() {
        return Err(EnvelopeError::InvalidKey(format!(
            "environment variable {} holds no keys",
            var
        )));
    }
    Ok(keys)
}

/// An authenticated-encryption envelope: ciphertext plus its nonce.
///
/// The key is never part of the envelope; it travels out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// 96-bit GCM nonce, unique per envelope.
    pub nonce: [u8; 12],
    /// AES-256-GCM ciphertext including the authentication tag.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialize to the wire form `v1.<b64 nonce>.<b64 ciphertext>`.
    pub fn to_wire(&self) -> String {
        format!(
            "{}.{}.{}",
            WIRE_VERSION,
            BASE64.encode(self.nonce),
            BASE64.encode(&self.ciphertext)
        )
    }

    /// Parse the wire form.
    pub fn from_wire(wire: &str) -> Result<Self> {
        let mut parts = wire.splitn(3, '.');
        let version = parts
            .next()
            .ok_or_else(|| EnvelopeError::Malformed("empty envelope".to_string()))?;
        if version != WIRE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version.to_string()));
        }

        let nonce_b64 = parts
            .next()
            .ok_or_else(|| EnvelopeError::Malformed("missing nonce".to_string()))?;
        let ct_b64 = parts
            .next()
            .ok_or_else(|| EnvelopeError::Malformed("missing ciphertext".to_string()))?;

        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| EnvelopeError::Malformed(format!("nonce is not base64: {}", e)))?;
        let nonce: [u8; 12] = nonce_bytes
            .try_into()
            .map_err(|_| EnvelopeError::Malformed("nonce must be 12 bytes".to_string()))?;

        let ciphertext = BASE64
            .decode(ct_b64)
            .map_err(|e| EnvelopeError::Malformed(format!("ciphertext is not base64: {}", e)))?;

        Ok(Self { nonce, ciphertext })
    }
}

/// Encrypt a payload into an envelope with a fresh random nonce.
pub fn encrypt(key: &EnvelopeKey, payload: &SecretPayload) -> Result<Envelope> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| EnvelopeError::Decryption)?;

    Ok(Envelope {
        nonce: nonce.into(),
        ciphertext,
    })
}

/// Decrypt an envelope with a single key.
///
/// Fails with [`EnvelopeError::Decryption`] on authentication-tag mismatch,
/// covering both a wrong key and a tampered ciphertext.
pub fn decrypt(key: &EnvelopeKey, envelope: &Envelope) -> Result<SecretPayload> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Nonce::from_slice(&envelope.nonce);

    let plaintext = Zeroizing::new(
        cipher
            .decrypt(nonce, envelope.ciphertext.as_slice())
            .map_err(|_| EnvelopeError::Decryption)?,
    );

    Ok(serde_json::from_slice(&plaintext)?)
}

/// Decrypt with the first key in the list that authenticates the envelope.
pub fn decrypt_first(keys: &[EnvelopeKey], envelope: &Envelope) -> Result<SecretPayload> {
    for key in keys {
        match decrypt(key, envelope) {
            Ok(payload) => return Ok(payload),
            Err(EnvelopeError::Decryption) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(EnvelopeError::Decryption)
}
