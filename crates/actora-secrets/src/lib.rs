// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actora Secrets - Authenticated Secret Envelopes
//!
//! Runs frequently need credentials: API keys, passwords, OAuth2 access
//! tokens. The server must move them into the worker process without ever
//! writing them to the run ledger, the capture files, or the logs. This
//! crate provides the envelope used for that hop:
//!
//! - AES-256-GCM authenticated encryption with a fresh random nonce per
//!   envelope; tampering or a wrong key fails decryption at the tag check
//! - a versioned, explicitly tagged payload schema (plain secret vs.
//!   OAuth2 token), keyed by parameter name
//! - keys supplied out-of-band: the 32-byte key never travels inside the
//!   envelope. The server reads a rotation-friendly key list from
//!   configuration; the worker reads a single key from its environment.
//!
//! Wire form: `v1.<base64 nonce>.<base64 ciphertext>`, compact enough for
//! a header-like side channel and unreadable without the key.
//!
//! # Example
//!
//! ```ignore
//! let key = EnvelopeKey::generate();
//! let mut payload = SecretPayload::new();
//! payload.insert("api_key", SecretValue::plain("sk-123"));
//!
//! let envelope = encrypt(&key, &payload)?;
//! let wire = envelope.to_wire();
//!
//! // ... inside the worker ...
//! let envelope = Envelope::from_wire(&wire)?;
//! let payload = decrypt(&key, &envelope)?;
//! ```

#![deny(missing_docs)]

mod envelope;
mod payload;

pub use envelope::{
    Envelope, EnvelopeError, EnvelopeKey, decrypt, decrypt_first, encrypt, keys_from_env,
};
pub use payload::{OAuth2Token, SecretPayload, SecretValue};
