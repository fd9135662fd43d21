// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envelope payload schema.
//!
//! The payload is an explicit tagged union rather than a free-form map of
//! maps: a secret is either a plain value or an OAuth2 token, and the
//! serialized form says which. The `version` field allows the schema to
//! evolve without breaking workers decrypting envelopes from an older
//! server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current payload schema version.
pub const PAYLOAD_VERSION: u32 = 1;

/// An OAuth2 token delivered to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Token {
    /// The bearer access token.
    pub access_token: String,
    /// Token type, normally `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Refresh token, when the provider issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// When the access token expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// One secret, keyed by parameter name in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretValue {
    /// A plain secret string (API key, password, connection string).
    Plain {
        /// The secret value.
        value: String,
    },
    /// An OAuth2 token with its metadata.
    Oauth2 {
        /// The token.
        token: OAuth2Token,
    },
}

impl SecretValue {
    /// Build a plain secret.
    pub fn plain(value: impl Into<String>) -> Self {
        Self::Plain {
            value: value.into(),
        }
    }

    /// Build an OAuth2 secret.
    pub fn oauth2(token: OAuth2Token) -> Self {
        Self::Oauth2 { token }
    }
}

/// Structured payload carried by a secret envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPayload {
    /// Schema version of this payload.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Secrets keyed by the action parameter name they satisfy.
    pub secrets: BTreeMap<String, SecretValue>,
}

fn default_version() -> u32 {
    PAYLOAD_VERSION
}

impl SecretPayload {
    /// Create an empty payload at the current schema version.
    pub fn new() -> Self {
        Self {
            version: PAYLOAD_VERSION,
            secrets: BTreeMap::new(),
        }
    }

    /// Insert a secret under the given parameter name.
    pub fn insert(&mut self, name: impl Into<String>, value: SecretValue) {
        self.secrets.insert(name.into(), value);
    }

    /// Look up a secret by parameter name.
    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.secrets.get(name)
    }

    /// Whether the payload carries no secrets.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl Default for SecretPayload {
    fn default() -> Self {
        Self::new()
    }
}
