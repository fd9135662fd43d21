// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for actora-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Ledger operation failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] actora_core::CoreError),

    /// Process spawn/control failed.
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Secret envelope operation failed.
    #[error("Envelope error: {0}")]
    Envelope(#[from] actora_secrets::EnvelopeError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled via a cancellation monitor.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    /// Run was not found by the dispatcher.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Process spawn and control errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The executable could not be started.
    #[error("Failed to spawn {executable}: {source}")]
    Spawn {
        /// The executable that failed to start.
        executable: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A signal could not be delivered to the process group.
    #[error("Failed to signal pid {pid}: {details}")]
    Signal {
        /// Target process id.
        pid: u32,
        /// Human-readable detail.
        details: String,
    },

    /// The process exited before its stdin/stdout channel could be used.
    #[error("Worker process channel closed unexpectedly: {0}")]
    ChannelClosed(String),

    /// I/O on the process handle failed.
    #[error("Process IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised when awaiting a result that was cancelled before completion.
#[derive(Debug, Clone, Error)]
#[error("Operation cancelled")]
pub struct CancelledError;

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;
