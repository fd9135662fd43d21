// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for actora-core.
//!
//! Provides a unified error type for ledger and migration operations.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while operating on the run ledger.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found in the ledger.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Run is in an invalid state for the requested transition.
    InvalidTransition {
        /// The run ID.
        run_id: String,
        /// The status the transition requires.
        expected: String,
        /// The status the row actually has.
        actual: String,
    },

    /// The store records a migration id this binary does not know.
    ///
    /// An older binary must never silently operate on a newer store.
    UnsupportedNewerSchema {
        /// Highest migration id recorded in the store.
        store_max: i64,
        /// Highest migration id this binary understands.
        binary_max: i64,
    },

    /// The applied migration set is not a prefix of the known sequence.
    MigrationLedgerCorrupt {
        /// Description of the inconsistency.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::UnsupportedNewerSchema { .. } => "UNSUPPORTED_NEWER_SCHEMA",
            Self::MigrationLedgerCorrupt { .. } => "MIGRATION_LEDGER_CORRUPT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether startup must abort on this error rather than degrade.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedNewerSchema { .. } | Self::MigrationLedgerCorrupt { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => {
                write!(f, "Run '{}' not found", run_id)
            }
            Self::InvalidTransition {
                run_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Run '{}' is in invalid state for transition: expected '{}', got '{}'",
                    run_id, expected, actual
                )
            }
            Self::UnsupportedNewerSchema {
                store_max,
                binary_max,
            } => {
                write!(
                    f,
                    "Store schema is newer than this binary: store has migration {}, binary knows up to {}",
                    store_max, binary_max
                )
            }
            Self::MigrationLedgerCorrupt { details } => {
                write!(f, "Migration ledger is corrupt: {}", details)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
