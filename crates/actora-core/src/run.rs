// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run records and the run status state machine.
//!
//! A run is one execution attempt of an action. Its status moves along a
//! monotone state machine and, once terminal, is never written again:
//!
//! ```text
//!                  ┌─────────┐
//!                  │ NOT_RUN │
//!                  └────┬────┘
//!                       │ mark_running
//!                       ▼
//!                  ┌─────────┐
//!                  │ RUNNING │
//!                  └────┬────┘
//!         ┌──────────┬──┴───────┬────────────┐
//!         ▼          ▼          ▼            ▼
//!     ┌──────┐   ┌──────┐  ┌───────────┐ ┌───────────┐
//!     │ PASS │   │ FAIL │  │ CANCELLED │ │ TIMED_OUT │
//!     └──────┘   └──────┘  └───────────┘ └───────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted by the pool, no worker bound yet.
    NotRun,
    /// A worker is executing the action.
    Running,
    /// The action completed and reported success.
    Pass,
    /// The action completed and reported an error, or the harness failed.
    Fail,
    /// The platform stopped the run on request.
    Cancelled,
    /// The platform stopped the run because its deadline elapsed.
    TimedOut,
}

impl RunStatus {
    /// Stable string form stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRun => "not_run",
            Self::Running => "running",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Parse the stored string form back into a status.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "not_run" => Ok(Self::NotRun),
            "running" => Ok(Self::Running),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown run status '{}'", other),
            }),
        }
    }

    /// Whether this status ends the run. Terminal rows are never written again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Pass | Self::Fail | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::NotRun, Self::Running) => true,
            (Self::Running, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run record from the ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Unique identifier for the run (UUID v4, generated at creation).
    pub id: String,
    /// Action definition this run executes.
    pub action_id: String,
    /// Current status, stored in its string form.
    pub status: String,
    /// When the run was accepted.
    pub start_time: DateTime<Utc>,
    /// When the run reached a terminal status. Set iff the status is terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Idempotency/correlation key supplied by the caller (non-unique).
    pub request_id: String,
    /// Opaque JSON result produced by the action.
    pub result: Option<String>,
    /// Error message for failed runs.
    pub error_message: Option<String>,
    /// Path to the captured stdout.
    pub stdout_ref: Option<String>,
    /// Path to the captured stderr.
    pub stderr_ref: Option<String>,
    /// Number of times this run has been attempted.
    pub numtries: i64,
}

impl RunRecord {
    /// Typed status of this record.
    pub fn run_status(&self) -> Result<RunStatus, CoreError> {
        RunStatus::parse(&self.status)
    }
}

/// Everything recorded when a run reaches a terminal status.
#[derive(Debug, Clone, Default)]
pub struct TerminalOutcome {
    /// Opaque JSON result (pass only).
    pub result: Option<String>,
    /// Error message (fail/cancelled/timed_out).
    pub error_message: Option<String>,
    /// Path to the captured stdout.
    pub stdout_ref: Option<String>,
    /// Path to the captured stderr.
    pub stderr_ref: Option<String>,
}
