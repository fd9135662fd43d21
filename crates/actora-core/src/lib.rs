// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actora Core - Run Ledger and Schema Migrations
//!
//! This crate provides the durable heart of the action server: a SQLite
//! ledger recording every run an engine ever accepted, the state machine
//! those records move through, and the embedded migration engine that keeps
//! the store's schema in step with the binary.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        actora-engine                            │
//! │          (Worker Pool, Launch Futures, Run Dispatch)            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    actora-core (This Crate)                     │
//! │   ┌──────────────┐   ┌───────────────┐   ┌──────────────────┐   │
//! │   │  Run Ledger  │   │ State Machine │   │ Migration Engine │   │
//! │   └──────────────┘   └───────────────┘   └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//!                     ┌─────────────────────┐
//!                     │   SQLite store file │
//!                     └─────────────────────┘
//! ```
//!
//! # Run Status State Machine
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
//!
//! | Status | Description |
//! |--------|-------------|
//! | `not_run` | Accepted by the pool, no worker bound yet |
//! | `running` | A worker is executing the action |
//! | `pass` | The action completed and reported success |
//! | `fail` | The action reported an error, or the harness failed |
//! | `cancelled` | The platform stopped the run on request |
//! | `timed_out` | The platform stopped the run at its deadline |
//!
//! Transitions are monotone and enforced twice: in Rust through
//! [`run::RunStatus::can_transition_to`], and in the store through guarded
//! UPDATEs whose WHERE clauses name the required current status. A terminal
//! row is never written again.
//!
//! # Schema Versioning
//!
//! The store carries a `migrations (id INTEGER PRIMARY KEY, name TEXT)`
//! table. [`migrations::migrate`] applies the embedded migration sequence in
//! ascending id order, each inside a single transaction that also records
//! its marker row. A store recording an id this binary does not know is
//! refused with [`error::CoreError::UnsupportedNewerSchema`]: an older
//! binary must never silently operate on a newer store.
//!
//! # Modules
//!
//! - [`error`]: Error types with stable error-code mapping
//! - [`ledger`]: The [`ledger::Ledger`] trait and its SQLite implementation
//! - [`migrations`]: Embedded schema migrations and version-conflict detection
//! - [`run`]: Run records, status enum, and terminal outcomes

#![deny(missing_docs)]

/// Error types for ledger and migration operations.
pub mod error;

/// The run ledger trait and SQLite-backed implementation.
pub mod ledger;

/// Embedded schema migrations applied programmatically at startup.
pub mod migrations;

/// Run records and the run status state machine.
pub mod run;

pub use error::CoreError;
pub use ledger::{Ledger, SqliteLedger};
pub use migrations::MigrationStatus;
pub use run::{RunRecord, RunStatus, TerminalOutcome};
