// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actora Engine - Action Execution
//!
//! This crate executes actions in isolated worker processes: it manages a
//! pool of reusable workers, drives each submitted run to a terminal ledger
//! status, and propagates cancellation and timeouts down to real OS process
//! trees.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Embedding Application                           │
//! │                   (server, CLI, test harness)                        │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │ submit / cancel / wait
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     actora-engine (This Crate)                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │     Run      │  │    Worker    │  │   Autoexit   │               │
//! │  │  Dispatcher  │  │     Pool     │  │   Watcher    │               │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────┘               │
//! │         │                 │ borrow / release / retire                │
//! │         │                 ▼                                          │
//! │         │        ┌─────────────────┐     spawn / signal              │
//! │         │        │ Launch Future + │────────────────────┐            │
//! │         │        │ Process Handle  │                    │            │
//! │         │        └─────────────────┘                    ▼            │
//! │         │                               ┌──────────────────────────┐ │
//! │         │ mark_running / mark_terminal  │     Worker Processes     │ │
//! │         ▼                               │  (runner --serve, pooled │ │
//! │  ┌──────────────┐                       │   per environment key)   │ │
//! │  │  actora-core │                       └──────────────────────────┘ │
//! │  │  Run Ledger  │                                                    │
//! │  └──────┬───────┘                                                    │
//! └─────────┼───────────────────────────────────────────────────────────┘
//!           ▼
//!      ┌─────────┐
//!      │ SQLite  │
//!      └─────────┘
//! ```
//!
//! # Worker protocol
//!
//! A pooled worker is the runner executable started with `--serve`. The
//! engine writes one JSON request per line to the worker's stdin:
//!
//! ```json
//! {"run_id":"...","entrypoint":"...","json_input":"...","json_output":"...",
//!  "stdout_path":"...","stderr_path":"...","context":"v1...."}
//! ```
//!
//! The worker executes the action, writes `{"result", "error", "status"}`
//! (status `"PASS"` or `"FAIL"`) to `json_output`, duplicates the action's
//! stdout/stderr into the given capture files, and acknowledges with one
//! line `{"run_id", "ok"}` on its own stdout. When process reuse is
//! disabled the engine instead launches
//! `<runner> <entrypoint> --json-input=<path> --json-output=<path>`
//! once per run.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ACTORA_RUNNER` | Yes | - | Runner executable for worker processes |
//! | `ACTORA_STORE_PATH` | No | `.data/actora.db` | SQLite run ledger path |
//! | `ACTORA_DATA_DIR` | No | `.data` | Per-run input/output directory |
//! | `ACTORA_MIN_PROCESSES` | No | `0` | Pre-warmed workers per environment |
//! | `ACTORA_MAX_PROCESSES` | No | `4` | Worker cap per environment |
//! | `ACTORA_REUSE_PROCESSES` | No | `true` | Keep finished workers idle |
//! | `ACTORA_DEFAULT_TIMEOUT_SECS` | No | `300` | Default per-run timeout |
//! | `ACTORA_KILL_GRACE_SECS` | No | `5` | SIGTERM-to-SIGKILL grace |
//! | `ACTORA_SECRET_KEYS` | No | - | Envelope keys (comma-separated base64) |
//! | `ACTORA_AUTOEXIT_PPID` | No | - | Parent pid to watch |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types for engine operations
//! - [`process`]: Process-group spawn, kill cascade, output capture
//! - [`monitor`]: Cooperative cancellation monitor
//! - [`launch`]: One process run with cancellation and timeout
//! - [`pool`]: Worker pool keyed by environment fingerprint
//! - [`dispatcher`]: Run submission, cancellation, and outcome recording
//! - [`autoexit`]: Parent-process liveness watcher
//! - [`runtime`]: Embeddable runtime wiring it all together

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Worker process wrapper: process-group spawn and kill cascade.
pub mod process;

/// Cooperative cancellation monitor.
pub mod monitor;

/// Launch future: one process run with cancellation and timeout.
pub mod launch;

/// Worker pool keyed by environment fingerprint.
pub mod pool;

/// Run dispatcher: submissions, cancellation, outcome recording.
pub mod dispatcher;

/// Background worker that exits the engine when its parent dies.
pub mod autoexit;

/// Embeddable runtime for actora-engine.
pub mod runtime;

pub use config::Config;
pub use dispatcher::{RunDispatcher, SubmitRequest};
pub use error::{CancelledError, Error, ProcessError};
pub use launch::{Launch, LaunchStatus, launch};
pub use monitor::CancellationMonitor;
pub use pool::{InvokeAck, InvokeRequest, PoolConfig, Worker, WorkerEnvironment, WorkerPool};
pub use runtime::EngineRuntime;
