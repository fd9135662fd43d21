// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for actora-engine.
//!
//! [`EngineRuntime`] wires the ledger, the worker pool, and the dispatcher
//! together and owns the background tasks, so the engine can run standalone
//! (see main.rs) or embedded in an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use actora_core::SqliteLedger;
//! use actora_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ledger = Arc::new(SqliteLedger::open(".data/actora.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .ledger(ledger)
//!         .runner_executable("/usr/local/bin/actora-runner")
//!         .data_dir(".data")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let run_id = runtime.dispatcher().submit(/* ... */).await?;
//!     runtime.dispatcher().wait(&run_id).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actora_core::Ledger;
use actora_secrets::EnvelopeKey;
use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::autoexit::{AutoexitWatcher, AutoexitWatcherConfig};
use crate::dispatcher::RunDispatcher;
use crate::pool::{PoolConfig, WorkerEnvironment, WorkerPool};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    ledger: Option<Arc<dyn Ledger>>,
    runner_executable: Option<PathBuf>,
    data_dir: PathBuf,
    secret_keys: Vec<EnvelopeKey>,
    min_processes: usize,
    max_processes: usize,
    reuse_processes: bool,
    default_timeout: Duration,
    kill_grace: Duration,
    autoexit_ppid: Option<i32>,
    prewarm_environments: Vec<WorkerEnvironment>,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            ledger: None,
            runner_executable: None,
            data_dir: PathBuf::from(".data"),
            secret_keys: Vec::new(),
            min_processes: 0,
            max_processes: 4,
            reuse_processes: true,
            default_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            autoexit_ppid: None,
            prewarm_environments: Vec::new(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run ledger (required).
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the runner executable workers are spawned from (required).
    pub fn runner_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.runner_executable = Some(path.into());
        self
    }

    /// Set the data directory for per-run input/output files.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the secret envelope keys (first encrypts, all decrypt).
    ///
    /// Default: empty, meaning runs may not carry secrets.
    pub fn secret_keys(mut self, keys: Vec<EnvelopeKey>) -> Self {
        self.secret_keys = keys;
        self
    }

    /// Set the minimum pooled workers pre-warmed per environment.
    ///
    /// Default: 0
    pub fn min_processes(mut self, min: usize) -> Self {
        self.min_processes = min;
        self
    }

    /// Set the per-environment worker cap.
    ///
    /// Default: 4
    pub fn max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    /// Keep finished workers idle for reuse.
    ///
    /// Default: true
    pub fn reuse_processes(mut self, reuse: bool) -> Self {
        self.reuse_processes = reuse;
        self
    }

    /// Set the default per-run wall-clock timeout.
    ///
    /// Default: 5 minutes
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the SIGTERM-to-SIGKILL grace period.
    ///
    /// Default: 5 seconds
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Watch the given parent pid and shut down when it disappears.
    ///
    /// Default: no watcher
    pub fn autoexit_ppid(mut self, ppid: i32) -> Self {
        self.autoexit_ppid = Some(ppid);
        self
    }

    /// Pre-warm `min_processes` workers for this environment at startup.
    /// May be called multiple times for multiple environments.
    pub fn prewarm_environment(mut self, environment: WorkerEnvironment) -> Self {
        self.prewarm_environments.push(environment);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let ledger = self
            .ledger
            .ok_or_else(|| anyhow::anyhow!("ledger is required"))?;
        let runner_executable = self
            .runner_executable
            .ok_or_else(|| anyhow::anyhow!("runner_executable is required"))?;
        if self.max_processes == 0 {
            return Err(anyhow::anyhow!("max_processes must be at least 1"));
        }

        Ok(EngineRuntimeConfig {
            ledger,
            runner_executable,
            data_dir: self.data_dir,
            secret_keys: self.secret_keys,
            min_processes: self.min_processes,
            max_processes: self.max_processes,
            reuse_processes: self.reuse_processes,
            default_timeout: self.default_timeout,
            kill_grace: self.kill_grace,
            autoexit_ppid: self.autoexit_ppid,
            prewarm_environments: self.prewarm_environments,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    ledger: Arc<dyn Ledger>,
    runner_executable: PathBuf,
    data_dir: PathBuf,
    secret_keys: Vec<EnvelopeKey>,
    min_processes: usize,
    max_processes: usize,
    reuse_processes: bool,
    default_timeout: Duration,
    kill_grace: Duration,
    autoexit_ppid: Option<i32>,
    prewarm_environments: Vec<WorkerEnvironment>,
}

impl EngineRuntimeConfig {
    /// Start the runtime: pre-warm the pool and spawn the autoexit watcher.
    pub async fn start(self) -> Result<EngineRuntime> {
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            runner_executable: self.runner_executable,
            min_processes: self.min_processes,
            max_processes: self.max_processes,
            reuse_processes: self.reuse_processes,
            kill_grace: self.kill_grace,
        }));

        for environment in &self.prewarm_environments {
            pool.prewarm(environment).await?;
        }

        let dispatcher = Arc::new(RunDispatcher::new(
            self.ledger,
            pool.clone(),
            self.data_dir.clone(),
            self.secret_keys,
            self.default_timeout,
            self.kill_grace,
        ));

        let parent_gone = Arc::new(Notify::new());
        let (autoexit_handle, autoexit_shutdown) = match self.autoexit_ppid {
            Some(ppid) => {
                let watcher = AutoexitWatcher::new(
                    ppid,
                    parent_gone.clone(),
                    AutoexitWatcherConfig::default(),
                );
                let shutdown = watcher.shutdown_handle();
                let handle = tokio::spawn(async move {
                    watcher.run().await;
                });
                (Some(handle), Some(shutdown))
            }
            None => (None, None),
        };

        info!(
            data_dir = %self.data_dir.display(),
            max_processes = self.max_processes,
            reuse_processes = self.reuse_processes,
            autoexit = autoexit_handle.is_some(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            dispatcher,
            pool,
            parent_gone,
            autoexit_handle,
            autoexit_shutdown,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - The worker pool and its per-environment capacity accounting
/// - The run dispatcher driving submissions to terminal statuses
/// - The autoexit watcher (when a parent pid is configured)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    dispatcher: Arc<RunDispatcher>,
    pool: Arc<WorkerPool>,
    parent_gone: Arc<Notify>,
    autoexit_handle: Option<JoinHandle<()>>,
    autoexit_shutdown: Option<Arc<Notify>>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The run dispatcher.
    pub fn dispatcher(&self) -> &Arc<RunDispatcher> {
        &self.dispatcher
    }

    /// The worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Notified when the watched parent process disappears.
    pub fn parent_gone(&self) -> &Arc<Notify> {
        &self.parent_gone
    }

    /// Gracefully shut down: stop the autoexit watcher and kill-cascade
    /// every pooled worker.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        if let Some(shutdown) = self.autoexit_shutdown {
            shutdown.notify_one();
        }
        if let Some(handle) = self.autoexit_handle {
            if let Err(e) = handle.await {
                error!("Autoexit watcher task panicked: {}", e);
            }
        }

        self.pool.shutdown().await;

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}
