// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actora Engine - Action Execution Server
//!
//! Standalone entrypoint: opens the run ledger, starts the worker pool and
//! dispatcher, and runs until a shutdown signal arrives or the watched
//! parent process disappears.

use std::sync::Arc;

use tracing::{info, warn};

use actora_core::SqliteLedger;
use actora_engine::config::Config;
use actora_engine::runtime::EngineRuntime;
use actora_secrets::keys_from_env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "actora_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        store_path = %config.store_path.display(),
        data_dir = %config.data_dir.display(),
        runner = %config.runner_executable.display(),
        "Starting Actora Engine"
    );

    // Open the ledger; refuses stores written by a newer binary.
    let ledger = Arc::new(SqliteLedger::open(&config.store_path).await?);

    info!("Run ledger ready");

    // Secret envelope keys are optional; without them runs may not carry
    // secrets.
    let secret_keys = if std::env::var_os("ACTORA_SECRET_KEYS").is_some() {
        let keys = keys_from_env("ACTORA_SECRET_KEYS")?;
        info!(count = keys.len(), "Secret envelope keys loaded");
        keys
    } else {
        warn!("ACTORA_SECRET_KEYS not set; runs may not carry secrets");
        Vec::new()
    };

    // Start the runtime
    let mut builder = EngineRuntime::builder()
        .ledger(ledger)
        .runner_executable(&config.runner_executable)
        .data_dir(&config.data_dir)
        .secret_keys(secret_keys)
        .min_processes(config.min_processes)
        .max_processes(config.max_processes)
        .reuse_processes(config.reuse_processes)
        .default_timeout(config.default_timeout)
        .kill_grace(config.kill_grace);

    if let Some(ppid) = config.autoexit_ppid {
        builder = builder.autoexit_ppid(ppid);
    }

    let runtime = builder.build()?.start().await?;

    info!("Engine ready");

    // Wait for a shutdown signal or the watched parent disappearing
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        _ = runtime.parent_gone().notified() => {
            info!("Parent process gone, shutting down");
        }
    }

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Actora Engine shut down");

    Ok(())
}
