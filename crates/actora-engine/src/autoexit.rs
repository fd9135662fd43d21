// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that exits the engine when its parent process dies.
//!
//! The engine is usually started by a supervisor (an IDE, a test harness, a
//! wrapper CLI) that passes its own pid via `ACTORA_AUTOEXIT_PPID`. When the
//! supervisor disappears without shutting the engine down, this watcher
//! notices and triggers shutdown so orphaned engines never accumulate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Configuration for the autoexit watcher.
#[derive(Debug, Clone)]
pub struct AutoexitWatcherConfig {
    /// How often to poll the parent pid.
    pub poll_interval: Duration,
}

impl Default for AutoexitWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Background worker polling a parent pid for liveness.
pub struct AutoexitWatcher {
    ppid: i32,
    config: AutoexitWatcherConfig,
    /// Notified when the parent disappears; the runtime listens on this.
    parent_gone: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl AutoexitWatcher {
    /// Create a watcher for the given parent pid.
    pub fn new(ppid: i32, parent_gone: Arc<Notify>, config: AutoexitWatcherConfig) -> Self {
        Self {
            ppid,
            config,
            parent_gone,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the watcher loop until shutdown or until the parent disappears.
    pub async fn run(&self) {
        info!(
            ppid = self.ppid,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Autoexit watcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Autoexit watcher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if !is_process_alive(self.ppid) {
                        warn!(ppid = self.ppid, "Parent process gone, triggering shutdown");
                        self.parent_gone.notify_waiters();
                        break;
                    }
                    debug!(ppid = self.ppid, "Parent process alive");
                }
            }
        }

        info!("Autoexit watcher stopped");
    }
}

/// Check liveness with a null signal; ESRCH means the pid is gone.
#[cfg(unix)]
fn is_process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    !matches!(kill(Pid::from_raw(pid), None), Err(nix::errno::Errno::ESRCH))
}

#[cfg(not(unix))]
fn is_process_alive(_pid: i32) -> bool {
    // No cheap liveness probe here; the watcher stays passive.
    true
}
