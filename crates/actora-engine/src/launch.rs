// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launch future: one process run with cancellation and timeout.
//!
//! [`launch`] spawns a process and hands back a [`Launch`] whose
//! [`wait`](Launch::wait) resolves once the run reaches exactly one outcome.
//! A single watcher task owns the race between the cancellation monitor, the
//! wall-clock timeout, an external [`cancel`](Launch::cancel), and natural
//! exit; losing branches never overwrite the winner. Cancellation and timeout
//! stop the whole process tree before the outcome is published.

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{CancelledError, ProcessError};
use crate::monitor::CancellationMonitor;
use crate::process::{ProcessHandle, ProcessSpec};

/// How a launch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    /// The process exited on its own.
    Completed,
    /// The cancellation monitor fired.
    Cancelled,
    /// The wall-clock timeout elapsed.
    TimedOut,
}

/// Return code and final status of a launch.
pub type LaunchOutcome = Result<(Option<i32>, LaunchStatus), CancelledError>;

/// Handle to a launched process run.
pub struct Launch {
    pid: u32,
    outcome_rx: watch::Receiver<Option<LaunchOutcome>>,
    external: CancellationMonitor,
}

impl Launch {
    /// Pid of the launched process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Abandon the launch: the process tree is stopped and every waiter
    /// observes [`CancelledError`] instead of a status.
    pub fn cancel(&self) {
        self.external.cancel();
    }

    /// Await the single outcome of the launch.
    pub async fn wait(&mut self) -> LaunchOutcome {
        loop {
            let current = self.outcome_rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.outcome_rx.changed().await.is_err() {
                // Watcher vanished without publishing; treat as abandoned.
                return Err(CancelledError);
            }
        }
    }
}

/// Spawn `spec` and watch it to a single outcome.
///
/// Outcome priority when several conditions race: monitor cancellation,
/// then timeout, then external cancel, then natural exit. `None` timeout
/// means the launch runs until it exits or is cancelled.
pub fn launch(
    spec: &ProcessSpec,
    monitor: CancellationMonitor,
    timeout: Option<Duration>,
    kill_grace: Duration,
) -> Result<Launch, ProcessError> {
    let mut handle = ProcessHandle::spawn(spec)?;
    let pid = handle.pid();

    let (outcome_tx, outcome_rx) = watch::channel(None);
    let external = CancellationMonitor::new();
    let external_watch = external.clone();

    tokio::spawn(async move {
        let timeout_fut = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout_fut);

        let outcome: LaunchOutcome = tokio::select! {
            biased;

            _ = monitor.cancelled() => {
                debug!(pid = pid, "Launch cancelled by monitor");
                let _ = handle.stop(kill_grace).await;
                Ok((None, LaunchStatus::Cancelled))
            }

            _ = &mut timeout_fut => {
                debug!(pid = pid, "Launch timed out");
                let _ = handle.stop(kill_grace).await;
                Ok((None, LaunchStatus::TimedOut))
            }

            _ = external_watch.cancelled() => {
                debug!(pid = pid, "Launch abandoned");
                let _ = handle.stop(kill_grace).await;
                Err(CancelledError)
            }

            code = handle.wait() => {
                let code = code.ok().flatten();
                debug!(pid = pid, code = ?code, "Launch completed");
                Ok((code, LaunchStatus::Completed))
            }
        };

        let _ = outcome_tx.send(Some(outcome));
        // Keep the sender alive until here so late waiters see the value.
    });

    Ok(Launch {
        pid,
        outcome_rx,
        external,
    })
}
