// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run dispatcher: accepts submissions and drives each run to a terminal
//! ledger status.
//!
//! `submit` is synchronous acceptance: the ledger row and run directory are
//! created before the run id is returned, then a spawned task drives the run
//! (acquire worker, invoke, collect outcome, mark terminal). Worker crashes
//! and harness failures are translated to terminal statuses here; they never
//! unwind into request handling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actora_core::{Ledger, RunStatus, TerminalOutcome};
use actora_secrets::{Envelope, EnvelopeError, EnvelopeKey, decrypt_first, encrypt};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::launch::{LaunchStatus, launch};
use crate::monitor::CancellationMonitor;
use crate::pool::{InvokeRequest, WorkerEnvironment, WorkerPool};
use crate::process::{OutputMode, ProcessSpec};

/// A request to run an action.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Action to run.
    pub action_id: String,
    /// Entrypoint the runner resolves inside the worker.
    pub entrypoint: String,
    /// Caller-supplied correlation key.
    pub request_id: String,
    /// Action arguments, written to the run's input.json.
    pub arguments: serde_json::Value,
    /// Worker environment, fingerprinted for pool keying.
    pub environment: WorkerEnvironment,
    /// Wall-clock timeout; the engine default applies when `None`.
    pub timeout: Option<Duration>,
    /// Inbound secret envelope wire string, when the run carries secrets.
    pub context: Option<String>,
}

/// Result object a worker writes to the run's json_output file.
#[derive(Debug, Deserialize)]
struct WorkerResult {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    status: String,
}

struct RunControl {
    monitor: CancellationMonitor,
    done_rx: watch::Receiver<Option<RunStatus>>,
}

struct RunPaths {
    dir: PathBuf,
    input: PathBuf,
    output: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
}

/// Dispatches runs onto pooled workers and records their outcomes.
pub struct RunDispatcher {
    ledger: Arc<dyn Ledger>,
    pool: Arc<WorkerPool>,
    data_dir: PathBuf,
    keys: Vec<EnvelopeKey>,
    default_timeout: Duration,
    kill_grace: Duration,
    runs: Mutex<HashMap<String, RunControl>>,
}

impl RunDispatcher {
    /// Create a dispatcher.
    ///
    /// `keys` is the decrypt-key list: the first entry encrypts the fresh
    /// per-run envelope, every entry is tried against inbound envelopes.
    /// An empty list means runs may not carry secrets.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        pool: Arc<WorkerPool>,
        data_dir: impl Into<PathBuf>,
        keys: Vec<EnvelopeKey>,
        default_timeout: Duration,
        kill_grace: Duration,
    ) -> Self {
        Self {
            ledger,
            pool,
            data_dir: data_dir.into(),
            keys,
            default_timeout,
            kill_grace,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a run: ledger row and run directory exist once this returns.
    ///
    /// The run itself is driven on a background task; use
    /// [`wait`](Self::wait) to observe the terminal status.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<String> {
        if request.entrypoint.is_empty() {
            return Err(Error::InvalidRequest("entrypoint must not be empty".to_string()));
        }

        let run_id = self
            .ledger
            .create(&request.action_id, &request.request_id)
            .await?;

        let paths = self.run_paths(&run_id);
        tokio::fs::create_dir_all(&paths.dir).await?;
        tokio::fs::write(&paths.input, serde_json::to_vec(&request.arguments)?).await?;

        let monitor = CancellationMonitor::new();
        let (done_tx, done_rx) = watch::channel(None);
        {
            let mut runs = self.runs.lock().unwrap();
            runs.insert(
                run_id.clone(),
                RunControl {
                    monitor: monitor.clone(),
                    done_rx,
                },
            );
        }

        info!(run_id = %run_id, action_id = %request.action_id, "Run accepted");

        let dispatcher = self.clone();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            dispatcher
                .drive(task_run_id, request, paths, monitor, done_tx)
                .await;
        });

        Ok(run_id)
    }

    /// Request cancellation of a run. A no-op for unknown or finished runs.
    pub fn cancel(&self, run_id: &str) {
        let monitor = {
            let runs = self.runs.lock().unwrap();
            runs.get(run_id).map(|control| control.monitor.clone())
        };
        if let Some(monitor) = monitor {
            info!(run_id = %run_id, "Cancellation requested");
            monitor.cancel();
        } else {
            debug!(run_id = %run_id, "Cancel for unknown or finished run");
        }
    }

    /// Await a run's terminal status.
    ///
    /// For runs that already finished this reads the ledger, so the answer
    /// matches what was durably recorded.
    pub async fn wait(&self, run_id: &str) -> Result<RunStatus> {
        let done_rx = {
            let runs = self.runs.lock().unwrap();
            runs.get(run_id).map(|control| control.done_rx.clone())
        };

        if let Some(mut done_rx) = done_rx {
            loop {
                let current = *done_rx.borrow();
                if let Some(status) = current {
                    return Ok(status);
                }
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        }

        let record = self
            .ledger
            .get(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        let status = record.run_status()?;
        if status.is_terminal() {
            Ok(status)
        } else {
            Err(Error::Other(format!(
                "run {} is not terminal (status {})",
                run_id, status
            )))
        }
    }

    fn run_paths(&self, run_id: &str) -> RunPaths {
        let dir = self.data_dir.join("runs").join(run_id);
        RunPaths {
            input: dir.join("input.json"),
            output: dir.join("output.json"),
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
            dir,
        }
    }

    async fn drive(
        self: Arc<Self>,
        run_id: String,
        request: SubmitRequest,
        paths: RunPaths,
        monitor: CancellationMonitor,
        done_tx: watch::Sender<Option<RunStatus>>,
    ) {
        let status = match self
            .drive_inner(&run_id, &request, &paths, &monitor)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run failed in the harness");
                // The failure may have struck before the running transition.
                let _ = self.ledger.mark_running(&run_id).await;
                let outcome = TerminalOutcome {
                    result: None,
                    error_message: Some(e.to_string()),
                    stdout_ref: Some(paths.stdout.display().to_string()),
                    stderr_ref: Some(paths.stderr.display().to_string()),
                };
                if let Err(mark_err) = self
                    .ledger
                    .mark_terminal(&run_id, RunStatus::Fail, outcome)
                    .await
                {
                    error!(run_id = %run_id, error = %mark_err, "Failed to record run failure");
                }
                RunStatus::Fail
            }
        };

        info!(run_id = %run_id, status = %status, "Run finished");
        let _ = done_tx.send(Some(status));
        self.runs.lock().unwrap().remove(&run_id);
    }

    async fn drive_inner(
        &self,
        run_id: &str,
        request: &SubmitRequest,
        paths: &RunPaths,
        monitor: &CancellationMonitor,
    ) -> Result<RunStatus> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let started = tokio::time::Instant::now();

        // Validate the inbound envelope once, then mint a fresh per-run
        // envelope under the active key. A decryption failure fails this
        // run only; no other run is touched.
        let context = match &request.context {
            Some(wire) => {
                let envelope = Envelope::from_wire(wire)?;
                if self.keys.is_empty() {
                    return Err(Error::Envelope(EnvelopeError::InvalidKey(
                        "no secret keys configured".to_string(),
                    )));
                }
                let payload = decrypt_first(&self.keys, &envelope)?;
                let fresh = encrypt(&self.keys[0], &payload)?;
                Some(fresh.to_wire())
            }
            None => None,
        };

        if monitor.is_cancelled() {
            self.ledger.mark_running(run_id).await?;
            self.mark_with_outcome(run_id, RunStatus::Cancelled, paths, None)
                .await?;
            return Ok(RunStatus::Cancelled);
        }

        if self.pool.config().reuse_processes {
            self.drive_pooled(run_id, request, paths, monitor, context, timeout, started)
                .await
        } else {
            self.drive_one_shot(run_id, request, paths, monitor, timeout, started)
                .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_pooled(
        &self,
        run_id: &str,
        request: &SubmitRequest,
        paths: &RunPaths,
        monitor: &CancellationMonitor,
        context: Option<String>,
        timeout: Duration,
        started: tokio::time::Instant,
    ) -> Result<RunStatus> {
        let acquired = tokio::select! {
            biased;
            _ = monitor.cancelled() => None,
            acquired = tokio::time::timeout(timeout, self.pool.acquire(&request.environment)) => {
                Some(acquired)
            }
        };

        let mut worker = match acquired {
            None => {
                self.ledger.mark_running(run_id).await?;
                self.mark_with_outcome(run_id, RunStatus::Cancelled, paths, None)
                    .await?;
                return Ok(RunStatus::Cancelled);
            }
            Some(Err(_elapsed)) => {
                self.ledger.mark_running(run_id).await?;
                self.mark_with_outcome(
                    run_id,
                    RunStatus::TimedOut,
                    paths,
                    Some("timed out waiting for a worker".to_string()),
                )
                .await?;
                return Ok(RunStatus::TimedOut);
            }
            Some(Ok(worker)) => worker?,
        };

        // The worker must go back through retire on failure here, or its
        // capacity slot is never freed.
        if let Err(e) = self.ledger.mark_running(run_id).await {
            self.pool.retire(worker).await;
            return Err(e.into());
        }
        debug!(run_id = %run_id, worker_id = %worker.id(), pid = worker.pid(), "Run dispatched to worker");

        let invoke_request = InvokeRequest {
            run_id: run_id.to_string(),
            entrypoint: request.entrypoint.clone(),
            json_input: paths.input.display().to_string(),
            json_output: paths.output.display().to_string(),
            stdout_path: paths.stdout.display().to_string(),
            stderr_path: paths.stderr.display().to_string(),
            context,
        };

        enum PooledOutcome {
            Cancelled,
            TimedOut,
            Ack(Result<crate::pool::InvokeAck>),
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        let outcome = tokio::select! {
            biased;
            _ = monitor.cancelled() => PooledOutcome::Cancelled,
            _ = tokio::time::sleep(remaining) => PooledOutcome::TimedOut,
            ack = worker.invoke(&invoke_request) => PooledOutcome::Ack(ack),
        };

        match outcome {
            PooledOutcome::Ack(Ok(ack)) => {
                if !ack.ok {
                    warn!(run_id = %run_id, "Worker reported harness failure");
                }
                // The worker survived; its result file decides the status.
                self.pool.release(worker).await;
                self.finish_completed(run_id, paths).await
            }
            PooledOutcome::Ack(Err(e)) => {
                // Worker crashed mid-run.
                warn!(run_id = %run_id, error = %e, "Worker channel failed mid-run");
                self.pool.retire(worker).await;
                self.finish_completed(run_id, paths).await
            }
            PooledOutcome::Cancelled => {
                // The worker may still be executing the action; only a kill
                // guarantees it stops, so the worker is not reusable.
                self.pool.retire(worker).await;
                self.mark_with_outcome(run_id, RunStatus::Cancelled, paths, None)
                    .await?;
                Ok(RunStatus::Cancelled)
            }
            PooledOutcome::TimedOut => {
                self.pool.retire(worker).await;
                self.mark_with_outcome(
                    run_id,
                    RunStatus::TimedOut,
                    paths,
                    Some(format!("timed out after {:?}", timeout)),
                )
                .await?;
                Ok(RunStatus::TimedOut)
            }
        }
    }

    async fn drive_one_shot(
        &self,
        run_id: &str,
        request: &SubmitRequest,
        paths: &RunPaths,
        monitor: &CancellationMonitor,
        timeout: Duration,
        started: tokio::time::Instant,
    ) -> Result<RunStatus> {
        let executable = self.pool.config().runner_executable.clone();
        let key = request.environment.fingerprint(&executable);

        let slot = match tokio::time::timeout(timeout, self.pool.acquire_slot(&key)).await {
            Ok(slot) => slot,
            Err(_elapsed) => {
                self.ledger.mark_running(run_id).await?;
                self.mark_with_outcome(
                    run_id,
                    RunStatus::TimedOut,
                    paths,
                    Some("timed out waiting for process capacity".to_string()),
                )
                .await?;
                return Ok(RunStatus::TimedOut);
            }
        };

        if let Err(e) = self.ledger.mark_running(run_id).await {
            self.pool.release_slot(slot).await;
            return Err(e.into());
        }

        let mut spec = ProcessSpec::new(&executable);
        spec.args = vec![
            request.entrypoint.clone(),
            format!("--json-input={}", paths.input.display()),
            format!("--json-output={}", paths.output.display()),
        ];
        spec.env = request.environment.env.clone().into_iter().collect();
        spec.stdout = OutputMode::Capture(paths.stdout.clone());
        spec.stderr = OutputMode::Capture(paths.stderr.clone());

        let remaining = timeout.saturating_sub(started.elapsed());
        let result = async {
            let mut launched = launch(&spec, monitor.clone(), Some(remaining), self.kill_grace)?;
            launched.wait().await.map_err(Error::Cancelled)
        }
        .await;
        self.pool.release_slot(slot).await;

        let (code, status) = result?;
        match status {
            // A runner that exits non-zero broke the contract; its result
            // file, even a passing one, is not trusted.
            LaunchStatus::Completed if code != Some(0) => {
                let mut message = match code {
                    Some(c) => format!("runner exited with code {}", c),
                    None => "runner terminated by signal".to_string(),
                };
                if let Some(tail) = self.stderr_tail(paths).await {
                    message = format!("{}: {}", message, tail);
                }
                self.mark_with_outcome(run_id, RunStatus::Fail, paths, Some(message))
                    .await?;
                Ok(RunStatus::Fail)
            }
            LaunchStatus::Completed => self.finish_completed(run_id, paths).await,
            LaunchStatus::Cancelled => {
                self.mark_with_outcome(run_id, RunStatus::Cancelled, paths, None)
                    .await?;
                Ok(RunStatus::Cancelled)
            }
            LaunchStatus::TimedOut => {
                self.mark_with_outcome(
                    run_id,
                    RunStatus::TimedOut,
                    paths,
                    Some(format!("timed out after {:?}", timeout)),
                )
                .await?;
                Ok(RunStatus::TimedOut)
            }
        }
    }

    /// Read the worker's result file and record the terminal status.
    ///
    /// A missing or unparseable result file is a harness failure: the run
    /// fails with the captured stderr as its error message.
    async fn finish_completed(&self, run_id: &str, paths: &RunPaths) -> Result<RunStatus> {
        let worker_result = match tokio::fs::read(&paths.output).await {
            Ok(bytes) => serde_json::from_slice::<WorkerResult>(&bytes).ok(),
            Err(_) => None,
        };

        let (status, result, error_message) = match worker_result {
            Some(parsed) if parsed.status == "PASS" => (
                RunStatus::Pass,
                parsed.result.map(|v| v.to_string()),
                None,
            ),
            Some(parsed) if parsed.status == "FAIL" => (
                RunStatus::Fail,
                parsed.result.map(|v| v.to_string()),
                Some(parsed.error.unwrap_or_else(|| "action failed".to_string())),
            ),
            Some(parsed) => (
                RunStatus::Fail,
                None,
                Some(format!("unrecognized result status: {}", parsed.status)),
            ),
            None => (
                RunStatus::Fail,
                None,
                Some(self.stderr_tail(paths).await.unwrap_or_else(|| {
                    "worker exited without writing a result".to_string()
                })),
            ),
        };

        let outcome = TerminalOutcome {
            result,
            error_message,
            stdout_ref: Some(paths.stdout.display().to_string()),
            stderr_ref: Some(paths.stderr.display().to_string()),
        };
        self.ledger.mark_terminal(run_id, status, outcome).await?;
        Ok(status)
    }

    async fn mark_with_outcome(
        &self,
        run_id: &str,
        status: RunStatus,
        paths: &RunPaths,
        error_message: Option<String>,
    ) -> Result<()> {
        let outcome = TerminalOutcome {
            result: None,
            error_message,
            stdout_ref: Some(paths.stdout.display().to_string()),
            stderr_ref: Some(paths.stderr.display().to_string()),
        };
        self.ledger.mark_terminal(run_id, status, outcome).await?;
        Ok(())
    }

    /// Last portion of the captured stderr, for harness-failure messages.
    async fn stderr_tail(&self, paths: &RunPaths) -> Option<String> {
        let contents = tokio::fs::read_to_string(&paths.stderr).await.ok()?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return None;
        }
        const TAIL: usize = 2048;
        let mut start = trimmed.len().saturating_sub(TAIL);
        while start > 0 && !trimmed.is_char_boundary(start) {
            start -= 1;
        }
        Some(trimmed[start..].to_string())
    }
}
