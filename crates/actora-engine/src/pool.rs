// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool keyed by environment fingerprint.
//!
//! A worker is the runner executable started in serve mode (`--serve`),
//! reading one JSON invocation request per line on stdin and acknowledging
//! each on stdout. Workers are owned exclusively by the pool and borrowed by
//! a run for its duration: an idle worker lives in the pool's queue, a busy
//! worker is held by the borrowing run, and [`WorkerPool::retire`] is the
//! single place a worker transitions to dead so per-environment counts are
//! decremented exactly once no matter which path observed the death.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, ProcessError, Result};
use crate::process::{OutputMode, ProcessHandle, ProcessSpec};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Runner executable launched in serve mode for pooled workers.
    pub runner_executable: PathBuf,
    /// Workers pre-warmed per environment by [`WorkerPool::prewarm`].
    pub min_processes: usize,
    /// Hard cap on live workers per environment.
    pub max_processes: usize,
    /// Keep finished workers idle for reuse.
    pub reuse_processes: bool,
    /// Grace period between SIGTERM and SIGKILL when retiring a worker.
    pub kill_grace: Duration,
}

/// The environment a worker runs in, fingerprinted for pool keying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerEnvironment {
    /// Environment variables beyond the inherited parent environment.
    pub env: BTreeMap<String, String>,
}

impl WorkerEnvironment {
    /// Stable fingerprint over the executable path and the sorted variables.
    ///
    /// Two requests with the same fingerprint may share a worker; any
    /// difference yields a distinct pool key.
    pub fn fingerprint(&self, executable: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(executable.as_os_str().as_encoded_bytes());
        for (name, value) in &self.env {
            hasher.update([0u8]);
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// One invocation request written to a worker's stdin as a JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Run this invocation belongs to.
    pub run_id: String,
    /// Action entrypoint for the runner to resolve.
    pub entrypoint: String,
    /// Path to the serialized input arguments.
    pub json_input: String,
    /// Path the worker writes its result object to.
    pub json_output: String,
    /// Capture file for the action's stdout.
    pub stdout_path: String,
    /// Capture file for the action's stderr.
    pub stderr_path: String,
    /// Secret envelope wire string, when the run carries secrets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Acknowledgement line a worker writes after finishing an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeAck {
    /// Run the acknowledgement is for.
    pub run_id: String,
    /// Whether the invocation harness itself succeeded.
    pub ok: bool,
}

/// A pooled worker process, borrowed from the pool for one run at a time.
pub struct Worker {
    id: String,
    environment_key: String,
    handle: ProcessHandle,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    last_used_at: DateTime<Utc>,
}

impl Worker {
    async fn spawn(config: &PoolConfig, environment: &WorkerEnvironment) -> Result<Self> {
        let mut spec = ProcessSpec::new(&config.runner_executable);
        spec.args = vec!["--serve".to_string()];
        spec.env = environment.env.clone().into_iter().collect();
        spec.stdout = OutputMode::Piped;
        spec.stderr = OutputMode::Null;
        spec.stdin_piped = true;

        let mut handle = ProcessHandle::spawn(&spec)?;
        let stdin = handle.take_stdin();
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| ProcessError::ChannelClosed("no stdout pipe".to_string()))?;

        let worker = Self {
            id: Uuid::new_v4().to_string(),
            environment_key: environment.fingerprint(&config.runner_executable),
            handle,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            last_used_at: Utc::now(),
        };

        info!(
            worker_id = %worker.id,
            pid = worker.handle.pid(),
            environment_key = %worker.environment_key,
            "Worker spawned"
        );

        Ok(worker)
    }

    /// Worker id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// OS pid of the worker process.
    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// Environment fingerprint this worker is bound to.
    pub fn environment_key(&self) -> &str {
        &self.environment_key
    }

    /// When the worker last started an invocation.
    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        self.handle.is_alive()
    }

    /// Send one invocation request and await the worker's acknowledgement.
    ///
    /// The worker writes the run result to `json_output` before
    /// acknowledging, so an `ok` ack means the result file exists. An
    /// acknowledgement carrying a different run id is a protocol violation
    /// and fails the invocation.
    pub async fn invoke(&mut self, request: &InvokeRequest) -> Result<InvokeAck> {
        self.last_used_at = Utc::now();

        let stdin = self.stdin.as_mut().ok_or_else(|| {
            Error::Process(ProcessError::ChannelClosed("stdin closed".to_string()))
        })?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(ProcessError::Io)?;
        stdin.flush().await.map_err(ProcessError::Io)?;

        match self.stdout.next_line().await.map_err(ProcessError::Io)? {
            Some(ack_line) => {
                let ack: InvokeAck = serde_json::from_str(&ack_line)?;
                if ack.run_id != request.run_id {
                    return Err(Error::Process(ProcessError::ChannelClosed(format!(
                        "acknowledgement for run {} while awaiting {}",
                        ack.run_id, request.run_id
                    ))));
                }
                Ok(ack)
            }
            None => Err(Error::Process(ProcessError::ChannelClosed(
                "worker exited before acknowledging".to_string(),
            ))),
        }
    }

    /// Stop the worker: close its stdin so the serve loop can exit, then
    /// kill-cascade anything left of the process tree.
    async fn stop(&mut self, grace: Duration) {
        self.stdin.take();
        if let Err(e) = self.handle.stop(grace).await {
            warn!(worker_id = %self.id, pid = self.handle.pid(), error = %e, "Failed to stop worker");
        }
    }
}

#[derive(Default)]
struct KeyState {
    idle: VecDeque<Worker>,
    /// Live workers for this key: idle plus borrowed. Incremented when a
    /// spawn slot is reserved, decremented only by retire (or by rolling
    /// back a reservation whose spawn failed).
    count: usize,
}

/// A reserved capacity slot, used by the one-shot launch path to count
/// against the same per-environment cap as pooled workers.
pub struct Slot {
    environment_key: String,
}

/// Pool of reusable worker processes keyed by environment fingerprint.
pub struct WorkerPool {
    config: PoolConfig,
    state: Mutex<HashMap<String, KeyState>>,
    released: Notify,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a worker for `environment`: an idle one when available, a
    /// fresh spawn below the cap, otherwise wait for a release. The caller
    /// bounds the wait with its own timeout.
    pub async fn acquire(&self, environment: &WorkerEnvironment) -> Result<Worker> {
        let key = environment.fingerprint(&self.config.runner_executable);
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(worker) = self.try_acquire(&key, environment).await? {
                return Ok(worker);
            }

            released.await;
        }
    }

    async fn try_acquire(
        &self,
        key: &str,
        environment: &WorkerEnvironment,
    ) -> Result<Option<Worker>> {
        // Sweep the idle queue: hand out the first live worker and retire
        // any that died while idle so they are never re-offered.
        loop {
            let dead = {
                let mut state = self.state.lock().await;
                let entry = state.entry(key.to_string()).or_default();
                match entry.idle.pop_front() {
                    Some(mut worker) => {
                        if worker.is_alive() {
                            worker.last_used_at = Utc::now();
                            return Ok(Some(worker));
                        }
                        worker
                    }
                    None => break,
                }
            };
            debug!(worker_id = %dead.id, "Idle worker found dead");
            self.retire(dead).await;
        }

        if !self.reserve(key).await {
            return Ok(None);
        }

        match Worker::spawn(&self.config, environment).await {
            Ok(worker) => Ok(Some(worker)),
            Err(e) => {
                // Roll back the reservation; the worker never existed.
                self.unreserve(key).await;
                Err(e)
            }
        }
    }

    /// Return a borrowed worker. Reused when reuse is enabled and the
    /// process is still alive; retired otherwise.
    pub async fn release(&self, mut worker: Worker) {
        if self.config.reuse_processes && worker.is_alive() {
            let key = worker.environment_key.clone();
            let mut state = self.state.lock().await;
            state.entry(key).or_default().idle.push_back(worker);
            drop(state);
            self.released.notify_waiters();
        } else {
            self.retire(worker).await;
        }
    }

    /// Terminate a worker and release its capacity slot.
    ///
    /// This is the only place a worker's per-environment count is
    /// decremented, so every death path funnels through here.
    pub async fn retire(&self, mut worker: Worker) {
        worker.stop(self.config.kill_grace).await;

        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(&worker.environment_key) {
            entry.count = entry.count.saturating_sub(1);
        }
        drop(state);

        info!(worker_id = %worker.id, environment_key = %worker.environment_key, "Worker retired");
        self.released.notify_waiters();
    }

    /// Pre-warm `min_processes` workers for an environment.
    pub async fn prewarm(&self, environment: &WorkerEnvironment) -> Result<()> {
        let key = environment.fingerprint(&self.config.runner_executable);
        for _ in 0..self.config.min_processes {
            if !self.reserve(&key).await {
                break;
            }
            match Worker::spawn(&self.config, environment).await {
                Ok(worker) => {
                    let mut state = self.state.lock().await;
                    state.entry(key.clone()).or_default().idle.push_back(worker);
                }
                Err(e) => {
                    self.unreserve(&key).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Reserve a capacity slot, waiting for one below the cap.
    ///
    /// Used by the one-shot launch path so direct launches count against
    /// the same per-environment cap as pooled workers. The caller bounds
    /// the wait with its own timeout and must return the slot via
    /// [`release_slot`](Self::release_slot).
    pub async fn acquire_slot(&self, environment_key: &str) -> Slot {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.reserve(environment_key).await {
                return Slot {
                    environment_key: environment_key.to_string(),
                };
            }

            released.await;
        }
    }

    /// Return a capacity slot taken with [`acquire_slot`](Self::acquire_slot).
    pub async fn release_slot(&self, slot: Slot) {
        self.unreserve(&slot.environment_key).await;
    }

    async fn reserve(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_default();
        if entry.count < self.config.max_processes {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    async fn unreserve(&self, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(key) {
            entry.count = entry.count.saturating_sub(1);
        }
        drop(state);
        self.released.notify_waiters();
    }

    /// Count of live workers for an environment key (idle plus borrowed).
    pub async fn live_count(&self, environment_key: &str) -> usize {
        let state = self.state.lock().await;
        state.get(environment_key).map(|e| e.count).unwrap_or(0)
    }

    /// Retire every idle worker. Borrowed workers are stopped by the runs
    /// holding them.
    pub async fn shutdown(&self) {
        loop {
            let worker = {
                let mut state = self.state.lock().await;
                state.values_mut().find_map(|entry| entry.idle.pop_front())
            };
            match worker {
                Some(worker) => self.retire(worker).await,
                None => break,
            }
        }
        info!("Worker pool shut down");
    }
}
