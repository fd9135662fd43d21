// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process wrapper.
//!
//! Pure execution logic, no database access. A [`ProcessHandle`] owns one
//! spawned OS process placed in its own process group so that the stop
//! cascade reaches every descendant the worker may have forked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::ProcessError;

/// Where a spawned process's output stream goes.
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// Redirect to a capture file, created at spawn.
    Capture(PathBuf),
    /// Keep the stream piped for the caller to consume.
    Piped,
    /// Discard.
    Null,
}

/// Everything needed to start a worker process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable to launch.
    pub executable: PathBuf,
    /// Arguments, not including argv[0].
    pub args: Vec<String>,
    /// Extra environment variables (inherits the parent environment).
    pub env: HashMap<String, String>,
    /// Working directory; inherits the parent's when `None`.
    pub cwd: Option<PathBuf>,
    /// Stdout destination.
    pub stdout: OutputMode,
    /// Stderr destination.
    pub stderr: OutputMode,
    /// Keep stdin piped (used by the pool's serve-mode control channel).
    pub stdin_piped: bool,
}

impl ProcessSpec {
    /// Spec with inherited environment, no cwd override, and discarded output.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stdout: OutputMode::Null,
            stderr: OutputMode::Null,
            stdin_piped: false,
        }
    }
}

/// A spawned worker process in its own process group.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    executable: String,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`.
    ///
    /// Fails with [`ProcessError::Spawn`] when the executable is missing or
    /// not runnable. The child is placed in a fresh process group so
    /// [`stop`](Self::stop) can terminate its whole tree.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let mut command = Command::new(&spec.executable);
        command.args(&spec.args);
        command.envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        command.stdout(stdio_for(&spec.stdout)?);
        command.stderr(stdio_for(&spec.stderr)?);
        command.stdin(if spec.stdin_piped {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        #[cfg(unix)]
        command.process_group(0);

        command.kill_on_drop(true);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            executable: spec.executable.display().to_string(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| ProcessError::ChannelClosed(
            "process exited before a pid could be observed".to_string(),
        ))?;

        debug!(pid = pid, executable = %spec.executable.display(), "Spawned worker process");

        Ok(Self {
            child,
            pid,
            executable: spec.executable.display().to_string(),
        })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Executable this handle was spawned from.
    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Non-blocking liveness check via `try_wait`.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit and return its code, when one exists.
    pub async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    /// Take the piped stdin channel, when the spec asked for one.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take the piped stdout channel, when the spec asked for one.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Stop the whole process tree: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// An already-exited tree is not an error.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Ok(());
        }

        terminate_tree(self.pid, grace).await?;

        // Reap the child so no zombie lingers.
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, code = ?status.code(), "Worker process stopped");
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Failed to reap stopped worker");
            }
            Err(_) => {
                warn!(pid = self.pid, "Worker did not reap after kill cascade");
            }
        }

        Ok(())
    }
}

fn stdio_for(mode: &OutputMode) -> Result<Stdio, ProcessError> {
    match mode {
        OutputMode::Capture(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(path)?;
            Ok(Stdio::from(file))
        }
        OutputMode::Piped => Ok(Stdio::piped()),
        OutputMode::Null => Ok(Stdio::null()),
    }
}

/// Terminate a process tree rooted at `pid`: graceful signal, grace period,
/// then forced kill. Tolerates a tree that is already gone.
#[cfg(unix)]
pub async fn terminate_tree(pid: u32, grace: Duration) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => debug!(pid = pid, "Sent SIGTERM to process group"),
        Err(Errno::ESRCH) => {
            debug!(pid = pid, "Process group already gone (ESRCH)");
            return Ok(());
        }
        Err(e) => {
            return Err(ProcessError::Signal {
                pid,
                details: format!("SIGTERM failed: {}", e),
            });
        }
    }

    // Poll for the group to die within the grace period.
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        match killpg(pgid, None) {
            Err(Errno::ESRCH) => return Ok(()),
            _ if tokio::time::Instant::now() >= deadline => break,
            _ => continue,
        }
    }

    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {
            debug!(pid = pid, "Sent SIGKILL to process group");
            Ok(())
        }
        Err(e) => Err(ProcessError::Signal {
            pid,
            details: format!("SIGKILL failed: {}", e),
        }),
    }
}

/// Terminate a process tree rooted at `pid` via `taskkill /T /F`.
#[cfg(windows)]
pub async fn terminate_tree(pid: u32, _grace: Duration) -> Result<(), ProcessError> {
    let output = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .output()
        .await?;

    // taskkill exits 128 when the pid no longer exists.
    if !output.status.success() && output.status.code() != Some(128) {
        return Err(ProcessError::Signal {
            pid,
            details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Forward a piped output stream into a file without blocking the caller.
///
/// Returns the task handle; the task ends when the stream closes.
pub fn stream_to_file<R>(reader: R, path: &Path) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let path = path.to_path_buf();
    tokio::spawn(async move {
        let mut reader = reader;
        let file = match tokio::fs::File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open capture file");
                return;
            }
        };
        let mut writer = tokio::io::BufWriter::new(file);
        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
            debug!(path = %path.display(), error = %e, "Capture stream ended with error");
        }
        let _ = writer.flush().await;
    })
}
