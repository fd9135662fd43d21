// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actora_core::{Ledger, SqliteLedger};
use actora_engine::dispatcher::{RunDispatcher, SubmitRequest};
use actora_engine::pool::{PoolConfig, WorkerEnvironment, WorkerPool};
use actora_secrets::EnvelopeKey;
use tempfile::TempDir;

/// Serve-mode runner that answers every request with a PASS result.
pub const PASS_RUNNER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  rid=$(printf '%s' "$line" | sed -n 's/.*"run_id":"\([^"]*\)".*/\1/p')
  out=$(printf '%s' "$line" | sed -n 's/.*"json_output":"\([^"]*\)".*/\1/p')
  printf '{"result":{"echo":true},"error":null,"status":"PASS"}' > "$out"
  printf '{"run_id":"%s","ok":true}\n' "$rid"
done
"#;

/// Serve-mode runner that answers every request with a FAIL result.
pub const FAIL_RUNNER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  rid=$(printf '%s' "$line" | sed -n 's/.*"run_id":"\([^"]*\)".*/\1/p')
  out=$(printf '%s' "$line" | sed -n 's/.*"json_output":"\([^"]*\)".*/\1/p')
  printf '{"result":null,"error":"boom","status":"FAIL"}' > "$out"
  printf '{"run_id":"%s","ok":true}\n' "$rid"
done
"#;

/// Serve-mode runner that sleeps before answering, for cancel/timeout tests.
pub const SLOW_RUNNER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  rid=$(printf '%s' "$line" | sed -n 's/.*"run_id":"\([^"]*\)".*/\1/p')
  out=$(printf '%s' "$line" | sed -n 's/.*"json_output":"\([^"]*\)".*/\1/p')
  sleep 30
  printf '{"result":null,"error":null,"status":"PASS"}' > "$out"
  printf '{"run_id":"%s","ok":true}\n' "$rid"
done
"#;

/// Serve-mode runner that dies after reading a request, without answering.
pub const CRASH_RUNNER: &str = r#"#!/bin/sh
IFS= read -r line
exit 1
"#;

/// Serve-mode runner that acknowledges with a foreign run id.
pub const WRONG_ACK_RUNNER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  out=$(printf '%s' "$line" | sed -n 's/.*"json_output":"\([^"]*\)".*/\1/p')
  printf '{"result":null,"error":null,"status":"PASS"}' > "$out"
  printf '{"run_id":"someone-else","ok":true}\n'
done
"#;

/// One-shot runner for the reuse-disabled path:
/// `<runner> <entrypoint> --json-input=<path> --json-output=<path>`.
pub const ONE_SHOT_RUNNER: &str = r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    --json-output=*) out="${arg#--json-output=}" ;;
  esac
done
echo "hello from action"
printf '{"result":"ok","error":null,"status":"PASS"}' > "$out"
"#;

/// One-shot runner that writes a passing result file but exits non-zero.
pub const ONE_SHOT_BAD_EXIT_RUNNER: &str = r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    --json-output=*) out="${arg#--json-output=}" ;;
  esac
done
printf '{"result":"ok","error":null,"status":"PASS"}' > "$out"
exit 3
"#;

/// Write an executable script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Engine wired against a scripted runner in a temp directory.
pub struct TestContext {
    pub ledger: Arc<SqliteLedger>,
    pub pool: Arc<WorkerPool>,
    pub dispatcher: Arc<RunDispatcher>,
    pub data_dir: PathBuf,
    pub _temp_dir: TempDir,
}

impl TestContext {
    pub async fn new(runner_script: &str, max_processes: usize, reuse: bool) -> Self {
        Self::with_keys(runner_script, max_processes, reuse, Vec::new()).await
    }

    pub async fn with_keys(
        runner_script: &str,
        max_processes: usize,
        reuse: bool,
        keys: Vec<EnvelopeKey>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let runner = write_script(temp_dir.path(), "runner.sh", runner_script);

        let ledger = Arc::new(
            SqliteLedger::open(temp_dir.path().join("actora.db"))
                .await
                .expect("open ledger"),
        );

        let pool = Arc::new(WorkerPool::new(PoolConfig {
            runner_executable: runner,
            min_processes: 0,
            max_processes,
            reuse_processes: reuse,
            kill_grace: Duration::from_millis(300),
        }));

        let data_dir = temp_dir.path().join("data");
        let ledger_dyn: Arc<dyn Ledger> = ledger.clone();
        let dispatcher = Arc::new(RunDispatcher::new(
            ledger_dyn,
            pool.clone(),
            &data_dir,
            keys,
            Duration::from_secs(30),
            Duration::from_millis(300),
        ));

        Self {
            ledger,
            pool,
            dispatcher,
            data_dir,
            _temp_dir: temp_dir,
        }
    }

    pub fn request(&self, action_id: &str) -> SubmitRequest {
        SubmitRequest {
            action_id: action_id.to_string(),
            entrypoint: "pkg.main".to_string(),
            request_id: "req-1".to_string(),
            arguments: serde_json::json!({"x": 1}),
            environment: WorkerEnvironment::default(),
            timeout: None,
            context: None,
        }
    }
}
