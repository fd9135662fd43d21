// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end dispatcher tests against scripted runners.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actora_core::{CoreError, Ledger, RunRecord, RunStatus, SqliteLedger, TerminalOutcome};
use actora_engine::dispatcher::RunDispatcher;
use actora_engine::pool::{PoolConfig, WorkerEnvironment, WorkerPool};
use actora_secrets::{EnvelopeKey, SecretPayload, SecretValue, encrypt};
use common::{
    CRASH_RUNNER, FAIL_RUNNER, ONE_SHOT_BAD_EXIT_RUNNER, ONE_SHOT_RUNNER, PASS_RUNNER,
    SLOW_RUNNER, TestContext, write_script,
};

/// Ledger whose first running transition fails, as a locked database would.
struct FlakyRunningLedger {
    inner: Arc<SqliteLedger>,
    tripped: AtomicBool,
}

#[async_trait::async_trait]
impl Ledger for FlakyRunningLedger {
    async fn create(&self, action_id: &str, request_id: &str) -> Result<String, CoreError> {
        self.inner.create(action_id, request_id).await
    }

    async fn mark_running(&self, run_id: &str) -> Result<(), CoreError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(CoreError::DatabaseError {
                operation: "update".to_string(),
                details: "database is locked".to_string(),
            });
        }
        self.inner.mark_running(run_id).await
    }

    async fn mark_terminal(
        &self,
        run_id: &str,
        status: RunStatus,
        outcome: TerminalOutcome,
    ) -> Result<(), CoreError> {
        self.inner.mark_terminal(run_id, status, outcome).await
    }

    async fn bump_numtries(&self, run_id: &str) -> Result<(), CoreError> {
        self.inner.bump_numtries(run_id).await
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        self.inner.get(run_id).await
    }

    async fn list_by_status(
        &self,
        status: RunStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>, CoreError> {
        self.inner.list_by_status(status, limit, offset).await
    }

    async fn list_by_action(
        &self,
        action_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>, CoreError> {
        self.inner.list_by_action(action_id, limit, offset).await
    }

    async fn list_by_request(&self, request_id: &str) -> Result<Vec<RunRecord>, CoreError> {
        self.inner.list_by_request(request_id).await
    }

    async fn count_running(&self) -> Result<i64, CoreError> {
        self.inner.count_running().await
    }
}

/// Context variant whose ledger fails the first running transition.
async fn flaky_running_context(
    runner_script: &str,
    reuse: bool,
) -> (Arc<RunDispatcher>, Arc<WorkerPool>, String, tempfile::TempDir) {
    let temp_dir = tempfile::TempDir::new().expect("create temp dir");
    let runner = write_script(temp_dir.path(), "runner.sh", runner_script);

    let inner = Arc::new(
        SqliteLedger::open(temp_dir.path().join("actora.db"))
            .await
            .expect("open ledger"),
    );
    let ledger: Arc<dyn Ledger> = Arc::new(FlakyRunningLedger {
        inner,
        tripped: AtomicBool::new(false),
    });

    let pool = Arc::new(WorkerPool::new(PoolConfig {
        runner_executable: runner.clone(),
        min_processes: 0,
        max_processes: 1,
        reuse_processes: reuse,
        kill_grace: Duration::from_millis(300),
    }));

    let dispatcher = Arc::new(RunDispatcher::new(
        ledger,
        pool.clone(),
        temp_dir.path().join("data"),
        Vec::new(),
        Duration::from_secs(30),
        Duration::from_millis(300),
    ));

    let key = WorkerEnvironment::default().fingerprint(&runner);
    (dispatcher, pool, key, temp_dir)
}

#[tokio::test]
async fn test_submit_runs_to_pass() {
    let ctx = TestContext::new(PASS_RUNNER, 2, true).await;

    let run_id = ctx.dispatcher.submit(ctx.request("echo")).await.unwrap();
    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Pass);

    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, "pass");
    assert!(record.end_time.is_some());
    assert!(record.result.as_deref().unwrap().contains("echo"));
    assert!(record.stdout_ref.is_some());
    assert!(record.stderr_ref.is_some());
}

#[tokio::test]
async fn test_failing_action_marks_fail() {
    let ctx = TestContext::new(FAIL_RUNNER, 2, true).await;

    let run_id = ctx.dispatcher.submit(ctx.request("boom")).await.unwrap();
    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Fail);

    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    assert_eq!(record.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_cancel_immediately_never_passes() {
    let ctx = TestContext::new(SLOW_RUNNER, 2, true).await;

    let mut request = ctx.request("sleeper");
    request.timeout = Some(Duration::from_secs(60));
    let run_id = ctx.dispatcher.submit(request).await.unwrap();
    ctx.dispatcher.cancel(&run_id);

    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Cancelled);

    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, "cancelled");
}

#[tokio::test]
async fn test_timeout_marks_timed_out() {
    let ctx = TestContext::new(SLOW_RUNNER, 2, true).await;

    let started = std::time::Instant::now();
    let mut request = ctx.request("sleeper");
    request.timeout = Some(Duration::from_secs(1));
    let run_id = ctx.dispatcher.submit(request).await.unwrap();

    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(15));

    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, "timed_out");
    assert!(record.error_message.is_some());
}

#[tokio::test]
async fn test_worker_crash_fails_run_only() {
    let ctx = TestContext::new(CRASH_RUNNER, 2, true).await;

    let run_id = ctx.dispatcher.submit(ctx.request("crash")).await.unwrap();
    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Fail);

    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    assert!(record.error_message.is_some());

    // The crash retired its worker; a fresh submission still works.
    let run_id2 = ctx.dispatcher.submit(ctx.request("crash")).await.unwrap();
    let status2 = ctx.dispatcher.wait(&run_id2).await.unwrap();
    assert_eq!(status2, RunStatus::Fail);
    assert_ne!(run_id, run_id2);
}

#[tokio::test]
async fn test_valid_envelope_flows_through() {
    let key = EnvelopeKey::generate();
    let mut payload = SecretPayload::new();
    payload.insert("token", SecretValue::plain("s3cret"));
    let wire = encrypt(&key, &payload).unwrap().to_wire();

    let ctx = TestContext::with_keys(PASS_RUNNER, 2, true, vec![key]).await;

    let mut request = ctx.request("with-secrets");
    request.context = Some(wire);
    let run_id = ctx.dispatcher.submit(request).await.unwrap();
    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Pass);

    // The envelope never lands in the ledger row.
    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    assert!(!record.result.as_deref().unwrap_or("").contains("s3cret"));
}

#[tokio::test]
async fn test_bad_envelope_fails_that_run_only() {
    let key = EnvelopeKey::generate();
    let wrong_key = EnvelopeKey::generate();
    let mut payload = SecretPayload::new();
    payload.insert("token", SecretValue::plain("s3cret"));
    let wire = encrypt(&wrong_key, &payload).unwrap().to_wire();

    let ctx = TestContext::with_keys(PASS_RUNNER, 2, true, vec![key]).await;

    let mut bad = ctx.request("bad-envelope");
    bad.context = Some(wire);
    let bad_id = ctx.dispatcher.submit(bad).await.unwrap();
    let bad_status = ctx.dispatcher.wait(&bad_id).await.unwrap();
    assert_eq!(bad_status, RunStatus::Fail);

    // An unrelated run is untouched.
    let ok_id = ctx.dispatcher.submit(ctx.request("plain")).await.unwrap();
    let ok_status = ctx.dispatcher.wait(&ok_id).await.unwrap();
    assert_eq!(ok_status, RunStatus::Pass);
}

#[tokio::test]
async fn test_one_shot_mode_runs_to_pass() {
    let ctx = TestContext::new(ONE_SHOT_RUNNER, 2, false).await;

    let run_id = ctx.dispatcher.submit(ctx.request("one-shot")).await.unwrap();
    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Pass);

    // Stdout was captured at spawn.
    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    let stdout = std::fs::read_to_string(record.stdout_ref.unwrap()).unwrap();
    assert_eq!(stdout.trim(), "hello from action");
}

#[tokio::test]
async fn test_concurrent_runs_respect_single_worker_cap() {
    let ctx = TestContext::new(PASS_RUNNER, 1, true).await;

    let a = ctx.dispatcher.submit(ctx.request("a")).await.unwrap();
    let b = ctx.dispatcher.submit(ctx.request("b")).await.unwrap();

    let (sa, sb) = tokio::join!(ctx.dispatcher.wait(&a), ctx.dispatcher.wait(&b));
    assert_eq!(sa.unwrap(), RunStatus::Pass);
    assert_eq!(sb.unwrap(), RunStatus::Pass);
}

#[tokio::test]
async fn test_wait_unknown_run_errors() {
    let ctx = TestContext::new(PASS_RUNNER, 1, true).await;
    assert!(ctx.dispatcher.wait("no-such-run").await.is_err());
}

#[tokio::test]
async fn test_running_transition_failure_frees_worker_capacity() {
    let (dispatcher, pool, key, _temp_dir) = flaky_running_context(PASS_RUNNER, true).await;

    let request = |action: &str| actora_engine::dispatcher::SubmitRequest {
        action_id: action.to_string(),
        entrypoint: "pkg.main".to_string(),
        request_id: "req-1".to_string(),
        arguments: serde_json::json!({}),
        environment: WorkerEnvironment::default(),
        timeout: None,
        context: None,
    };

    let run_id = dispatcher.submit(request("first")).await.unwrap();
    let status = dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Fail);

    // The acquired worker went back through retire; the single capacity
    // unit is free again.
    assert_eq!(pool.live_count(&key).await, 0);

    let run_id2 = dispatcher.submit(request("second")).await.unwrap();
    let status2 = dispatcher.wait(&run_id2).await.unwrap();
    assert_eq!(status2, RunStatus::Pass);
}

#[tokio::test]
async fn test_running_transition_failure_frees_one_shot_slot() {
    let (dispatcher, pool, key, _temp_dir) = flaky_running_context(ONE_SHOT_RUNNER, false).await;

    let request = |action: &str| actora_engine::dispatcher::SubmitRequest {
        action_id: action.to_string(),
        entrypoint: "pkg.main".to_string(),
        request_id: "req-1".to_string(),
        arguments: serde_json::json!({}),
        environment: WorkerEnvironment::default(),
        timeout: None,
        context: None,
    };

    let run_id = dispatcher.submit(request("first")).await.unwrap();
    let status = dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Fail);
    assert_eq!(pool.live_count(&key).await, 0);

    // With the slot returned, a follow-up run proceeds under the same cap.
    let run_id2 = dispatcher.submit(request("second")).await.unwrap();
    let status2 = dispatcher.wait(&run_id2).await.unwrap();
    assert_eq!(status2, RunStatus::Pass);
}

#[tokio::test]
async fn test_one_shot_nonzero_exit_overrides_passing_result() {
    let ctx = TestContext::new(ONE_SHOT_BAD_EXIT_RUNNER, 2, false).await;

    let run_id = ctx.dispatcher.submit(ctx.request("bad-exit")).await.unwrap();
    let status = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Fail);

    let record = ctx.ledger.get(&run_id).await.unwrap().unwrap();
    assert!(
        record
            .error_message
            .as_deref()
            .unwrap()
            .contains("exited with code 3")
    );
}

#[tokio::test]
async fn test_wait_after_completion_reads_ledger() {
    let ctx = TestContext::new(PASS_RUNNER, 1, true).await;

    let run_id = ctx.dispatcher.submit(ctx.request("echo")).await.unwrap();
    let first = ctx.dispatcher.wait(&run_id).await.unwrap();
    // Second wait happens after the in-memory control is gone.
    let second = ctx.dispatcher.wait(&run_id).await.unwrap();
    assert_eq!(first, second);
}
