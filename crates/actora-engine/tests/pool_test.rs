// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool tests against scripted runners.

#![cfg(unix)]

mod common;

use std::time::Duration;

use actora_engine::pool::{InvokeRequest, WorkerEnvironment};
use common::{PASS_RUNNER, TestContext, WRONG_ACK_RUNNER};

fn invoke_request(ctx: &TestContext, run_id: &str) -> InvokeRequest {
    let dir = ctx.data_dir.join("runs").join(run_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("input.json"), b"{}").unwrap();
    InvokeRequest {
        run_id: run_id.to_string(),
        entrypoint: "pkg.main".to_string(),
        json_input: dir.join("input.json").display().to_string(),
        json_output: dir.join("output.json").display().to_string(),
        stdout_path: dir.join("stdout.log").display().to_string(),
        stderr_path: dir.join("stderr.log").display().to_string(),
        context: None,
    }
}

#[tokio::test]
async fn test_invoke_writes_result_before_ack() {
    let ctx = TestContext::new(PASS_RUNNER, 2, true).await;
    let env = WorkerEnvironment::default();

    let mut worker = ctx.pool.acquire(&env).await.unwrap();
    let request = invoke_request(&ctx, "r-1");
    let ack = worker.invoke(&request).await.unwrap();

    assert!(ack.ok);
    assert_eq!(ack.run_id, "r-1");
    let output = std::fs::read_to_string(&request.json_output).unwrap();
    assert!(output.contains("PASS"));

    ctx.pool.release(worker).await;
}

#[tokio::test]
async fn test_invoke_rejects_ack_for_other_run() {
    let ctx = TestContext::new(WRONG_ACK_RUNNER, 2, true).await;
    let env = WorkerEnvironment::default();

    let mut worker = ctx.pool.acquire(&env).await.unwrap();
    let request = invoke_request(&ctx, "r-1");
    let err = worker.invoke(&request).await.err().expect("mismatched ack must fail");
    assert!(err.to_string().contains("someone-else"));

    ctx.pool.retire(worker).await;
}

#[tokio::test]
async fn test_release_reuses_same_process() {
    let ctx = TestContext::new(PASS_RUNNER, 2, true).await;
    let env = WorkerEnvironment::default();

    let worker = ctx.pool.acquire(&env).await.unwrap();
    let first_pid = worker.pid();
    ctx.pool.release(worker).await;

    let worker = ctx.pool.acquire(&env).await.unwrap();
    assert_eq!(worker.pid(), first_pid);
    ctx.pool.release(worker).await;
}

#[tokio::test]
async fn test_acquire_waits_at_cap_until_release() {
    let ctx = TestContext::new(PASS_RUNNER, 1, true).await;
    let env = WorkerEnvironment::default();

    let worker = ctx.pool.acquire(&env).await.unwrap();
    let key = worker.environment_key().to_string();
    assert_eq!(ctx.pool.live_count(&key).await, 1);

    // A second acquire must block while the only worker is borrowed.
    let blocked = tokio::time::timeout(Duration::from_millis(200), ctx.pool.acquire(&env)).await;
    assert!(blocked.is_err());
    assert_eq!(ctx.pool.live_count(&key).await, 1);

    ctx.pool.release(worker).await;
    let worker = tokio::time::timeout(Duration::from_secs(5), ctx.pool.acquire(&env))
        .await
        .expect("acquire did not wake after release")
        .unwrap();
    assert_eq!(ctx.pool.live_count(&key).await, 1);
    ctx.pool.release(worker).await;
}

#[tokio::test]
async fn test_idle_death_is_not_reoffered() {
    let ctx = TestContext::new(PASS_RUNNER, 2, true).await;
    let env = WorkerEnvironment::default();

    let worker = ctx.pool.acquire(&env).await.unwrap();
    let dead_pid = worker.pid();
    ctx.pool.release(worker).await;

    // Kill the idle worker behind the pool's back.
    std::process::Command::new("kill")
        .args(["-9", &dead_pid.to_string()])
        .status()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut worker = ctx.pool.acquire(&env).await.unwrap();
    assert_ne!(worker.pid(), dead_pid);
    assert!(worker.is_alive());
    ctx.pool.release(worker).await;
}

#[tokio::test]
async fn test_retire_frees_capacity() {
    let ctx = TestContext::new(PASS_RUNNER, 1, true).await;
    let env = WorkerEnvironment::default();

    let worker = ctx.pool.acquire(&env).await.unwrap();
    let key = worker.environment_key().to_string();
    ctx.pool.retire(worker).await;
    assert_eq!(ctx.pool.live_count(&key).await, 0);

    // Capacity is back; acquire spawns a fresh worker immediately.
    let worker = tokio::time::timeout(Duration::from_secs(5), ctx.pool.acquire(&env))
        .await
        .expect("acquire did not proceed after retire")
        .unwrap();
    ctx.pool.release(worker).await;
}

#[tokio::test]
async fn test_release_without_reuse_retires() {
    let ctx = TestContext::new(PASS_RUNNER, 2, false).await;
    let env = WorkerEnvironment::default();

    let worker = ctx.pool.acquire(&env).await.unwrap();
    let first_pid = worker.pid();
    let key = worker.environment_key().to_string();
    ctx.pool.release(worker).await;
    assert_eq!(ctx.pool.live_count(&key).await, 0);

    let worker = ctx.pool.acquire(&env).await.unwrap();
    assert_ne!(worker.pid(), first_pid);
    ctx.pool.release(worker).await;
}

#[tokio::test]
async fn test_prewarm_fills_idle_queue() {
    let ctx = TestContext::new(PASS_RUNNER, 4, true).await;
    // Rebuild a pool with min_processes set; the shared context uses 0.
    let config = ctx.pool.config().clone();
    let pool = actora_engine::pool::WorkerPool::new(actora_engine::pool::PoolConfig {
        min_processes: 2,
        ..config
    });
    let env = WorkerEnvironment::default();
    let key = env.fingerprint(&pool.config().runner_executable);

    pool.prewarm(&env).await.unwrap();
    assert_eq!(pool.live_count(&key).await, 2);

    // Both pre-warmed workers are immediately acquirable.
    let a = pool.acquire(&env).await.unwrap();
    let b = pool.acquire(&env).await.unwrap();
    assert_ne!(a.pid(), b.pid());
    pool.release(a).await;
    pool.release(b).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_slot_accounting_shares_the_cap() {
    let ctx = TestContext::new(PASS_RUNNER, 1, true).await;
    let env = WorkerEnvironment::default();
    let key = env.fingerprint(&ctx.pool.config().runner_executable);

    let slot = ctx.pool.acquire_slot(&key).await;
    assert_eq!(ctx.pool.live_count(&key).await, 1);

    // The slot occupies the only capacity unit; worker acquire must wait.
    let blocked = tokio::time::timeout(Duration::from_millis(200), ctx.pool.acquire(&env)).await;
    assert!(blocked.is_err());

    ctx.pool.release_slot(slot).await;
    let worker = tokio::time::timeout(Duration::from_secs(5), ctx.pool.acquire(&env))
        .await
        .expect("acquire did not wake after slot release")
        .unwrap();
    ctx.pool.release(worker).await;
}

#[tokio::test]
async fn test_shutdown_retires_idle_workers() {
    let ctx = TestContext::new(PASS_RUNNER, 4, true).await;
    let env = WorkerEnvironment::default();
    let key = env.fingerprint(&ctx.pool.config().runner_executable);

    let a = ctx.pool.acquire(&env).await.unwrap();
    let b = ctx.pool.acquire(&env).await.unwrap();
    ctx.pool.release(a).await;
    ctx.pool.release(b).await;
    assert_eq!(ctx.pool.live_count(&key).await, 2);

    ctx.pool.shutdown().await;
    assert_eq!(ctx.pool.live_count(&key).await, 0);
}
