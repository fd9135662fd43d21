// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable run ledger backed by SQLite.
//!
//! Every run the engine accepts gets exactly one row here, and that row is
//! never deleted by the engine (retention is an external policy). Status
//! transitions are enforced with guarded UPDATEs: the WHERE clause names the
//! status the transition requires, so under SQLite's single-writer
//! transaction discipline two competing terminal transitions can never both
//! match a row.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::migrations::{self, MigrationStatus};
use crate::run::{RunRecord, RunStatus, TerminalOutcome};

/// Ledger interface used by the engine.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a new run in status `not_run` and return its id.
    async fn create(&self, action_id: &str, request_id: &str) -> Result<String>;

    /// Transition `not_run` → `running`.
    async fn mark_running(&self, run_id: &str) -> Result<()>;

    /// Transition `running` → the given terminal status, recording the outcome.
    async fn mark_terminal(
        &self,
        run_id: &str,
        status: RunStatus,
        outcome: TerminalOutcome,
    ) -> Result<()>;

    /// Increment the attempt counter for an explicitly re-submitted run.
    async fn bump_numtries(&self, run_id: &str) -> Result<()>;

    /// Fetch one run by id.
    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// List runs with the given status, newest first.
    async fn list_by_status(
        &self,
        status: RunStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>>;

    /// List runs for the given action, newest first.
    async fn list_by_action(
        &self,
        action_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>>;

    /// List runs carrying the given correlation key, newest first.
    async fn list_by_request(&self, request_id: &str) -> Result<Vec<RunRecord>>;

    /// Count runs currently in `running`.
    async fn count_running(&self) -> Result<i64>;
}

/// SQLite-backed run ledger.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Create a ledger from an existing pool. The caller is responsible for
    /// having run migrations.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a ledger store at the given path.
    ///
    /// Creates parent directories, connects, and brings the schema up to
    /// date. Fails with [`CoreError::UnsupportedNewerSchema`] when the store
    /// was written by a newer binary; startup must abort in that case, not
    /// degrade.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        match migrations::migration_status(&pool).await? {
            MigrationStatus::NewerThanSupported => {
                let applied = migrations::applied_migrations(&pool).await?;
                let store_max = applied.iter().map(|(id, _)| *id).max().unwrap_or(0);
                return Err(CoreError::UnsupportedNewerSchema {
                    store_max,
                    binary_max: migrations::binary_max_id(),
                });
            }
            MigrationStatus::UpToDate | MigrationStatus::NeedsMigration => {
                migrations::migrate(&pool).await?;
            }
        }

        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Re-read a run to build a precise transition error after a guarded
    /// update matched no row.
    async fn transition_error(&self, run_id: &str, expected: RunStatus) -> CoreError {
        match self.get(run_id).await {
            Ok(Some(record)) => CoreError::InvalidTransition {
                run_id: run_id.to_string(),
                expected: expected.as_str().to_string(),
                actual: record.status,
            },
            Ok(None) => CoreError::RunNotFound {
                run_id: run_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

const RUN_COLUMNS: &str = "id, action_id, status, start_time, end_time, request_id, \
                           result, error_message, stdout_ref, stderr_ref, numtries";

#[async_trait::async_trait]
impl Ledger for SqliteLedger {
    async fn create(&self, action_id: &str, request_id: &str) -> Result<String> {
        if action_id.is_empty() {
            return Err(CoreError::ValidationError {
                field: "action_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO runs (id, action_id, status, start_time, request_id, numtries)
            VALUES (?, ?, 'not_run', ?, ?, 1)
            "#,
        )
        .bind(&run_id)
        .bind(action_id)
        .bind(Utc::now())
        .bind(request_id)
        .execute(&self.pool)
        .await?;

        Ok(run_id)
    }

    async fn mark_running(&self, run_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running'
            WHERE id = ? AND status = 'not_run'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(run_id, RunStatus::NotRun).await);
        }
        Ok(())
    }

    async fn mark_terminal(
        &self,
        run_id: &str,
        status: RunStatus,
        outcome: TerminalOutcome,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("'{}' is not a terminal status", status),
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?,
                end_time = ?,
                result = ?,
                error_message = ?,
                stdout_ref = ?,
                stderr_ref = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(&outcome.result)
        .bind(&outcome.error_message)
        .bind(&outcome.stdout_ref)
        .bind(&outcome.stderr_ref)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(run_id, RunStatus::Running).await);
        }
        Ok(())
    }

    async fn bump_numtries(&self, run_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET numtries = numtries + 1 WHERE id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_by_status(
        &self,
        status: RunStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>> {
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = ? \
             ORDER BY start_time DESC LIMIT ? OFFSET ?"
        ))
        .bind(status.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_by_action(
        &self,
        action_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>> {
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE action_id = ? \
             ORDER BY start_time DESC LIMIT ? OFFSET ?"
        ))
        .bind(action_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_by_request(&self, request_id: &str) -> Result<Vec<RunRecord>> {
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE request_id = ? ORDER BY start_time DESC"
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn count_running(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM runs WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0)
    }
}
