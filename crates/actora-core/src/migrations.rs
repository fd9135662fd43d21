// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema migrations for the run ledger.
//!
//! Migrations are embedded in the binary and applied programmatically at
//! startup, in ascending id order, before the pool accepts work. Each
//! migration runs inside a single transaction that both alters the schema
//! and records its own marker row in the `migrations` table, so a crash
//! mid-migration leaves the store at a well-defined prior version.
//!
//! The applied id set must always be a prefix of [`MIGRATIONS`]. A store
//! that records an id this binary does not know was written by a newer
//! binary and is refused. An older binary must never silently operate on
//! a store it misunderstands.

use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteRow;
use tracing::info;

use crate::error::{CoreError, Result};

/// One embedded schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Monotonic migration id. Ids are assigned once and never reused.
    pub id: i64,
    /// Human-readable migration name, recorded alongside the id.
    pub name: &'static str,
    /// Schema SQL executed inside the migration's transaction.
    pub sql: &'static str,
}

/// The statically known migration sequence, in ascending id order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "create_runs",
        sql: r#"
            CREATE TABLE runs (
                id TEXT PRIMARY KEY,
                action_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'not_run',
                start_time TEXT NOT NULL
            )
        "#,
    },
    Migration {
        id: 2,
        name: "add_run_end_time",
        sql: "ALTER TABLE runs ADD COLUMN end_time TEXT",
    },
    Migration {
        id: 3,
        name: "add_run_request_id",
        sql: r#"
            ALTER TABLE runs ADD COLUMN request_id TEXT NOT NULL DEFAULT '';
            CREATE INDEX idx_runs_request_id ON runs (request_id);
        "#,
    },
    Migration {
        id: 4,
        name: "add_run_result",
        sql: "ALTER TABLE runs ADD COLUMN result TEXT",
    },
    Migration {
        id: 5,
        name: "add_run_error_message",
        sql: "ALTER TABLE runs ADD COLUMN error_message TEXT",
    },
    Migration {
        id: 6,
        name: "add_run_output_refs",
        sql: r#"
            ALTER TABLE runs ADD COLUMN stdout_ref TEXT;
            ALTER TABLE runs ADD COLUMN stderr_ref TEXT;
        "#,
    },
    Migration {
        id: 7,
        name: "add_run_numtries",
        sql: "ALTER TABLE runs ADD COLUMN numtries INTEGER NOT NULL DEFAULT 1",
    },
    Migration {
        id: 8,
        name: "add_runs_status_index",
        sql: "CREATE INDEX idx_runs_status ON runs (status)",
    },
    Migration {
        id: 9,
        name: "add_runs_action_index",
        sql: "CREATE INDEX idx_runs_action_id ON runs (action_id)",
    },
];

/// Relationship between a store's schema and this binary's migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Every known migration is applied.
    UpToDate,
    /// Some known migrations are not yet applied.
    NeedsMigration,
    /// The store records a migration id this binary does not know.
    NewerThanSupported,
}

/// Highest migration id this binary understands.
pub fn binary_max_id() -> i64 {
    MIGRATIONS.last().map(|m| m.id).unwrap_or(0)
}

/// Create the `migrations` marker table if it does not exist yet.
pub async fn ensure_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Read the applied migration markers, ascending by id.
pub async fn applied_migrations(pool: &SqlitePool) -> Result<Vec<(i64, String)>> {
    let rows: Vec<SqliteRow> = sqlx::query("SELECT id, name FROM migrations ORDER BY id ASC")
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| {
            let id: i64 = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            Ok((id, name))
        })
        .collect()
}

/// Determine how the store's schema relates to this binary.
///
/// Fails with [`CoreError::MigrationLedgerCorrupt`] when the applied set is
/// not a prefix of the known sequence (a gap or a renamed migration), which
/// is distinct from the store simply being newer.
pub async fn migration_status(pool: &SqlitePool) -> Result<MigrationStatus> {
    ensure_migrations_table(pool).await?;
    let applied = applied_migrations(pool).await?;

    if let Some(&(store_max, _)) = applied.iter().max_by_key(|(id, _)| *id)
        && store_max > binary_max_id()
    {
        return Ok(MigrationStatus::NewerThanSupported);
    }

    validate_prefix(&applied)?;

    if applied.len() == MIGRATIONS.len() {
        Ok(MigrationStatus::UpToDate)
    } else {
        Ok(MigrationStatus::NeedsMigration)
    }
}

/// Apply every migration whose id is not yet recorded, in ascending order.
///
/// Idempotent: applying against an up-to-date store is a no-op. Returns the
/// number of migrations applied. Refuses a store written by a newer binary.
pub async fn migrate(pool: &SqlitePool) -> Result<usize> {
    match migration_status(pool).await? {
        MigrationStatus::NewerThanSupported => {
            let applied = applied_migrations(pool).await?;
            let store_max = applied.iter().map(|(id, _)| *id).max().unwrap_or(0);
            return Err(CoreError::UnsupportedNewerSchema {
                store_max,
                binary_max: binary_max_id(),
            });
        }
        MigrationStatus::UpToDate => return Ok(0),
        MigrationStatus::NeedsMigration => {}
    }

    let applied = applied_migrations(pool).await?;
    let mut count = 0usize;

    for migration in MIGRATIONS.iter().skip(applied.len()) {
        // Schema change and marker row commit together: a crash between them
        // rolls both back, so no partially-applied migration is ever recorded.
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO migrations (id, name) VALUES (?, ?)")
            .bind(migration.id)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            migration_id = migration.id,
            migration_name = migration.name,
            "Applied migration"
        );
        count += 1;
    }

    Ok(count)
}

/// Check that the applied markers exactly prefix the known sequence.
fn validate_prefix(applied: &[(i64, String)]) -> Result<()> {
    if applied.len() > MIGRATIONS.len() {
        return Err(CoreError::MigrationLedgerCorrupt {
            details: format!(
                "store records {} migrations but only {} are known",
                applied.len(),
                MIGRATIONS.len()
            ),
        });
    }

    for ((applied_id, applied_name), known) in applied.iter().zip(MIGRATIONS.iter()) {
        if *applied_id != known.id {
            return Err(CoreError::MigrationLedgerCorrupt {
                details: format!(
                    "expected migration id {} at position, store has {}",
                    known.id, applied_id
                ),
            });
        }
        if applied_name != known.name {
            return Err(CoreError::MigrationLedgerCorrupt {
                details: format!(
                    "migration {} is named '{}' in the store, expected '{}'",
                    known.id, applied_name, known.name
                ),
            });
        }
    }

    Ok(())
}
