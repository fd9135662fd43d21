// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for actora-core integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use actora_core::ledger::SqliteLedger;

/// Test context holding an open ledger on a temp store file.
pub struct TestContext {
    pub ledger: SqliteLedger,
    pub store_path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a test context with a freshly migrated store.
    pub async fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let store_path = temp_dir.path().join("ledger.db");
        let ledger = SqliteLedger::open(&store_path)
            .await
            .expect("Failed to open ledger");

        Self {
            ledger,
            store_path,
            _temp_dir: temp_dir,
        }
    }
}
