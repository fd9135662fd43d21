// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for actora-engine.

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite run ledger.
    pub store_path: PathBuf,
    /// Data directory for per-run input/output files.
    pub data_dir: PathBuf,
    /// Runner executable launched as a worker process.
    pub runner_executable: PathBuf,
    /// Minimum pooled workers per environment (pre-warmed at startup).
    pub min_processes: usize,
    /// Maximum pooled workers per environment.
    pub max_processes: usize,
    /// Whether finished workers are kept idle for reuse.
    pub reuse_processes: bool,
    /// Default per-run wall-clock timeout.
    pub default_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping a worker.
    pub kill_grace: Duration,
    /// Parent pid to watch; engine exits when it disappears.
    pub autoexit_ppid: Option<i32>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_path = PathBuf::from(
            std::env::var("ACTORA_STORE_PATH").unwrap_or_else(|_| ".data/actora.db".to_string()),
        );

        let data_dir =
            PathBuf::from(std::env::var("ACTORA_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let runner_executable = std::env::var("ACTORA_RUNNER")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("ACTORA_RUNNER"))?;

        let min_processes = parse_env_usize("ACTORA_MIN_PROCESSES", 0)?;
        let max_processes = parse_env_usize("ACTORA_MAX_PROCESSES", 4)?;
        if max_processes == 0 {
            return Err(ConfigError::InvalidValue {
                var: "ACTORA_MAX_PROCESSES",
                details: "must be at least 1".to_string(),
            });
        }
        if min_processes > max_processes {
            return Err(ConfigError::InvalidValue {
                var: "ACTORA_MIN_PROCESSES",
                details: format!(
                    "must not exceed ACTORA_MAX_PROCESSES ({})",
                    max_processes
                ),
            });
        }

        let reuse_processes = parse_env_bool("ACTORA_REUSE_PROCESSES", true);

        let default_timeout =
            Duration::from_secs(parse_env_u64("ACTORA_DEFAULT_TIMEOUT_SECS", 300)?);
        let kill_grace = Duration::from_secs(parse_env_u64("ACTORA_KILL_GRACE_SECS", 5)?);

        let autoexit_ppid = match std::env::var("ACTORA_AUTOEXIT_PPID") {
            Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "ACTORA_AUTOEXIT_PPID",
                details: format!("not a pid: {}", raw),
            })?),
            Err(_) => None,
        };

        Ok(Self {
            store_path,
            data_dir,
            runner_executable,
            min_processes,
            max_processes,
            reuse_processes,
            default_timeout,
            kill_grace,
            autoexit_ppid,
        })
    }
}

/// Parse an env var into a bool with a sensible default.
fn parse_env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn parse_env_usize(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            var,
            details: format!("not a number: {}", raw),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            var,
            details: format!("not a number: {}", raw),
        }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {var}: {details}")]
    InvalidValue {
        /// The offending variable.
        var: &'static str,
        /// What was wrong with it.
        details: String,
    },
}
