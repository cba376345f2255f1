// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stratus_core::dispatch::DispatchConfig;
use stratus_core::engine::EngineConfig;
use stratus_core::executor::{CommandExecutorConfig, TaskKind};

use crate::sweeper::SweeperConfig;

/// Where instance records are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Database {
    /// In-process memory; nothing survives a restart.
    Memory,
    /// SQLite database file.
    Sqlite(PathBuf),
}

impl Database {
    fn parse(url: &str) -> Self {
        if url == "memory" {
            return Database::Memory;
        }
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        Database::Sqlite(PathBuf::from(path))
    }
}

/// Stratus manager configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// `memory` or a SQLite path (optionally prefixed with `sqlite:`)
    pub database_url: String,
    /// Dispatch workers kept alive at all times
    pub initial_workers: usize,
    /// Upper bound on dispatch workers
    pub max_workers: usize,
    /// Idle time before an extra dispatch worker retires
    pub worker_keep_alive: Duration,
    /// Bound on instance lock waits (unbounded when unset)
    pub lock_timeout: Option<Duration>,
    /// Bound on the destroy path's cancel wait (unbounded when unset)
    pub cancel_timeout: Option<Duration>,
    /// Whether images may be copied back off backend nodes
    pub unpropagate_enabled: bool,
    /// Time between termination sweeps
    pub sweep_interval: Duration,
    /// How long one sweep waits for its destroys
    pub sweep_destroy_timeout: Duration,
    /// Backend program and leading arguments; the mock executor is used when unset
    pub backend_command: Option<Vec<String>>,
    /// Tasks the backend program implements (all when unset)
    pub backend_tasks: Option<HashSet<TaskKind>>,
    /// Upper bound on one backend task
    pub backend_task_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRATUS_DATABASE_URL`: `memory` or a SQLite database path
    ///
    /// Optional (with defaults):
    /// - `STRATUS_DISPATCH_INITIAL_WORKERS`: always-on dispatch workers (default: 4)
    /// - `STRATUS_DISPATCH_MAX_WORKERS`: dispatch worker limit (default: 16)
    /// - `STRATUS_WORKER_KEEP_ALIVE_SECS`: extra worker idle time (default: 60)
    /// - `STRATUS_LOCK_TIMEOUT_SECS`: lock wait bound (default: unbounded)
    /// - `STRATUS_CANCEL_TIMEOUT_SECS`: destroy cancel wait bound (default: unbounded)
    /// - `STRATUS_UNPROPAGATE_ENABLED`: allow unpropagation (default: true)
    /// - `STRATUS_SWEEP_INTERVAL_SECS`: termination sweep period (default: 60)
    /// - `STRATUS_SWEEP_DESTROY_TIMEOUT_SECS`: per-sweep destroy wait (default: 120)
    /// - `STRATUS_BACKEND_COMMAND`: backend program and arguments (default: mock executor)
    /// - `STRATUS_BACKEND_TASKS`: comma-separated task names the backend implements
    /// - `STRATUS_BACKEND_TASK_TIMEOUT_SECS`: per-task bound (default: 600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STRATUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STRATUS_DATABASE_URL"))?;
        if database_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "STRATUS_DATABASE_URL",
                "must not be empty",
            ));
        }

        let initial_workers: usize = parse_or(
            "STRATUS_DISPATCH_INITIAL_WORKERS",
            4,
            "must be a positive integer",
        )?;
        if initial_workers == 0 {
            return Err(ConfigError::Invalid(
                "STRATUS_DISPATCH_INITIAL_WORKERS",
                "must be a positive integer",
            ));
        }

        let max_workers: usize = parse_or(
            "STRATUS_DISPATCH_MAX_WORKERS",
            16,
            "must be a positive integer",
        )?;
        if max_workers < initial_workers {
            return Err(ConfigError::Invalid(
                "STRATUS_DISPATCH_MAX_WORKERS",
                "must not be below STRATUS_DISPATCH_INITIAL_WORKERS",
            ));
        }

        let worker_keep_alive = Duration::from_secs(parse_or(
            "STRATUS_WORKER_KEEP_ALIVE_SECS",
            60,
            "must be a number of seconds",
        )?);

        let lock_timeout = optional_secs("STRATUS_LOCK_TIMEOUT_SECS")?;
        let cancel_timeout = optional_secs("STRATUS_CANCEL_TIMEOUT_SECS")?;

        let unpropagate_enabled = match std::env::var("STRATUS_UNPROPAGATE_ENABLED") {
            Ok(v) => match v.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "STRATUS_UNPROPAGATE_ENABLED",
                        "must be true, false, 1 or 0",
                    ));
                }
            },
            Err(_) => true,
        };

        let sweep_interval_secs: u64 = parse_or(
            "STRATUS_SWEEP_INTERVAL_SECS",
            60,
            "must be a number of seconds",
        )?;
        if sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "STRATUS_SWEEP_INTERVAL_SECS",
                "must be at least 1",
            ));
        }

        let sweep_destroy_timeout = Duration::from_secs(parse_or(
            "STRATUS_SWEEP_DESTROY_TIMEOUT_SECS",
            120,
            "must be a number of seconds",
        )?);

        let backend_command = std::env::var("STRATUS_BACKEND_COMMAND")
            .ok()
            .map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());

        let backend_tasks = match std::env::var("STRATUS_BACKEND_TASKS") {
            Ok(v) => Some(
                v.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| {
                        TaskKind::from_name(name).ok_or(ConfigError::Invalid(
                            "STRATUS_BACKEND_TASKS",
                            "contains an unknown task name",
                        ))
                    })
                    .collect::<Result<HashSet<_>, _>>()?,
            ),
            Err(_) => None,
        };

        let backend_task_timeout = Duration::from_secs(parse_or(
            "STRATUS_BACKEND_TASK_TIMEOUT_SECS",
            600,
            "must be a number of seconds",
        )?);

        Ok(Self {
            database_url,
            initial_workers,
            max_workers,
            worker_keep_alive,
            lock_timeout,
            cancel_timeout,
            unpropagate_enabled,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            sweep_destroy_timeout,
            backend_command,
            backend_tasks,
            backend_task_timeout,
        })
    }

    pub fn database(&self) -> Database {
        Database::parse(self.database_url.trim())
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            initial_workers: self.initial_workers,
            max_workers: self.max_workers,
            keep_alive: self.worker_keep_alive,
            ..DispatchConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            unpropagate_enabled: self.unpropagate_enabled,
            cancel_timeout: self.cancel_timeout,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            poll_interval: self.sweep_interval,
            destroy_timeout: self.sweep_destroy_timeout,
        }
    }

    /// Command executor settings, when a backend command is configured.
    pub fn command_executor_config(&self) -> Option<CommandExecutorConfig> {
        let (program, args) = self.backend_command.as_ref()?.split_first()?;
        let mut config = CommandExecutorConfig::new(program.clone());
        config.args = args.to_vec();
        config.timeout = self.backend_task_timeout;
        config.implemented = self.backend_tasks.clone();
        Some(config)
    }
}

fn parse_or<T: FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn optional_secs(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::Invalid(key, "must be a number of seconds")),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
