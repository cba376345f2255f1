// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Manager - cluster manager process for the stratus VM lifecycle engine.
//!
//! Wires an [`InstanceHome`](stratus_core::InstanceHome) to its configured
//! store and backend, recovers persisted instances on start and runs the
//! termination sweeper until shutdown.
//!
//! # Configuration
//!
//! | Variable | Default |
//! |----------|---------|
//! | `STRATUS_DATABASE_URL` | required (`memory` or SQLite path) |
//! | `STRATUS_DISPATCH_INITIAL_WORKERS` | 4 |
//! | `STRATUS_DISPATCH_MAX_WORKERS` | 16 |
//! | `STRATUS_WORKER_KEEP_ALIVE_SECS` | 60 |
//! | `STRATUS_LOCK_TIMEOUT_SECS` | unbounded |
//! | `STRATUS_CANCEL_TIMEOUT_SECS` | unbounded |
//! | `STRATUS_UNPROPAGATE_ENABLED` | true |
//! | `STRATUS_SWEEP_INTERVAL_SECS` | 60 |
//! | `STRATUS_SWEEP_DESTROY_TIMEOUT_SECS` | 120 |
//! | `STRATUS_BACKEND_COMMAND` | mock executor |
//! | `STRATUS_BACKEND_TASKS` | all tasks |
//! | `STRATUS_BACKEND_TASK_TIMEOUT_SECS` | 600 |

/// Environment-based configuration.
pub mod config;

/// Manager error types.
pub mod error;

/// Embeddable runtime with graceful shutdown.
pub mod runtime;

/// Termination-time sweeper.
pub mod sweeper;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::ManagerRuntime;
