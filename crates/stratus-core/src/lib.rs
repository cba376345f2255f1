// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Core - VM Instance Lifecycle Engine
//!
//! This crate keeps the authoritative record of every VM instance a cluster
//! manager runs. Clients ask for a *target* state; the engine compares it with
//! the *current* state and dispatches backend tasks (propagate an image, start,
//! pause, shut down, unpropagate) until the two agree. Every transition is
//! persisted before it becomes visible, so a restarted manager can recover.
//!
//! # Architecture
//!
//! ```text
//!   clients ──set_target_state──►┌──────────────────┐
//!                                │  InstanceHome    │──► Persistence
//!                                │  InstanceResource│    (memory / SQLite)
//!                                │  engine rules    │
//!                                └────────┬─────────┘
//!                                         │ submit(task)
//!                                         ▼
//!                                ┌──────────────────┐
//!                                │  DispatchPool    │──► TaskExecutor
//!                                └────────┬─────────┘    (command / mock)
//!                                         │ task_completed
//!                                         ▼
//!                                  set_state(notify)
//! ```
//!
//! # Instance States
//!
//! Normal progression:
//!
//! ```text
//! Unstaged → Unpropagated → Propagating → Propagated → Starting → Started
//!                                              ▲                     │
//!                                              └──── ShuttingDown ◄──┘
//! Propagated → ReadyingForTransport → ReadyForTransport
//! any → Cancelling* → Destroying → DestroySucceeded
//! ```
//!
//! Any state may become `Corrupted` (optionally combined with the state it
//! was in). A corrupted instance stays put until it is destroyed.
//!
//! # Modules
//!
//! - [`state`]: Phases, states and their classification
//! - [`model`]: Instance, group and resource pool records
//! - [`error`]: Error types with machine-readable codes
//! - [`persistence`]: Persistence port with memory and SQLite backends
//! - [`executor`]: Task executor port with command and mock backends
//! - [`locks`]: Per-instance lock manager
//! - [`dispatch`]: Growable worker pool for backend tasks
//! - [`engine`]: Transition rules
//! - [`instance`]: Instance resource
//! - [`home`]: Instance registry, groups and restart recovery
//! - [`notify`]: Scheduler and client notifications

/// Worker pool that runs backend tasks.
pub mod dispatch;

/// Transition rules evaluated after every state or target change.
pub mod engine;

/// Error types.
pub mod error;

/// Task executors.
pub mod executor;

/// Instance registry.
pub mod home;

/// Instance resource.
pub mod instance;

/// Per-instance locks.
pub mod locks;

/// Durable records.
pub mod model;

/// Scheduler notifications and client events.
pub mod notify;

/// Persistence port and backends.
pub mod persistence;

/// Instance states.
pub mod state;

pub use error::{Error, PersistenceError, Result};
pub use home::{CreateRequest, InstanceHome, RecoveryReport};
pub use instance::InstanceResource;
pub use state::{Phase, State};
