// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound notifications: scheduler, clients and destruction listeners.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::State;

/// Receives every current-state change.
///
/// Called synchronously while the instance lock is held, so implementations
/// must not block.
pub trait SchedulerNotifier: Send + Sync {
    fn state_notification(&self, instance_id: i64, state: State);
}

/// Scheduler notifier that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl SchedulerNotifier for NoopNotifier {
    fn state_notification(&self, _instance_id: i64, _state: State) {}
}

/// Client-visible state change, published on the instance home's broadcast
/// channel for states in the notify set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub instance_id: i64,
    pub state: State,
    pub error_cause: Option<String>,
    pub at: DateTime<Utc>,
}

/// Called once after an instance has been destroyed and deleted.
pub trait DestructionListener: Send + Sync {
    fn instance_destroyed(&self, instance_id: i64);
}
