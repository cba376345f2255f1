// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task executor trait definitions.
//!
//! Defines the abstract interface for backend operations (propagation,
//! hypervisor control, cancellation).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::VmDescriptor;
use crate::state::State;

/// A named backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Propagate,
    PropagateAndStart,
    PropagateAndPause,
    Start,
    StartPaused,
    Unpause,
    Unserialize,
    Reboot,
    Pause,
    ShutdownNormal,
    ShutdownSerialize,
    ReadyForTransport,
    CancelUnpropagated,
    CancelPropagating,
    CancelPropagatingToStart,
    CancelPropagatingToPause,
    CancelAllAtVmm,
    CancelReadyingForTransport,
    CancelReadyForTransport,
    CancelStagingOut,
    CancelStagedOut,
}

impl TaskKind {
    pub const ALL: [TaskKind; 21] = [
        TaskKind::Propagate,
        TaskKind::PropagateAndStart,
        TaskKind::PropagateAndPause,
        TaskKind::Start,
        TaskKind::StartPaused,
        TaskKind::Unpause,
        TaskKind::Unserialize,
        TaskKind::Reboot,
        TaskKind::Pause,
        TaskKind::ShutdownNormal,
        TaskKind::ShutdownSerialize,
        TaskKind::ReadyForTransport,
        TaskKind::CancelUnpropagated,
        TaskKind::CancelPropagating,
        TaskKind::CancelPropagatingToStart,
        TaskKind::CancelPropagatingToPause,
        TaskKind::CancelAllAtVmm,
        TaskKind::CancelReadyingForTransport,
        TaskKind::CancelReadyForTransport,
        TaskKind::CancelStagingOut,
        TaskKind::CancelStagedOut,
    ];

    /// Look a task up by its [`as_str`](Self::as_str) name.
    pub fn from_name(name: &str) -> Option<TaskKind> {
        Self::ALL.into_iter().find(|task| task.as_str() == name)
    }

    /// Stable name, also passed to external backend commands.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Propagate => "propagate",
            TaskKind::PropagateAndStart => "propagate_and_start",
            TaskKind::PropagateAndPause => "propagate_and_pause",
            TaskKind::Start => "start",
            TaskKind::StartPaused => "start_paused",
            TaskKind::Unpause => "unpause",
            TaskKind::Unserialize => "unserialize",
            TaskKind::Reboot => "reboot",
            TaskKind::Pause => "pause",
            TaskKind::ShutdownNormal => "shutdown_normal",
            TaskKind::ShutdownSerialize => "shutdown_serialize",
            TaskKind::ReadyForTransport => "ready_for_transport",
            TaskKind::CancelUnpropagated => "cancel_unpropagated",
            TaskKind::CancelPropagating => "cancel_propagating",
            TaskKind::CancelPropagatingToStart => "cancel_propagating_to_start",
            TaskKind::CancelPropagatingToPause => "cancel_propagating_to_pause",
            TaskKind::CancelAllAtVmm => "cancel_all_at_vmm",
            TaskKind::CancelReadyingForTransport => "cancel_readying_for_transport",
            TaskKind::CancelReadyForTransport => "cancel_ready_for_transport",
            TaskKind::CancelStagingOut => "cancel_staging_out",
            TaskKind::CancelStagedOut => "cancel_staged_out",
        }
    }

    /// Whether this is a cancellation task run on the destroy path.
    pub fn is_cancel(self) -> bool {
        matches!(
            self,
            TaskKind::CancelUnpropagated
                | TaskKind::CancelPropagating
                | TaskKind::CancelPropagatingToStart
                | TaskKind::CancelPropagatingToPause
                | TaskKind::CancelAllAtVmm
                | TaskKind::CancelReadyingForTransport
                | TaskKind::CancelReadyForTransport
                | TaskKind::CancelStagingOut
                | TaskKind::CancelStagedOut
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from task execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The executor does not implement the task.
    #[error("Task not implemented: {0}")]
    NotImplemented(TaskKind),

    /// The backend reported a failure.
    #[error("Task failed: {0}")]
    Failed(String),

    /// Execution timed out.
    #[error("Task timed out")]
    Timeout,

    /// Execution was cancelled.
    #[error("Task cancelled")]
    Cancelled,

    /// Backend process exited with non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything a backend needs to run one task for one instance.
///
/// Built per dispatched task and dropped after its completion is routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// Correlation id for logs.
    pub task_id: Uuid,
    pub instance_id: i64,
    pub name: String,
    pub descriptor: VmDescriptor,
    pub group_id: Option<i64>,
    pub ensemble_id: Option<i64>,
    pub launch_index: i32,
    /// State reported back on success (its corrupted form on failure).
    pub notify_state: State,
}

/// What a backend reports after a successful task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    #[serde(default)]
    pub assigned_hostname: Option<String>,
    #[serde(default)]
    pub assigned_network: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Backend executing lifecycle tasks.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Short identifier for logs.
    fn executor_type(&self) -> &'static str;

    /// Whether the backend can run `task`.
    ///
    /// The engine checks this before choosing a transition; unimplemented
    /// optional tasks make it fall back or fail softly.
    fn implements(&self, task: TaskKind) -> bool;

    /// Run the task to completion.
    async fn execute(&self, task: TaskKind, ctx: &TaskContext) -> Result<TaskOutcome, TaskError>;
}
