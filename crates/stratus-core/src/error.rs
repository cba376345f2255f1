// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-core.

use thiserror::Error;

use crate::executor::TaskKind;
use crate::state::State;

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by instance operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request validation failed before anything was mutated.
    #[error("Invalid parameter '{field}': {message}")]
    ParameterProblem {
        /// The offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The requested target state is not a legal target.
    #[error("{0} is not a legal target state")]
    InvalidTargetState(State),

    /// A resource lookup found nothing.
    #[error("{kind} {id} does not exist")]
    DoesNotExist {
        /// "instance", "group" or "ensemble".
        kind: &'static str,
        /// The identifier that was looked up.
        id: i64,
    },

    /// The backend does not implement a task the transition needs.
    #[error("Task '{task}' is not implemented (instance {instance_id})")]
    TaskNotImplemented {
        /// The missing task.
        task: TaskKind,
        /// The instance whose transition needed it.
        instance_id: i64,
    },

    /// A per-instance lock could not be acquired.
    #[error("Could not acquire lock '{key}': {reason}")]
    LockAcquisitionFailure {
        /// The lock key.
        key: String,
        /// Timeout or shutdown.
        reason: String,
    },

    /// A persistence operation failed; the mutation was not applied.
    #[error(transparent)]
    Database(#[from] PersistenceError),

    /// The instance is (or just became) corrupted.
    #[error("Instance {instance_id} is corrupted ({state}): {cause}")]
    Corrupted {
        /// The instance.
        instance_id: i64,
        /// Its corrupted state.
        state: State,
        /// The recorded cause.
        cause: String,
    },

    /// Destruction of one or more members of a group failed.
    #[error("Failed to destroy {} member(s) of {kind} {group_id}", .failures.len())]
    GroupDestroyFailed {
        /// "group" or "ensemble".
        kind: &'static str,
        /// The group.
        group_id: i64,
        /// Failing member ids with their error messages.
        failures: Vec<(i64, String)>,
    },

    /// Any other management failure.
    #[error("{0}")]
    Manage(String),
}

impl Error {
    /// Machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ParameterProblem { .. } => "PARAMETER_PROBLEM",
            Self::InvalidTargetState(_) => "INVALID_TARGET_STATE",
            Self::DoesNotExist { .. } => "DOES_NOT_EXIST",
            Self::TaskNotImplemented { .. } => "TASK_NOT_IMPLEMENTED",
            Self::LockAcquisitionFailure { .. } => "LOCK_ACQUISITION_FAILURE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Corrupted { .. } => "CORRUPTED",
            Self::GroupDestroyFailed { .. } => "GROUP_DESTROY_FAILED",
            Self::Manage(_) => "MANAGE_ERROR",
        }
    }

    pub(crate) fn parameter(field: &str, message: impl Into<String>) -> Self {
        Self::ParameterProblem {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Errors from the persistence port.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// No record exists for the instance.
    #[error("Instance {0} not found in persistence")]
    NotFound(i64),

    /// A stored record could not be decoded.
    #[error("Stored record for instance {id} is unreadable: {details}")]
    Decode {
        /// The instance.
        id: i64,
        /// What failed to decode.
        details: String,
    },
}

impl PersistenceError {
    pub(crate) fn database(operation: &str, details: impl ToString) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::database("query", err)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::database("json", err)
    }
}
