// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-manager.

use thiserror::Error;

/// Manager errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// An instance operation failed.
    #[error("Core error: {0}")]
    Core(#[from] stratus_core::Error),
}

/// Result type using the manager [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
