// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task executors - backends that carry out lifecycle operations.

pub mod command;
pub mod mock;
mod traits;

pub use command::{CommandExecutor, CommandExecutorConfig};
pub use mock::MockExecutor;
pub use traits::*;
