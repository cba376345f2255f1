// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor that delegates each task to an external program.
//!
//! The program is invoked as `<program> [args...] <task> <instance_id>` with
//! the serialized [`TaskContext`] in `STRATUS_TASK_CONTEXT`. Exit code 0 means
//! success; a JSON [`TaskOutcome`] printed on stdout is picked up, anything
//! else on stdout is kept as the outcome message.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::traits::*;

/// Configuration for [`CommandExecutor`].
#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// Program to run for every task.
    pub program: String,
    /// Arguments placed before the task name.
    pub args: Vec<String>,
    /// Upper bound on a single task's run time.
    pub timeout: Duration,
    /// Tasks the program supports. `None` means all of them.
    pub implemented: Option<HashSet<TaskKind>>,
}

impl CommandExecutorConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(600),
            implemented: None,
        }
    }
}

/// Runs backend tasks as child processes.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    fn executor_type(&self) -> &'static str {
        "command"
    }

    fn implements(&self, task: TaskKind) -> bool {
        self.config
            .implemented
            .as_ref()
            .is_none_or(|set| set.contains(&task))
    }

    async fn execute(&self, task: TaskKind, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        if !self.implements(task) {
            return Err(TaskError::NotImplemented(task));
        }

        let context_json = serde_json::to_string(ctx)?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(task.as_str())
            .arg(ctx.instance_id.to_string())
            .env("STRATUS_TASK_CONTEXT", context_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            task_id = %ctx.task_id,
            instance_id = ctx.instance_id,
            task = %task,
            program = %self.config.program,
            "Spawning backend command"
        );

        let child = cmd.spawn()?;
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    task_id = %ctx.task_id,
                    instance_id = ctx.instance_id,
                    task = %task,
                    timeout_secs = self.config.timeout.as_secs(),
                    "Backend command timed out"
                );
                return Err(TaskError::Timeout);
            }
        };

        if !output.status.success() {
            return Err(TaskError::ExitCode {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        let outcome = if stdout.is_empty() {
            TaskOutcome::default()
        } else {
            serde_json::from_str(stdout).unwrap_or_else(|_| TaskOutcome {
                message: Some(stdout.to_string()),
                ..TaskOutcome::default()
            })
        };

        info!(
            task_id = %ctx.task_id,
            instance_id = ctx.instance_id,
            task = %task,
            "Backend command completed"
        );

        Ok(outcome)
    }
}
