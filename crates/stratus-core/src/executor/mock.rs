// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock executor for testing.
//!
//! Simulates backend tasks without touching any hypervisor. Behaviour is
//! tuned through public knobs and builder methods.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::traits::*;

/// Mock executor for testing.
pub struct MockExecutor {
    /// Optional delay to simulate execution time (in milliseconds)
    pub execution_delay_ms: u64,
    /// If true, every task fails
    pub fail_by_default: bool,
    /// If true, tasks never return. Useful for testing timeouts.
    pub never_complete: bool,
    unimplemented: HashSet<TaskKind>,
    failing: HashSet<TaskKind>,
    gate: Option<Arc<Semaphore>>,
    executed: Mutex<Vec<(i64, TaskKind)>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// Create a mock executor implementing every task.
    pub fn new() -> Self {
        Self {
            execution_delay_ms: 10,
            fail_by_default: false,
            never_complete: false,
            unimplemented: HashSet::new(),
            failing: HashSet::new(),
            gate: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock executor whose tasks all fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Create a mock executor whose tasks never return.
    pub fn never_completing() -> Self {
        Self {
            execution_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Create a mock executor that holds non-cancel tasks until
    /// [`release`](Self::release) is called.
    pub fn gated() -> Self {
        Self {
            execution_delay_ms: 0,
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    /// Report the given tasks as not implemented.
    pub fn without(mut self, tasks: &[TaskKind]) -> Self {
        self.unimplemented.extend(tasks.iter().copied());
        self
    }

    /// Make the given tasks fail.
    pub fn failing_on(mut self, tasks: &[TaskKind]) -> Self {
        self.failing.extend(tasks.iter().copied());
        self
    }

    /// Let `n` held tasks proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Tasks started so far, as `(instance_id, task)` in start order.
    pub fn executed(&self) -> Vec<(i64, TaskKind)> {
        self.executed
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Tasks started so far for one instance.
    pub fn executed_for(&self, instance_id: i64) -> Vec<TaskKind> {
        self.executed()
            .into_iter()
            .filter(|(id, _)| *id == instance_id)
            .map(|(_, task)| task)
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    fn executor_type(&self) -> &'static str {
        "mock"
    }

    fn implements(&self, task: TaskKind) -> bool {
        !self.unimplemented.contains(&task)
    }

    async fn execute(&self, task: TaskKind, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push((ctx.instance_id, task));
        }

        if !self.implements(task) {
            return Err(TaskError::NotImplemented(task));
        }

        if self.never_complete {
            std::future::pending::<()>().await;
        }

        if let Some(gate) = &self.gate
            && !task.is_cancel()
        {
            let permit = gate.acquire().await.map_err(|_| TaskError::Cancelled)?;
            permit.forget();
        }

        if self.execution_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.execution_delay_ms)).await;
        }

        if self.fail_by_default || self.failing.contains(&task) {
            return Err(TaskError::Failed(format!("mock failure in {}", task)));
        }

        Ok(TaskOutcome {
            assigned_hostname: ctx
                .descriptor
                .assigned_hostname
                .clone()
                .or_else(|| Some(format!("mock-node-{}", ctx.instance_id))),
            assigned_network: ctx.descriptor.requested_network.clone(),
            message: Some(format!("{} completed", task)),
        })
    }
}
