// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded, growable worker pool for backend tasks.
//!
//! The pool starts with `initial_workers` tokio tasks pulling jobs from a
//! shared queue. When the number of outstanding jobs (queued plus running)
//! reaches the high-water mark, one more worker is spawned, up to
//! `max_workers`. Extra workers retire after `keep_alive` without work.
//!
//! Every finished job is handed to the [`CompletionSink`], which feeds the
//! achieved state back into the owning instance. The sink is held weakly so
//! the pool never keeps its owner alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::{TaskContext, TaskError, TaskExecutor, TaskKind, TaskOutcome};

/// Configuration for the dispatch pool.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Workers kept alive at all times (at least 1).
    pub initial_workers: usize,
    /// Upper bound on workers.
    pub max_workers: usize,
    /// Idle time after which an extra worker retires.
    pub keep_alive: Duration,
    /// How long shutdown waits for workers to drain.
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            initial_workers: 4,
            max_workers: 16,
            keep_alive: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Outstanding-job count at which the pool grows.
///
/// Half the gap between the initial and maximum size, or the initial size
/// itself when that half is smaller.
pub fn high_water_mark(initial_workers: usize, max_workers: usize) -> usize {
    let half = max_workers.saturating_sub(initial_workers) / 2;
    if half < initial_workers {
        initial_workers
    } else {
        half
    }
}

/// Receives the result of every dispatched task.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn task_completed(
        &self,
        task: TaskKind,
        ctx: TaskContext,
        result: std::result::Result<TaskOutcome, TaskError>,
    );
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub workers: usize,
    pub outstanding: usize,
    pub high_water: usize,
    pub max_workers: usize,
}

struct Job {
    task: TaskKind,
    ctx: TaskContext,
}

struct PoolInner {
    executor: Arc<dyn TaskExecutor>,
    sink: Weak<dyn CompletionSink>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<Job>>,
    outstanding: AtomicUsize,
    workers: AtomicUsize,
    high_water: usize,
    max_workers: usize,
    keep_alive: Duration,
}

/// Worker pool running backend tasks.
pub struct DispatchPool {
    inner: Arc<PoolInner>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl DispatchPool {
    /// Create the pool and spawn its initial workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: DispatchConfig,
        executor: Arc<dyn TaskExecutor>,
        sink: Weak<dyn CompletionSink>,
    ) -> Self {
        let initial = config.initial_workers.max(1);
        let max_workers = config.max_workers.max(initial);
        let (sender, receiver) = mpsc::unbounded_channel();

        let inner = Arc::new(PoolInner {
            executor,
            sink,
            receiver: AsyncMutex::new(receiver),
            outstanding: AtomicUsize::new(0),
            workers: AtomicUsize::new(initial),
            high_water: high_water_mark(initial, max_workers),
            max_workers,
            keep_alive: config.keep_alive,
        });

        let handles = (0..initial)
            .map(|_| tokio::spawn(worker_loop(inner.clone(), true)))
            .collect();

        debug!(
            initial_workers = initial,
            max_workers,
            high_water = inner.high_water,
            "Dispatch pool started"
        );

        Self {
            inner,
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Queue a task. Its completion is delivered to the sink.
    pub fn submit(&self, task: TaskKind, ctx: TaskContext) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .ok_or_else(|| Error::Manage("dispatch pool is shut down".to_string()))?;

        let outstanding = self.inner.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        if sender.send(Job { task, ctx }).is_err() {
            self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Manage("dispatch pool is shut down".to_string()));
        }

        if outstanding >= self.inner.high_water {
            self.grow();
        }

        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    fn grow(&self) {
        let mut current = self.inner.workers.load(Ordering::SeqCst);
        while current < self.inner.max_workers {
            match self.inner.workers.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!(workers = current + 1, "Adding dispatch worker");
                    let handle = tokio::spawn(worker_loop(self.inner.clone(), false));
                    if let Ok(mut handles) = self.handles.lock() {
                        handles.retain(|h| !h.is_finished());
                        handles.push(handle);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            workers: self.inner.workers.load(Ordering::SeqCst),
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            high_water: self.inner.high_water,
            max_workers: self.inner.max_workers,
        }
    }

    /// Stop accepting tasks, let workers drain the queue, and wait for them.
    ///
    /// Workers still busy after the shutdown timeout are aborted.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("Dispatch worker did not finish in time, aborting");
                abort.abort();
            }
        }

        info!("Dispatch pool stopped");
    }
}

async fn worker_loop(inner: Arc<PoolInner>, core: bool) {
    loop {
        let next = async { inner.receiver.lock().await.recv().await };
        let job = if core {
            next.await
        } else {
            // The idle clock covers waiting for the queue lock too.
            match tokio::time::timeout(inner.keep_alive, next).await {
                Ok(job) => job,
                Err(_) => {
                    debug!("Idle dispatch worker retiring");
                    break;
                }
            }
        };

        let Some(job) = job else {
            break;
        };

        inner.run(job).await;
        inner.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    inner.workers.fetch_sub(1, Ordering::SeqCst);
}

impl PoolInner {
    async fn run(&self, job: Job) {
        let Job { task, ctx } = job;

        debug!(
            task_id = %ctx.task_id,
            instance_id = ctx.instance_id,
            task = %task,
            executor = self.executor.executor_type(),
            "Running task"
        );

        let result = self.executor.execute(task, &ctx).await;

        if let Err(e) = &result {
            warn!(
                task_id = %ctx.task_id,
                instance_id = ctx.instance_id,
                task = %task,
                error = %e,
                "Task failed"
            );
        }

        match self.sink.upgrade() {
            Some(sink) => sink.task_completed(task, ctx, result).await,
            None => warn!(
                instance_id = ctx.instance_id,
                task = %task,
                "Completion sink is gone, dropping task result"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::model::VmDescriptor;
    use crate::state::State;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        completions: Mutex<Vec<(i64, TaskKind, bool)>>,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.completions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn task_completed(
            &self,
            task: TaskKind,
            ctx: TaskContext,
            result: std::result::Result<TaskOutcome, TaskError>,
        ) {
            self.completions
                .lock()
                .unwrap()
                .push((ctx.instance_id, task, result.is_ok()));
        }
    }

    fn ctx(instance_id: i64) -> TaskContext {
        TaskContext {
            task_id: Uuid::new_v4(),
            instance_id,
            name: format!("vm-{instance_id}"),
            descriptor: VmDescriptor::new("vm", 128, 1),
            group_id: None,
            ensemble_id: None,
            launch_index: 0,
            notify_state: State::STARTED,
        }
    }

    fn sink_ref(sink: &Arc<RecordingSink>) -> Weak<dyn CompletionSink> {
        let sink: Arc<dyn CompletionSink> = sink.clone();
        Arc::downgrade(&sink)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_high_water_mark() {
        assert_eq!(high_water_mark(4, 16), 6);
        assert_eq!(high_water_mark(4, 8), 4);
        assert_eq!(high_water_mark(1, 1), 1);
        assert_eq!(high_water_mark(2, 100), 49);
        assert_eq!(high_water_mark(5, 3), 5);
    }

    #[tokio::test]
    async fn test_completions_are_routed_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let pool = DispatchPool::new(
            DispatchConfig::default(),
            Arc::new(MockExecutor::new()),
            sink_ref(&sink),
        );

        for id in 1..=3 {
            pool.submit(TaskKind::Start, ctx(id)).unwrap();
        }

        wait_until(|| sink.count() == 3).await;
        let mut ids: Vec<i64> = sink
            .completions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, ok)| {
                assert!(ok);
                *id
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_routed_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let pool = DispatchPool::new(
            DispatchConfig::default(),
            Arc::new(MockExecutor::failing()),
            sink_ref(&sink),
        );

        pool.submit(TaskKind::Pause, ctx(1)).unwrap();
        wait_until(|| sink.count() == 1).await;
        assert_eq!(
            sink.completions.lock().unwrap()[0],
            (1, TaskKind::Pause, false)
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_grows_to_max_and_shrinks_back() {
        let sink = Arc::new(RecordingSink::default());
        let executor = Arc::new(MockExecutor::gated());
        let config = DispatchConfig {
            initial_workers: 1,
            max_workers: 3,
            keep_alive: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
        };
        let pool = DispatchPool::new(config, executor.clone(), sink_ref(&sink));
        assert_eq!(pool.stats().high_water, 1);

        for id in 1..=5 {
            pool.submit(TaskKind::Start, ctx(id)).unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 3);
        assert_eq!(stats.outstanding, 5);

        executor.release(5);
        wait_until(|| sink.count() == 5).await;
        wait_until(|| pool.stats().workers == 1).await;
        assert_eq!(pool.stats().outstanding, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let sink = Arc::new(RecordingSink::default());
        let pool = DispatchPool::new(
            DispatchConfig::default(),
            Arc::new(MockExecutor::new()),
            sink_ref(&sink),
        );
        assert!(!pool.is_shut_down());
        pool.shutdown().await;

        assert!(pool.is_shut_down());
        assert!(pool.submit(TaskKind::Start, ctx(1)).is_err());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_dropped_sink_discards_results() {
        let sink = Arc::new(RecordingSink::default());
        let weak = sink_ref(&sink);
        drop(sink);

        let pool = DispatchPool::new(DispatchConfig::default(), Arc::new(MockExecutor::new()), weak);
        pool.submit(TaskKind::Start, ctx(1)).unwrap();
        wait_until(|| pool.stats().outstanding == 0).await;
        pool.shutdown().await;
    }
}
