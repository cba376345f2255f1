// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-core integration tests.
//!
//! Provides a persistence wrapper with injectable failures, a recording
//! scheduler notifier, and helpers to build a home and wait for states.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stratus_core::dispatch::DispatchConfig;
use stratus_core::engine::EngineConfig;
use stratus_core::error::PersistenceError;
use stratus_core::executor::{MockExecutor, TaskExecutor};
use stratus_core::home::InstanceHome;
use stratus_core::instance::InstanceResource;
use stratus_core::model::{
    GroupKind, GroupRecord, InstanceFlags, InstanceRecord, ResourcePoolEntry, SweepableEntry,
    VmDescriptor,
};
use stratus_core::notify::SchedulerNotifier;
use stratus_core::persistence::{MemoryPersistence, Persistence};
use stratus_core::state::State;

type PResult<T> = Result<T, PersistenceError>;

/// Memory persistence whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyPersistence {
    pub inner: MemoryPersistence,
    fail_writes: AtomicBool,
    fail_remove_for: Mutex<HashSet<i64>>,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every state and target write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `remove` fail for one instance.
    pub fn fail_remove_for(&self, id: i64) {
        self.fail_remove_for.lock().unwrap().insert(id);
    }

    pub fn allow_remove(&self, id: i64) {
        self.fail_remove_for.lock().unwrap().remove(&id);
    }

    fn check_write(&self, operation: &str) -> PResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Database {
                operation: operation.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn next_instance_id(&self) -> PResult<i64> {
        self.inner.next_instance_id().await
    }

    async fn next_group_id(&self) -> PResult<i64> {
        self.inner.next_group_id().await
    }

    async fn insert_instance(&self, record: &InstanceRecord) -> PResult<()> {
        self.inner.insert_instance(record).await
    }

    async fn load(&self, id: i64) -> PResult<Option<InstanceRecord>> {
        self.inner.load(id).await
    }

    async fn set_state(&self, id: i64, state: State, error: Option<&str>) -> PResult<()> {
        self.check_write("set_state")?;
        self.inner.set_state(id, state, error).await
    }

    async fn set_target_state(&self, id: i64, target: State) -> PResult<()> {
        self.check_write("set_target_state")?;
        self.inner.set_target_state(id, target).await
    }

    async fn update_descriptor(&self, id: i64, descriptor: &VmDescriptor) -> PResult<()> {
        self.inner.update_descriptor(id, descriptor).await
    }

    async fn update_flags(&self, id: i64, flags: &InstanceFlags) -> PResult<()> {
        self.inner.update_flags(id, flags).await
    }

    async fn set_termination_time(&self, id: i64, at: Option<DateTime<Utc>>) -> PResult<()> {
        self.inner.set_termination_time(id, at).await
    }

    async fn remove(&self, id: i64) -> PResult<()> {
        if self.fail_remove_for.lock().unwrap().contains(&id) {
            return Err(PersistenceError::Database {
                operation: "remove".to_string(),
                details: "injected failure".to_string(),
            });
        }
        self.inner.remove(id).await
    }

    async fn find_active_ids(&self) -> PResult<Vec<i64>> {
        self.inner.find_active_ids().await
    }

    async fn sweepable_instances(&self) -> PResult<Vec<SweepableEntry>> {
        self.inner.sweepable_instances().await
    }

    async fn insert_group(&self, group: &GroupRecord) -> PResult<()> {
        self.inner.insert_group(group).await
    }

    async fn load_group(&self, kind: GroupKind, id: i64) -> PResult<Option<GroupRecord>> {
        self.inner.load_group(kind, id).await
    }

    async fn remove_group(&self, kind: GroupKind, id: i64) -> PResult<()> {
        self.inner.remove_group(kind, id).await
    }

    async fn group_members(&self, group_id: i64) -> PResult<Vec<i64>> {
        self.inner.group_members(group_id).await
    }

    async fn ensemble_members(&self, ensemble_id: i64) -> PResult<Vec<i64>> {
        self.inner.ensemble_members(ensemble_id).await
    }

    async fn upsert_pool_entry(&self, entry: &ResourcePoolEntry) -> PResult<()> {
        self.inner.upsert_pool_entry(entry).await
    }

    async fn list_pool_entries(&self) -> PResult<Vec<ResourcePoolEntry>> {
        self.inner.list_pool_entries().await
    }

    async fn health_check(&self) -> PResult<()> {
        self.inner.health_check().await
    }
}

/// Scheduler notifier that records every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(i64, State)>>,
}

impl RecordingNotifier {
    pub fn states_for(&self, id: i64) -> Vec<State> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, s)| *s)
            .collect()
    }
}

impl SchedulerNotifier for RecordingNotifier {
    fn state_notification(&self, instance_id: i64, state: State) {
        self.seen.lock().unwrap().push((instance_id, state));
    }
}

/// Everything a test needs to drive a home.
pub struct TestHome {
    pub home: Arc<InstanceHome>,
    pub persistence: Arc<FlakyPersistence>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Build a home around `executor` with default engine settings.
pub fn test_home(executor: Arc<dyn TaskExecutor>) -> TestHome {
    test_home_with(executor, EngineConfig::default())
}

pub fn test_home_with(executor: Arc<dyn TaskExecutor>, engine: EngineConfig) -> TestHome {
    test_home_on(Arc::new(FlakyPersistence::new()), executor, engine)
}

/// Build a home over existing persistence, as a restarted manager would.
pub fn test_home_on(
    persistence: Arc<FlakyPersistence>,
    executor: Arc<dyn TaskExecutor>,
    engine: EngineConfig,
) -> TestHome {
    let notifier = Arc::new(RecordingNotifier::default());
    let home = InstanceHome::builder()
        .persistence(persistence.clone())
        .executor(executor)
        .notifier(notifier.clone())
        .engine_config(engine)
        .dispatch_config(DispatchConfig {
            initial_workers: 2,
            max_workers: 4,
            keep_alive: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(1),
        })
        .lock_timeout(Duration::from_secs(5))
        .build()
        .expect("home should build");

    TestHome {
        home,
        persistence,
        notifier,
    }
}

/// Mock executor that completes tasks immediately.
pub fn fast_mock() -> MockExecutor {
    let mut mock = MockExecutor::new();
    mock.execution_delay_ms = 0;
    mock
}

pub fn descriptor(name: &str) -> VmDescriptor {
    VmDescriptor::new(name, 1024, 1)
}

/// Write a record straight into persistence, bypassing the engine.
pub async fn seed(
    persistence: &FlakyPersistence,
    state: State,
    target: State,
    descriptor: VmDescriptor,
) -> i64 {
    let id = persistence.next_instance_id().await.unwrap();
    let record = InstanceRecord {
        id,
        group_id: None,
        ensemble_id: None,
        launch_index: 0,
        creator: "test".to_string(),
        state,
        target,
        descriptor,
        start_time: Some(Utc::now()),
        termination_time: None,
        flags: InstanceFlags::default(),
        error_cause: None,
    };
    persistence.insert_instance(&record).await.unwrap();
    id
}

/// Poll until the instance reaches `state`, panicking after two seconds.
pub async fn wait_for_state(inst: &InstanceResource, state: State) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if inst.state() == state {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "instance {} did not reach {} (state {}, target {})",
                inst.id(),
                state,
                inst.state(),
                inst.target()
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
