// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance home: the registry that creates, finds and destroys instances.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratus_core::executor::MockExecutor;
//! use stratus_core::home::{CreateRequest, InstanceHome};
//! use stratus_core::model::VmDescriptor;
//! use stratus_core::persistence::MemoryPersistence;
//! use stratus_core::state::State;
//!
//! let home = InstanceHome::builder()
//!     .persistence(Arc::new(MemoryPersistence::new()))
//!     .executor(Arc::new(MockExecutor::new()))
//!     .build()?;
//!
//! let request = CreateRequest::new("alice", VmDescriptor::new("web", 2048, 2))
//!     .initial_target(State::STARTED);
//! let instances = home.create(request).await?;
//!
//! home.destroy(instances[0].id()).await?;
//! home.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dispatch::{CompletionSink, DispatchConfig, DispatchPool, DispatchStats};
use crate::engine::EngineConfig;
use crate::error::{Error, PersistenceError, Result};
use crate::executor::{TaskContext, TaskError, TaskExecutor, TaskKind, TaskOutcome};
use crate::instance::{InstanceResource, InstanceServices};
use crate::locks::LockManager;
use crate::model::{
    GroupKind, GroupRecord, InstanceFlags, InstanceRecord, ResourcePoolEntry, SweepableEntry,
    VmDescriptor,
};
use crate::notify::{NoopNotifier, SchedulerNotifier, StateChange};
use crate::persistence::Persistence;
use crate::state::State;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A request to create one or more instances.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub creator: String,
    pub descriptor: VmDescriptor,
    /// Number of instances; more than one creates a group.
    pub count: u32,
    pub initial_target: State,
    /// Put the instances in an ensemble so they are co-scheduled.
    pub coschedule: bool,
    pub termination_time: Option<DateTime<Utc>>,
}

impl CreateRequest {
    /// One instance, left Unstaged.
    pub fn new(creator: impl Into<String>, descriptor: VmDescriptor) -> Self {
        Self {
            creator: creator.into(),
            descriptor,
            count: 1,
            initial_target: State::UNSTAGED,
            coschedule: false,
            termination_time: None,
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn initial_target(mut self, target: State) -> Self {
        self.initial_target = target;
        self
    }

    pub fn coschedule(mut self, coschedule: bool) -> Self {
        self.coschedule = coschedule;
        self
    }

    pub fn termination_time(mut self, at: DateTime<Utc>) -> Self {
        self.termination_time = Some(at);
        self
    }
}

/// Outcome of [`InstanceHome::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Instances loaded from persistence.
    pub loaded: usize,
    /// Instances marked corrupted because their task died with the process.
    pub corrupted: Vec<i64>,
    /// Instances whose interrupted destruction was completed.
    pub destroyed: Vec<i64>,
    /// Instances driven on toward a target they had not reached.
    pub resumed: Vec<i64>,
}

/// Builder for an [`InstanceHome`].
pub struct InstanceHomeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    notifier: Arc<dyn SchedulerNotifier>,
    engine: EngineConfig,
    dispatch: DispatchConfig,
    lock_timeout: Option<Duration>,
    event_capacity: usize,
}

impl std::fmt::Debug for InstanceHomeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHomeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field(
                "executor",
                &self.executor.as_ref().map(|e| e.executor_type()),
            )
            .field("engine", &self.engine)
            .field("dispatch", &self.dispatch)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl Default for InstanceHomeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            executor: None,
            notifier: Arc::new(NoopNotifier),
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
            lock_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl InstanceHomeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the task executor (required).
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the scheduler notifier.
    ///
    /// Default: [`NoopNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn SchedulerNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch = config;
        self
    }

    /// Bound every lock wait. Unbounded by default.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Capacity of the client notification channel.
    ///
    /// Default: 256
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Build the home and start its dispatch workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<InstanceHome>> {
        let persistence = self
            .persistence
            .ok_or_else(|| Error::Manage("persistence is required".to_string()))?;
        let executor = self
            .executor
            .ok_or_else(|| Error::Manage("executor is required".to_string()))?;
        let (events, _) = broadcast::channel(self.event_capacity);

        info!(
            executor = executor.executor_type(),
            initial_workers = self.dispatch.initial_workers,
            max_workers = self.dispatch.max_workers,
            unpropagate_enabled = self.engine.unpropagate_enabled,
            "Instance home starting"
        );

        Ok(Arc::new_cyclic(|home: &Weak<InstanceHome>| {
            let sink: Weak<dyn CompletionSink> = home.clone();
            let dispatch = DispatchPool::new(self.dispatch, executor.clone(), sink);

            InstanceHome {
                services: Arc::new(InstanceServices {
                    persistence,
                    executor,
                    dispatch,
                    locks: LockManager::new(self.lock_timeout),
                    notifier: self.notifier,
                    events,
                    engine: self.engine,
                }),
                cache: RwLock::new(HashMap::new()),
            }
        }))
    }
}

/// Registry of live instances.
pub struct InstanceHome {
    services: Arc<InstanceServices>,
    cache: RwLock<HashMap<i64, Arc<InstanceResource>>>,
}

impl InstanceHome {
    pub fn builder() -> InstanceHomeBuilder {
        InstanceHomeBuilder::new()
    }

    /// Create instances, persist them and apply the initial target.
    ///
    /// If anything fails after the first record was written, every created
    /// instance and group is destroyed again before the error is returned.
    pub async fn create(&self, request: CreateRequest) -> Result<Vec<Arc<InstanceResource>>> {
        self.validate(&request)?;

        let persistence = &self.services.persistence;
        let count = request.count;
        let mut groups = Vec::new();
        let mut created = Vec::new();

        let result = async {
            let group_id = if count > 1 {
                let id = self.create_group(GroupKind::Group, &request.creator).await?;
                groups.push((GroupKind::Group, id));
                Some(id)
            } else {
                None
            };
            let ensemble_id = if request.coschedule {
                let id = self
                    .create_group(GroupKind::Ensemble, &request.creator)
                    .await?;
                groups.push((GroupKind::Ensemble, id));
                Some(id)
            } else {
                None
            };

            for launch_index in 0..count {
                let id = persistence.next_instance_id().await?;
                let record = InstanceRecord {
                    id,
                    group_id,
                    ensemble_id,
                    launch_index: launch_index as i32,
                    creator: request.creator.clone(),
                    state: State::UNSTAGED,
                    target: State::UNSTAGED,
                    descriptor: request.descriptor.clone(),
                    start_time: Some(Utc::now()),
                    termination_time: request.termination_time,
                    flags: InstanceFlags {
                        last_in_group: launch_index + 1 == count,
                        part_of_group_request: count > 1,
                        ..InstanceFlags::default()
                    },
                    error_cause: None,
                };
                persistence.insert_instance(&record).await?;
                created.push(self.cache_instance(record));
            }

            info!(
                creator = %request.creator,
                name = %request.descriptor.name,
                count,
                group_id = ?group_id,
                ensemble_id = ?ensemble_id,
                "Instances created"
            );

            if request.initial_target != State::UNSTAGED {
                for inst in &created {
                    inst.set_target_state(request.initial_target).await?;
                }
            }
            Ok::<_, Error>(())
        }
        .await;

        match result {
            Ok(()) => Ok(created),
            Err(e) => {
                warn!(error = %e, created = created.len(), "Create failed, rolling back");
                for inst in &created {
                    if let Err(cleanup) = self.destroy(inst.id()).await {
                        error!(instance_id = inst.id(), error = %cleanup, "Failed to roll back instance");
                    }
                }
                for (kind, id) in groups {
                    if let Err(cleanup) = persistence.remove_group(kind, id).await {
                        error!(group_id = id, kind = kind.as_str(), error = %cleanup, "Failed to roll back group");
                    }
                }
                Err(e)
            }
        }
    }

    fn validate(&self, request: &CreateRequest) -> Result<()> {
        if request.count < 1 {
            return Err(Error::parameter("count", "must be at least 1"));
        }
        if request.descriptor.name.trim().is_empty() {
            return Err(Error::parameter("name", "must not be empty"));
        }
        if request.descriptor.memory_mb == 0 {
            return Err(Error::parameter("memory_mb", "must be greater than 0"));
        }
        if !request.initial_target.is_legal_target() {
            return Err(Error::InvalidTargetState(request.initial_target));
        }
        if request.descriptor.unpropagate_required && !self.services.engine.unpropagate_enabled {
            return Err(Error::parameter(
                "unpropagate_required",
                "unpropagation is disabled on this manager",
            ));
        }
        Ok(())
    }

    async fn create_group(&self, kind: GroupKind, creator: &str) -> Result<i64> {
        let persistence = &self.services.persistence;
        let id = persistence.next_group_id().await?;
        persistence
            .insert_group(&GroupRecord {
                id,
                kind,
                creator: creator.to_string(),
            })
            .await?;
        debug!(group_id = id, kind = kind.as_str(), "Group created");
        Ok(id)
    }

    fn cache_instance(&self, record: InstanceRecord) -> Arc<InstanceResource> {
        let id = record.id;
        let fresh = Arc::new(InstanceResource::new(record, self.services.clone()));
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.entry(id).or_insert(fresh).clone()
    }

    fn cached(&self, id: i64) -> Option<Arc<InstanceResource>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn evict(&self, id: i64) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Look up an instance, loading it from persistence on a cache miss.
    pub async fn find(&self, id: i64) -> Result<Arc<InstanceResource>> {
        if let Some(inst) = self.cached(id) {
            if inst.is_destroyed() {
                return Err(Error::DoesNotExist {
                    kind: "instance",
                    id,
                });
            }
            return Ok(inst);
        }

        match self.services.persistence.load(id).await? {
            Some(record) => Ok(self.cache_instance(record)),
            None => Err(Error::DoesNotExist {
                kind: "instance",
                id,
            }),
        }
    }

    pub async fn exists(&self, id: i64) -> Result<bool> {
        match self.find(id).await {
            Ok(_) => Ok(true),
            Err(Error::DoesNotExist { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Destroy one instance.
    pub async fn destroy(&self, id: i64) -> Result<()> {
        let inst = self.find(id).await?;
        inst.remove().await?;
        self.evict(id);
        Ok(())
    }

    /// Destroy every member of a group in parallel, then the group itself.
    pub async fn destroy_group(&self, group_id: i64) -> Result<()> {
        self.destroy_collection(GroupKind::Group, group_id).await
    }

    /// Destroy every member of an ensemble in parallel, then the ensemble.
    pub async fn destroy_ensemble(&self, ensemble_id: i64) -> Result<()> {
        self.destroy_collection(GroupKind::Ensemble, ensemble_id)
            .await
    }

    async fn destroy_collection(&self, kind: GroupKind, group_id: i64) -> Result<()> {
        let persistence = &self.services.persistence;
        if persistence.load_group(kind, group_id).await?.is_none() {
            return Err(Error::DoesNotExist {
                kind: kind.as_str(),
                id: group_id,
            });
        }

        let members = match kind {
            GroupKind::Group => persistence.group_members(group_id).await?,
            GroupKind::Ensemble => persistence.ensemble_members(group_id).await?,
        };

        info!(
            group_id,
            kind = kind.as_str(),
            members = members.len(),
            "Destroying group"
        );

        let results = join_all(members.iter().map(|&id| async move {
            match self.destroy(id).await {
                Ok(()) | Err(Error::DoesNotExist { .. }) => Ok(()),
                Err(e) => Err((id, e.to_string())),
            }
        }))
        .await;

        let failures: Vec<(i64, String)> = results.into_iter().filter_map(|r| r.err()).collect();
        if !failures.is_empty() {
            for (id, reason) in &failures {
                warn!(group_id, instance_id = id, error = %reason, "Group member not destroyed");
            }
            return Err(Error::GroupDestroyFailed {
                kind: kind.as_str(),
                group_id,
                failures,
            });
        }

        match persistence.remove_group(kind, group_id).await {
            Ok(()) | Err(PersistenceError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn group_members(&self, group_id: i64) -> Result<Vec<i64>> {
        Ok(self.services.persistence.group_members(group_id).await?)
    }

    pub async fn ensemble_members(&self, ensemble_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .services
            .persistence
            .ensemble_members(ensemble_id)
            .await?)
    }

    /// Ids of every instance that has not been destroyed.
    pub async fn active_ids(&self) -> Result<Vec<i64>> {
        Ok(self.services.persistence.find_active_ids().await?)
    }

    /// Instances with a termination deadline.
    pub async fn sweepable(&self) -> Result<Vec<SweepableEntry>> {
        Ok(self.services.persistence.sweepable_instances().await?)
    }

    /// Record or update a backend node's capacity.
    pub async fn register_pool_entry(&self, entry: &ResourcePoolEntry) -> Result<()> {
        Ok(self.services.persistence.upsert_pool_entry(entry).await?)
    }

    pub async fn resource_pool(&self) -> Result<Vec<ResourcePoolEntry>> {
        Ok(self.services.persistence.list_pool_entries().await?)
    }

    pub async fn health_check(&self) -> Result<()> {
        Ok(self.services.persistence.health_check().await?)
    }

    /// Client-visible state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.services.events.subscribe()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.services.dispatch.stats()
    }

    /// Reload every active instance after a restart.
    ///
    /// A task that was in flight died with the previous process, so its
    /// instance cannot know where it is: it becomes corrupted at that state.
    /// Destruction that was interrupted is carried through, and instances
    /// resting short of their target are driven on.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let ids = self.services.persistence.find_active_ids().await?;
        let mut report = RecoveryReport::default();

        for id in ids {
            let inst = match self.find(id).await {
                Ok(inst) => inst,
                Err(Error::DoesNotExist { .. }) => continue,
                Err(e) => return Err(e),
            };
            report.loaded += 1;

            let (state, target) = (inst.state(), inst.target());
            if target == State::DESTROYING {
                match self.destroy(id).await {
                    Ok(()) => report.destroyed.push(id),
                    Err(e) => {
                        warn!(instance_id = id, state = %state, error = %e, "Interrupted destroy did not complete");
                    }
                }
                continue;
            }

            if state.phase().is_some_and(|p| p.is_in_flight()) {
                inst.set_state(state.corrupted(), Some("interrupted by restart".to_string()))
                    .await?;
                report.corrupted.push(id);
                continue;
            }

            if state != target {
                match inst.resume().await {
                    Ok(true) => report.resumed.push(id),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(instance_id = id, state = %state, target = %target, error = %e, "Could not resume transition");
                    }
                }
            }
        }

        info!(
            loaded = report.loaded,
            corrupted = report.corrupted.len(),
            destroyed = report.destroyed.len(),
            resumed = report.resumed.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    /// Stop dispatching and fail all lock waits.
    pub async fn shutdown(&self) {
        info!("Instance home shutting down");
        self.services.dispatch.shutdown().await;
        self.services.locks.shutdown();
    }
}

#[async_trait]
impl CompletionSink for InstanceHome {
    async fn task_completed(
        &self,
        task: TaskKind,
        ctx: TaskContext,
        result: std::result::Result<TaskOutcome, TaskError>,
    ) {
        let inst = match self.find(ctx.instance_id).await {
            Ok(inst) => inst,
            Err(e) => {
                warn!(
                    instance_id = ctx.instance_id,
                    task = %task,
                    error = %e,
                    "Dropping completion for unknown instance"
                );
                return;
            }
        };

        let (state, cause, outcome) = match result {
            Ok(outcome) => (ctx.notify_state, None, Some(outcome)),
            Err(e) => (
                ctx.notify_state.corrupted(),
                Some(format!("{} failed: {}", task, e)),
                None,
            ),
        };

        if let Err(e) = inst.complete_task(state, cause, outcome.as_ref()).await {
            warn!(
                instance_id = ctx.instance_id,
                task = %task,
                state = %state,
                error = %e,
                "Completion could not be applied"
            );
        }
    }
}
