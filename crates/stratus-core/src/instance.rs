// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance resource: the authoritative in-memory record of one VM.
//!
//! All mutations take the instance's locks through the [`LockManager`] and
//! are written to persistence before the in-memory copy changes. A failed
//! write leaves memory untouched and surfaces as [`Error::Database`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::DispatchPool;
use crate::engine::{self, EngineConfig, Fault, Trigger};
use crate::error::{Error, PersistenceError, Result};
use crate::executor::{TaskContext, TaskExecutor, TaskOutcome};
use crate::locks::LockManager;
use crate::model::{InstanceFlags, InstanceRecord, VmDescriptor};
use crate::notify::{DestructionListener, SchedulerNotifier, StateChange};
use crate::persistence::Persistence;
use crate::state::State;

/// Collaborators shared by every instance of one home.
pub(crate) struct InstanceServices {
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) dispatch: DispatchPool,
    pub(crate) locks: LockManager,
    pub(crate) notifier: Arc<dyn SchedulerNotifier>,
    pub(crate) events: broadcast::Sender<StateChange>,
    pub(crate) engine: EngineConfig,
}

/// Where the target goes after a soft fault.
#[derive(Debug, Clone, Copy)]
enum Rollback {
    /// Restore the target the request replaced.
    To(State),
    /// Settle on the current state, when it is a legal target.
    ToCurrent,
    Keep,
}

/// One VM instance.
pub struct InstanceResource {
    id: i64,
    record: RwLock<InstanceRecord>,
    services: Arc<InstanceServices>,
    removal: OnceCell<()>,
    destroyed: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn DestructionListener>>>,
}

impl std::fmt::Debug for InstanceResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceResource")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("target", &self.target())
            .finish()
    }
}

impl InstanceResource {
    pub(crate) fn new(record: InstanceRecord, services: Arc<InstanceServices>) -> Self {
        Self {
            id: record.id,
            record: RwLock::new(record),
            services,
            removal: OnceCell::new(),
            destroyed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, InstanceRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InstanceRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.read().state
    }

    pub fn target(&self) -> State {
        self.read().target
    }

    pub fn error_cause(&self) -> Option<String> {
        self.read().error_cause.clone()
    }

    pub fn descriptor(&self) -> VmDescriptor {
        self.read().descriptor.clone()
    }

    /// Consistent copy of the whole record.
    pub fn snapshot(&self) -> InstanceRecord {
        self.read().clone()
    }

    /// Whether destruction has completed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Register a listener called once after destruction completes.
    pub fn add_destruction_listener(&self, listener: Arc<dyn DestructionListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Apply a state reported by the backend (or by recovery) and
    /// re-evaluate.
    ///
    /// While the target is Destroying, only states that still matter for
    /// destruction are accepted; stale completions are dropped silently.
    pub async fn set_state(&self, state: State, cause: Option<String>) -> Result<()> {
        self.complete_task(state, cause, None).await
    }

    /// [`set_state`](Self::set_state) for a finished backend task, recording
    /// what the task assigned once the completion is known not to be stale.
    pub(crate) async fn complete_task(
        &self,
        state: State,
        cause: Option<String>,
        outcome: Option<&TaskOutcome>,
    ) -> Result<()> {
        let _guard = self.services.locks.acquire(self.id).await?;

        if self.is_destroyed() {
            debug!(instance_id = self.id, state = %state, "Ignoring state change for destroyed instance");
            return Ok(());
        }

        if self.target() == State::DESTROYING && !state.accepted_while_destroying() {
            debug!(
                instance_id = self.id,
                state = %state,
                "Dropping stale state change, instance is being destroyed"
            );
            return Ok(());
        }

        if let Some(outcome) = outcome
            && let Err(e) = self.record_outcome(outcome).await
        {
            warn!(instance_id = self.id, error = %e, "Failed to record task result");
        }

        self.write_state(state, cause).await?;
        let outcome = engine::evaluate(self, Trigger::StateChanged).await;
        self.settle(outcome, Rollback::ToCurrent).await
    }

    /// Request a new target state and drive the instance toward it.
    pub async fn set_target_state(&self, target: State) -> Result<()> {
        if !target.is_legal_target() {
            return Err(Error::InvalidTargetState(target));
        }

        let _guard = self.services.locks.acquire(self.id).await?;

        if self.is_destroyed() {
            return Err(Error::DoesNotExist {
                kind: "instance",
                id: self.id,
            });
        }

        let prior = self.target();
        if prior == target {
            debug!(instance_id = self.id, target = %target, "Target unchanged");
            return Ok(());
        }
        if prior == State::DESTROYING {
            return Err(Error::Manage(format!(
                "instance {} is being destroyed",
                self.id
            )));
        }

        self.write_target(target).await?;
        info!(
            instance_id = self.id,
            state = %self.state(),
            from = %prior,
            to = %target,
            "Target state changed"
        );

        let outcome = engine::evaluate(self, Trigger::TargetChanged).await;
        self.settle(outcome, Rollback::To(prior)).await
    }

    /// Re-run the engine for an instance whose state and target disagree,
    /// as after a restart between persisting a target and dispatching its
    /// task. Returns whether an evaluation ran.
    pub(crate) async fn resume(&self) -> Result<bool> {
        let _guard = self.services.locks.acquire(self.id).await?;

        let (state, target) = (self.state(), self.target());
        if self.is_destroyed() || state == target || state.is_corrupted() {
            return Ok(false);
        }

        info!(
            instance_id = self.id,
            state = %state,
            target = %target,
            "Resuming transition"
        );
        let outcome = engine::evaluate(self, Trigger::TargetChanged).await;
        self.settle(outcome, Rollback::ToCurrent).await?;
        Ok(true)
    }

    /// Destroy the instance.
    ///
    /// Drives the target to Destroying, deletes the durable record and marks
    /// the instance DestroySucceeded. Concurrent and repeated calls share
    /// one destruction; a failed attempt may be retried.
    pub async fn remove(&self) -> Result<()> {
        self.removal
            .get_or_try_init(|| self.destroy())
            .await
            .map(|_| ())
    }

    async fn destroy(&self) -> Result<()> {
        let guard = self.services.locks.acquire(self.id).await?;

        info!(instance_id = self.id, state = %self.state(), "Destroying instance");

        if self.target() != State::DESTROYING {
            self.write_target(State::DESTROYING).await?;
        }

        let outcome = engine::evaluate(self, Trigger::TargetChanged).await;
        self.settle(outcome, Rollback::Keep).await?;

        let state = self.state();
        if state != State::DESTROYING {
            warn!(instance_id = self.id, state = %state, "Instance could not be destroyed");
            return Err(Error::Manage(format!(
                "instance {} could not be destroyed (state {})",
                self.id, state
            )));
        }

        match self.services.persistence.remove(self.id).await {
            Ok(()) | Err(PersistenceError::NotFound(_)) => {}
            Err(e) => {
                error!(instance_id = self.id, error = %e, "Failed to delete instance record");
                return Err(e.into());
            }
        }

        self.write().state = State::DESTROY_SUCCEEDED;
        self.destroyed.store(true, Ordering::SeqCst);
        self.announce(State::DESTROY_SUCCEEDED, None);

        drop(guard);
        self.services.locks.forget(self.id);

        let listeners: Vec<Arc<dyn DestructionListener>> = self
            .listeners
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener.instance_destroyed(self.id);
        }

        info!(instance_id = self.id, "Instance destroyed");
        Ok(())
    }

    /// Record what a backend task assigned (hostname, network). The caller
    /// holds the instance lock.
    async fn record_outcome(&self, outcome: &TaskOutcome) -> Result<()> {
        let mut descriptor = self.descriptor();
        let mut changed = false;
        if let Some(hostname) = &outcome.assigned_hostname
            && descriptor.assigned_hostname.as_ref() != Some(hostname)
        {
            descriptor.assigned_hostname = Some(hostname.clone());
            changed = true;
        }
        if let Some(network) = &outcome.assigned_network
            && descriptor.assigned_network.as_ref() != Some(network)
        {
            descriptor.assigned_network = Some(network.clone());
            changed = true;
        }
        if !changed {
            return Ok(());
        }

        if let Err(e) = self
            .services
            .persistence
            .update_descriptor(self.id, &descriptor)
            .await
        {
            error!(instance_id = self.id, error = %e, "Failed to persist descriptor");
            return Err(e.into());
        }
        self.write().descriptor = descriptor;
        Ok(())
    }

    pub async fn set_ops_enabled(&self, enabled: bool) -> Result<()> {
        self.update_flags(|flags| flags.ops_enabled = enabled).await
    }

    pub async fn set_vmm_access_ok(&self, ok: bool) -> Result<()> {
        self.update_flags(|flags| flags.vmm_access_ok = ok).await
    }

    async fn update_flags(&self, change: impl FnOnce(&mut InstanceFlags)) -> Result<()> {
        let _guard = self.services.locks.acquire(self.id).await?;
        let mut flags = self.read().flags;
        change(&mut flags);

        if let Err(e) = self.services.persistence.update_flags(self.id, &flags).await {
            error!(instance_id = self.id, error = %e, "Failed to persist flags");
            return Err(e.into());
        }
        self.write().flags = flags;
        Ok(())
    }

    /// Set or clear the deadline after which the sweeper destroys the instance.
    pub async fn set_termination_time(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        let _guard = self.services.locks.acquire(self.id).await?;

        if let Err(e) = self
            .services
            .persistence
            .set_termination_time(self.id, at)
            .await
        {
            error!(instance_id = self.id, error = %e, "Failed to persist termination time");
            return Err(e.into());
        }
        self.write().termination_time = at;
        Ok(())
    }

    pub(crate) fn services(&self) -> &InstanceServices {
        &self.services
    }

    pub(crate) fn task_context(&self, notify_state: State) -> TaskContext {
        let record = self.read();
        TaskContext {
            task_id: Uuid::new_v4(),
            instance_id: record.id,
            name: record.descriptor.name.clone(),
            descriptor: record.descriptor.clone(),
            group_id: record.group_id,
            ensemble_id: record.ensemble_id,
            launch_index: record.launch_index,
            notify_state,
        }
    }

    /// Persist and apply a new current state without re-evaluating.
    /// The caller holds the instance lock.
    pub(crate) async fn write_state(&self, state: State, cause: Option<String>) -> Result<()> {
        if let Err(e) = self
            .services
            .persistence
            .set_state(self.id, state, cause.as_deref())
            .await
        {
            error!(
                instance_id = self.id,
                state = %state,
                error = %e,
                "Failed to persist state change"
            );
            return Err(e.into());
        }

        let previous = {
            let mut record = self.write();
            let previous = record.state;
            record.state = state;
            record.error_cause = cause.clone();
            previous
        };

        debug!(instance_id = self.id, from = %previous, to = %state, "State changed");
        if state.is_corrupted() {
            warn!(
                instance_id = self.id,
                state = %state,
                cause = cause.as_deref().unwrap_or(""),
                "Instance corrupted"
            );
        }

        self.announce(state, cause);
        Ok(())
    }

    /// Persist and apply a new target without re-evaluating.
    /// The caller holds the instance lock.
    pub(crate) async fn write_target(&self, target: State) -> Result<()> {
        if let Err(e) = self
            .services
            .persistence
            .set_target_state(self.id, target)
            .await
        {
            error!(
                instance_id = self.id,
                target = %target,
                error = %e,
                "Failed to persist target state"
            );
            return Err(e.into());
        }
        self.write().target = target;
        Ok(())
    }

    fn announce(&self, state: State, error_cause: Option<String>) {
        self.services.notifier.state_notification(self.id, state);

        if state.notifies_clients() {
            // No subscribers is not an error.
            let _ = self.services.events.send(StateChange {
                instance_id: self.id,
                state,
                error_cause,
                at: Utc::now(),
            });
        }
    }

    /// Interpret an evaluation outcome.
    async fn settle(&self, outcome: std::result::Result<(), Fault>, rollback: Rollback) -> Result<()> {
        let fault = match outcome {
            Ok(()) => return Ok(()),
            Err(fault) => fault,
        };

        match fault {
            Fault::Soft(err) => {
                let restore = match rollback {
                    Rollback::To(prior) => Some(prior),
                    Rollback::ToCurrent => {
                        let current = self.state();
                        (current.is_legal_target() && current != self.target()).then_some(current)
                    }
                    Rollback::Keep => None,
                };
                if let Some(target) = restore
                    && let Err(e) = self.write_target(target).await
                {
                    error!(instance_id = self.id, error = %e, "Failed to roll back target state");
                }
                warn!(
                    instance_id = self.id,
                    state = %self.state(),
                    target = %self.target(),
                    error = %err,
                    "Transition refused"
                );
                Err(err)
            }
            Fault::Corrupting { at, cause, error } => {
                self.write_state(at.corrupted(), Some(cause)).await?;
                Err(error)
            }
            Fault::FatalConfig { at, message } => {
                error!(
                    instance_id = self.id,
                    state = %at,
                    error = %message,
                    "Configuration error during transition"
                );
                let state = at.corrupted();
                self.write_state(state, Some(message.clone())).await?;
                Err(Error::Corrupted {
                    instance_id: self.id,
                    state,
                    cause: message,
                })
            }
            Fault::Failed(err) => Err(err),
        }
    }
}
