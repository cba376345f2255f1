// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State transition engine.
//!
//! [`evaluate`] runs under the instance lock after every state or target
//! change. It walks an ordered chain of rules; the first applicable rule
//! decides what happens next:
//!
//! | Rule | Fires when | Effect |
//! |------|------------|--------|
//! | corrupted | current or target corrupted, DestroyFailed target | refuse, mark, or halt |
//! | remove | target is Destroying | run the matching cancel task, then force Destroying |
//! | stage in | Unstaged toward Unpropagated or beyond | set Unpropagated, continue at propagate |
//! | propagate | toward Propagated or beyond, not yet propagating | dispatch propagate (or a combined task) |
//! | start | Propagated/Paused/Serialized/Started toward Started/Reboot/Paused | start, unpause, reboot ... |
//! | shutdown | Started/Paused toward a stopped state | pause, shutdown, serialize |
//! | ready for transport | toward ReadyForTransport/StagedOut | dispatch unpropagation |
//! | stage out | ReadyForTransport | acknowledge |
//!
//! A rule may apply an immediate state change and continue at a later rule,
//! so one request can cascade through several decisions without a backend
//! round trip. Rules report problems as a [`Fault`]; the instance resource
//! interprets faults in one place.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::executor::TaskKind;
use crate::instance::InstanceResource;
use crate::state::{Phase, State};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether images may be copied back off backend nodes.
    pub unpropagate_enabled: bool,
    /// Upper bound on the remove rule's wait for its cancel task. Unbounded
    /// when `None`; on expiry the instance becomes DestroyFailed.
    pub cancel_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unpropagate_enabled: true,
            cancel_timeout: None,
        }
    }
}

/// What caused an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    StateChanged,
    TargetChanged,
}

/// Handler failures, by severity.
#[derive(Debug)]
pub(crate) enum Fault {
    /// Nothing changed; the target is rolled back.
    Soft(Error),
    /// The instance becomes `at.corrupted()` with `cause`; `error` is returned.
    Corrupting {
        at: State,
        cause: String,
        error: Error,
    },
    /// A capability the configuration should have ruled out was needed.
    /// Logged as a configuration error, then treated as corrupting.
    FatalConfig { at: State, message: String },
    /// Persistence or locking failed; propagated unchanged.
    Failed(Error),
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        Fault::Failed(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Corrupted,
    Remove,
    StageIn,
    Propagate,
    Start,
    Shutdown,
    ReadyForTransport,
    StageOut,
}

const CHAIN: [Rule; 8] = [
    Rule::Corrupted,
    Rule::Remove,
    Rule::StageIn,
    Rule::Propagate,
    Rule::Start,
    Rule::Shutdown,
    Rule::ReadyForTransport,
    Rule::StageOut,
];

enum Step {
    NotApplicable,
    Done,
    ContinueAt(Rule),
}

type StepResult = Result<Step, Fault>;

/// Run the rule chain once. The caller holds the instance lock.
pub(crate) async fn evaluate(inst: &InstanceResource, trigger: Trigger) -> Result<(), Fault> {
    let mut next = 0;
    while let Some(rule) = CHAIN.get(next).copied() {
        let step = match rule {
            Rule::Corrupted => corrupted(inst, trigger).await?,
            Rule::Remove => remove(inst).await?,
            Rule::StageIn => stage_in(inst).await?,
            Rule::Propagate => propagate(inst).await?,
            Rule::Start => start(inst).await?,
            Rule::Shutdown => shutdown(inst).await?,
            Rule::ReadyForTransport => ready_for_transport(inst).await?,
            Rule::StageOut => stage_out(inst).await?,
        };

        match step {
            Step::NotApplicable => next += 1,
            Step::Done => break,
            Step::ContinueAt(rule) => {
                debug!(instance_id = inst.id(), rule = ?rule, "Continuing evaluation");
                next = rule as usize;
            }
        }
    }
    Ok(())
}

async fn corrupted(inst: &InstanceResource, trigger: Trigger) -> StepResult {
    let (current, target) = (inst.state(), inst.target());

    if current.is_corrupted() {
        if target == State::DESTROYING {
            return Ok(Step::NotApplicable);
        }
        if target == current || trigger == Trigger::StateChanged {
            debug!(instance_id = inst.id(), state = %current, "Instance is corrupted, halting");
            return Ok(Step::Done);
        }
        return Err(Fault::Soft(Error::Corrupted {
            instance_id: inst.id(),
            state: current,
            cause: inst
                .error_cause()
                .unwrap_or_else(|| "no cause recorded".to_string()),
        }));
    }

    if target.is_corrupted() {
        inst.write_state(target, Some("corrupted on request".to_string()))
            .await?;
        return Ok(Step::Done);
    }

    if target == State::DESTROY_FAILED {
        if current != State::DESTROY_FAILED {
            inst.write_state(State::DESTROY_FAILED, None).await?;
        }
        return Ok(Step::Done);
    }

    if (current == State::DESTROY_SUCCEEDED || current == State::DESTROY_FAILED)
        && target != State::DESTROYING
    {
        return Ok(Step::Done);
    }

    Ok(Step::NotApplicable)
}

/// Cancel task and cancelling phase for an instance being destroyed in
/// `state`. Corrupted states use the band of the phase they were reaching.
fn cancel_for(state: State) -> Option<(TaskKind, Phase)> {
    let Some(phase) = state.underlying() else {
        return Some((TaskKind::CancelAllAtVmm, Phase::CancellingAtVmm));
    };

    match phase {
        Phase::Unpropagated => Some((TaskKind::CancelUnpropagated, Phase::CancellingUnpropagated)),
        Phase::Propagating => Some((TaskKind::CancelPropagating, Phase::CancellingPropagating)),
        Phase::PropagatingToStart => Some((
            TaskKind::CancelPropagatingToStart,
            Phase::CancellingPropagatingToStart,
        )),
        Phase::PropagatingToPause => Some((
            TaskKind::CancelPropagatingToPause,
            Phase::CancellingPropagatingToPause,
        )),
        Phase::Propagated
        | Phase::Starting
        | Phase::Started
        | Phase::Serializing
        | Phase::Serialized
        | Phase::Pausing
        | Phase::Paused
        | Phase::Reboot
        | Phase::ShuttingDown => Some((TaskKind::CancelAllAtVmm, Phase::CancellingAtVmm)),
        Phase::ReadyingForTransport => Some((
            TaskKind::CancelReadyingForTransport,
            Phase::CancellingReadyingForTransport,
        )),
        Phase::ReadyForTransport => Some((
            TaskKind::CancelReadyForTransport,
            Phase::CancellingReadyForTransport,
        )),
        Phase::StagingOut => Some((TaskKind::CancelStagingOut, Phase::CancellingStagingOut)),
        Phase::StagedOut => Some((TaskKind::CancelStagedOut, Phase::CancellingStagedOut)),
        _ => None,
    }
}

/// Cancel task that was running when an instance was left in `cancelling`.
fn interrupted_cancel(cancelling: Phase) -> Option<TaskKind> {
    match cancelling {
        Phase::CancellingUnpropagated => Some(TaskKind::CancelUnpropagated),
        Phase::CancellingPropagating => Some(TaskKind::CancelPropagating),
        Phase::CancellingPropagatingToStart => Some(TaskKind::CancelPropagatingToStart),
        Phase::CancellingPropagatingToPause => Some(TaskKind::CancelPropagatingToPause),
        Phase::CancellingAtVmm => Some(TaskKind::CancelAllAtVmm),
        Phase::CancellingReadyingForTransport => Some(TaskKind::CancelReadyingForTransport),
        Phase::CancellingReadyForTransport => Some(TaskKind::CancelReadyForTransport),
        Phase::CancellingStagingOut => Some(TaskKind::CancelStagingOut),
        Phase::CancellingStagedOut => Some(TaskKind::CancelStagedOut),
        _ => None,
    }
}

async fn remove(inst: &InstanceResource) -> StepResult {
    if inst.target() != State::DESTROYING {
        return Ok(Step::NotApplicable);
    }

    let current = inst.state();
    if current == State::DESTROYING {
        return Ok(Step::Done);
    }

    // The remove rule holds the lock for the whole cancel wait, so a
    // cancelling state seen here was loaded from a previous process.
    let cancel = match current.phase() {
        Some(phase) if phase.is_cancelling() => {
            warn!(
                instance_id = inst.id(),
                state = %current,
                "Resuming cancellation interrupted by restart"
            );
            interrupted_cancel(phase).map(|task| (task, phase))
        }
        _ => cancel_for(current),
    };

    if let Some((task, cancelling)) = cancel {
        if current != State::At(cancelling) {
            inst.write_state(State::At(cancelling), None).await?;
        }

        if inst.services().executor.implements(task) {
            if let Err(waited) = run_cancel(inst, task).await {
                let cause = format!("{} did not finish within {:?}", task, waited);
                inst.write_state(State::DESTROY_FAILED, Some(cause)).await?;
                return Ok(Step::Done);
            }
        } else {
            debug!(instance_id = inst.id(), task = %task, "Cancel task not implemented, skipping");
        }
    }

    inst.write_state(State::DESTROYING, None).await?;
    Ok(Step::Done)
}

/// Run a cancel task and wait for it. The outcome does not matter; only
/// running out of the configured wait is reported, as `Err(limit)`.
async fn run_cancel(inst: &InstanceResource, task: TaskKind) -> Result<(), Duration> {
    let services = inst.services();
    let ctx = inst.task_context(State::DESTROYING);
    let run = services.executor.execute(task, &ctx);

    info!(instance_id = inst.id(), task = %task, task_id = %ctx.task_id, "Running cancel task");

    let result = match services.engine.cancel_timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(instance_id = inst.id(), task = %task, "Cancel task timed out");
                return Err(limit);
            }
        },
        None => run.await,
    };

    if let Err(e) = result {
        warn!(
            instance_id = inst.id(),
            task = %task,
            error = %e,
            "Cancel task failed, destroying anyway"
        );
    }
    Ok(())
}

async fn stage_in(inst: &InstanceResource) -> StepResult {
    if inst.state() != State::UNSTAGED || inst.target() < State::UNPROPAGATED {
        return Ok(Step::NotApplicable);
    }

    inst.write_state(State::UNPROPAGATED, None).await?;
    Ok(Step::ContinueAt(Rule::Propagate))
}

async fn propagate(inst: &InstanceResource) -> StepResult {
    let (current, target) = (inst.state(), inst.target());
    if target < State::PROPAGATED || current >= State::At(Phase::Propagating) {
        return Ok(Step::NotApplicable);
    }

    if !inst.descriptor().propagate_required {
        inst.write_state(State::PROPAGATED, None).await?;
        return Ok(Step::ContinueAt(Rule::Start));
    }

    let executor = &inst.services().executor;
    let wants_start = target == State::STARTED || target == State::REBOOT;

    let (task, in_flight, notify) =
        if wants_start && executor.implements(TaskKind::PropagateAndStart) {
            (TaskKind::PropagateAndStart, Phase::PropagatingToStart, State::STARTED)
        } else if target == State::PAUSED && executor.implements(TaskKind::PropagateAndPause) {
            (TaskKind::PropagateAndPause, Phase::PropagatingToPause, State::PAUSED)
        } else {
            (TaskKind::Propagate, Phase::Propagating, State::PROPAGATED)
        };

    if !executor.implements(task) {
        return Err(Fault::Corrupting {
            at: State::At(in_flight),
            cause: format!("backend does not implement {}", task),
            error: Error::TaskNotImplemented {
                task,
                instance_id: inst.id(),
            },
        });
    }

    if target == State::REBOOT && task == TaskKind::PropagateAndStart {
        inst.write_target(State::STARTED).await?;
    }

    dispatch(inst, task, in_flight, notify).await
}

async fn start(inst: &InstanceResource) -> StepResult {
    let (current, target) = (inst.state(), inst.target());
    let Some(phase) = current.phase() else {
        return Ok(Step::NotApplicable);
    };
    if target != State::STARTED && target != State::REBOOT && target != State::PAUSED {
        return Ok(Step::NotApplicable);
    }

    let (task, in_flight, notify) = match phase {
        Phase::Started if target == State::REBOOT => {
            (TaskKind::Reboot, Phase::Reboot, State::STARTED)
        }
        Phase::Started if target == State::STARTED => return Ok(Step::Done),
        Phase::Paused if target == State::PAUSED => return Ok(Step::Done),
        Phase::Paused => (TaskKind::Unpause, Phase::Starting, State::STARTED),
        Phase::Propagated if target == State::PAUSED => {
            (TaskKind::StartPaused, Phase::Starting, State::PAUSED)
        }
        Phase::Propagated => (TaskKind::Start, Phase::Starting, State::STARTED),
        Phase::Serialized => (TaskKind::Unserialize, Phase::Starting, State::STARTED),
        _ => return Ok(Step::NotApplicable),
    };

    if !inst.services().executor.implements(task) {
        return Err(Fault::Soft(Error::TaskNotImplemented {
            task,
            instance_id: inst.id(),
        }));
    }

    // A reboot is a one-shot request; the instance then just stays started.
    if target == State::REBOOT {
        inst.write_target(State::STARTED).await?;
    }

    dispatch(inst, task, in_flight, notify).await
}

async fn shutdown(inst: &InstanceResource) -> StepResult {
    let (current, target) = (inst.state(), inst.target());
    if current != State::STARTED && current != State::PAUSED {
        return Ok(Step::NotApplicable);
    }
    if ![
        State::PROPAGATED,
        State::SERIALIZED,
        State::PAUSED,
        State::READY_FOR_TRANSPORT,
        State::STAGED_OUT,
    ]
    .contains(&target)
    {
        return Ok(Step::NotApplicable);
    }

    let (task, in_flight, notify) = if target == State::PAUSED {
        if current == State::PAUSED {
            return Ok(Step::Done);
        }
        (TaskKind::Pause, Phase::Pausing, State::PAUSED)
    } else if target == State::SERIALIZED {
        (TaskKind::ShutdownSerialize, Phase::Serializing, State::SERIALIZED)
    } else {
        (TaskKind::ShutdownNormal, Phase::ShuttingDown, State::PROPAGATED)
    };

    if !inst.services().executor.implements(task) {
        return Err(Fault::Soft(Error::TaskNotImplemented {
            task,
            instance_id: inst.id(),
        }));
    }

    dispatch(inst, task, in_flight, notify).await
}

async fn ready_for_transport(inst: &InstanceResource) -> StepResult {
    let (current, target) = (inst.state(), inst.target());
    let readying = State::At(Phase::ReadyingForTransport);

    if target != State::READY_FOR_TRANSPORT && target != State::STAGED_OUT {
        return Ok(Step::NotApplicable);
    }
    if current != State::PROPAGATED && current != State::SERIALIZED && current != readying {
        return Ok(Step::NotApplicable);
    }

    if !inst.descriptor().unpropagate_required {
        inst.write_state(State::READY_FOR_TRANSPORT, None).await?;
        return Ok(Step::ContinueAt(Rule::StageOut));
    }

    if !inst.services().engine.unpropagate_enabled {
        return Err(Fault::FatalConfig {
            at: readying,
            message: "unpropagation is required but disabled by configuration".to_string(),
        });
    }

    if !inst.services().executor.implements(TaskKind::ReadyForTransport) {
        return Err(Fault::Corrupting {
            at: readying,
            cause: format!("backend does not implement {}", TaskKind::ReadyForTransport),
            error: Error::TaskNotImplemented {
                task: TaskKind::ReadyForTransport,
                instance_id: inst.id(),
            },
        });
    }

    if current == readying {
        return Ok(Step::Done);
    }

    dispatch(
        inst,
        TaskKind::ReadyForTransport,
        Phase::ReadyingForTransport,
        State::READY_FOR_TRANSPORT,
    )
    .await
}

async fn stage_out(inst: &InstanceResource) -> StepResult {
    let (current, target) = (inst.state(), inst.target());
    if current != State::READY_FOR_TRANSPORT
        || (target != State::READY_FOR_TRANSPORT && target != State::STAGED_OUT)
    {
        return Ok(Step::NotApplicable);
    }

    if target == State::STAGED_OUT {
        debug!(
            instance_id = inst.id(),
            "Staging out is not performed, instance stays ReadyForTransport"
        );
    }
    Ok(Step::Done)
}

/// Enter `in_flight` and queue `task`; its completion reports `notify`.
async fn dispatch(
    inst: &InstanceResource,
    task: TaskKind,
    in_flight: Phase,
    notify: State,
) -> StepResult {
    let pool = &inst.services().dispatch;
    // Nothing can run once the pool drains; keep the last stable state so
    // recovery picks the instance up again.
    if pool.is_shut_down() {
        return Err(Fault::Failed(halted(inst, task)));
    }

    let (prior, prior_cause) = (inst.state(), inst.error_cause());
    inst.write_state(State::At(in_flight), None).await?;

    let ctx = inst.task_context(notify);
    info!(
        instance_id = inst.id(),
        task = %task,
        task_id = %ctx.task_id,
        notify = %notify,
        "Dispatching task"
    );

    if let Err(e) = pool.submit(task, ctx) {
        if pool.is_shut_down() {
            inst.write_state(prior, prior_cause).await?;
            return Err(Fault::Failed(halted(inst, task)));
        }
        return Err(Fault::Corrupting {
            at: State::At(in_flight),
            cause: format!("could not dispatch {}: {}", task, e),
            error: e,
        });
    }

    Ok(Step::Done)
}

fn halted(inst: &InstanceResource, task: TaskKind) -> Error {
    info!(
        instance_id = inst.id(),
        task = %task,
        state = %inst.state(),
        "Dispatch pool is shut down, leaving instance for recovery"
    );
    Error::Manage(format!("could not dispatch {}: dispatch pool is shut down", task))
}
