// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle state space.
//!
//! States are totally ordered. The ordinary lifecycle phases come first, in
//! the order an instance walks through them, followed by the corrupted band:
//! [`State::CORRUPTED`] is the threshold and `Corrupted(Some(x))` means the
//! instance became corrupted while trying to reach `x`. The derived `Ord` on
//! [`State`] encodes exactly this ordering, so `state >= State::CORRUPTED`
//! is the corruption test.
//!
//! Durable codes are stable: phases use `1..=32`, the corrupted threshold is
//! `100` and a corrupted phase is `100 + code(phase)`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An ordinary lifecycle phase, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unstaged,
    StagingIn,
    Unpropagated,
    Propagating,
    PropagatingToStart,
    PropagatingToPause,
    Propagated,
    Starting,
    Started,
    Serializing,
    Serialized,
    Pausing,
    Paused,
    Reboot,
    ShuttingDown,
    ReadyingForTransport,
    ReadyForTransport,
    StagingOut,
    StagedOut,
    CancellingStagingIn,
    CancellingUnpropagated,
    CancellingPropagating,
    CancellingPropagatingToStart,
    CancellingPropagatingToPause,
    CancellingAtVmm,
    CancellingReadyingForTransport,
    CancellingReadyForTransport,
    CancellingStagingOut,
    CancellingStagedOut,
    Destroying,
    DestroySucceeded,
    DestroyFailed,
}

impl Phase {
    /// Every phase in lifecycle order.
    pub const ALL: [Phase; 32] = [
        Phase::Unstaged,
        Phase::StagingIn,
        Phase::Unpropagated,
        Phase::Propagating,
        Phase::PropagatingToStart,
        Phase::PropagatingToPause,
        Phase::Propagated,
        Phase::Starting,
        Phase::Started,
        Phase::Serializing,
        Phase::Serialized,
        Phase::Pausing,
        Phase::Paused,
        Phase::Reboot,
        Phase::ShuttingDown,
        Phase::ReadyingForTransport,
        Phase::ReadyForTransport,
        Phase::StagingOut,
        Phase::StagedOut,
        Phase::CancellingStagingIn,
        Phase::CancellingUnpropagated,
        Phase::CancellingPropagating,
        Phase::CancellingPropagatingToStart,
        Phase::CancellingPropagatingToPause,
        Phase::CancellingAtVmm,
        Phase::CancellingReadyingForTransport,
        Phase::CancellingReadyForTransport,
        Phase::CancellingStagingOut,
        Phase::CancellingStagedOut,
        Phase::Destroying,
        Phase::DestroySucceeded,
        Phase::DestroyFailed,
    ];

    /// Durable code of this phase (`1..=32`).
    pub fn code(self) -> i32 {
        self as i32 + 1
    }

    /// Inverse of [`Phase::code`].
    pub fn from_code(code: i32) -> Option<Phase> {
        usize::try_from(code - 1)
            .ok()
            .and_then(|idx| Phase::ALL.get(idx).copied())
    }

    /// Stable name used in logs and notifications.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Unstaged => "Unstaged",
            Phase::StagingIn => "StagingIn",
            Phase::Unpropagated => "Unpropagated",
            Phase::Propagating => "Propagating",
            Phase::PropagatingToStart => "PropagatingToStart",
            Phase::PropagatingToPause => "PropagatingToPause",
            Phase::Propagated => "Propagated",
            Phase::Starting => "Starting",
            Phase::Started => "Started",
            Phase::Serializing => "Serializing",
            Phase::Serialized => "Serialized",
            Phase::Pausing => "Pausing",
            Phase::Paused => "Paused",
            Phase::Reboot => "Reboot",
            Phase::ShuttingDown => "ShuttingDown",
            Phase::ReadyingForTransport => "ReadyingForTransport",
            Phase::ReadyForTransport => "ReadyForTransport",
            Phase::StagingOut => "StagingOut",
            Phase::StagedOut => "StagedOut",
            Phase::CancellingStagingIn => "CancellingStagingIn",
            Phase::CancellingUnpropagated => "CancellingUnpropagated",
            Phase::CancellingPropagating => "CancellingPropagating",
            Phase::CancellingPropagatingToStart => "CancellingPropagatingToStart",
            Phase::CancellingPropagatingToPause => "CancellingPropagatingToPause",
            Phase::CancellingAtVmm => "CancellingAtVmm",
            Phase::CancellingReadyingForTransport => "CancellingReadyingForTransport",
            Phase::CancellingReadyForTransport => "CancellingReadyForTransport",
            Phase::CancellingStagingOut => "CancellingStagingOut",
            Phase::CancellingStagedOut => "CancellingStagedOut",
            Phase::Destroying => "Destroying",
            Phase::DestroySucceeded => "DestroySucceeded",
            Phase::DestroyFailed => "DestroyFailed",
        }
    }

    /// Whether this is one of the `Cancelling*` phases.
    pub fn is_cancelling(self) -> bool {
        (Phase::CancellingStagingIn..=Phase::CancellingStagedOut).contains(&self)
    }

    /// Whether a backend task is (or was) running on behalf of the instance.
    ///
    /// A process restart loses the task, so recovery treats these as
    /// interrupted.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Phase::StagingIn
                | Phase::Propagating
                | Phase::PropagatingToStart
                | Phase::PropagatingToPause
                | Phase::Starting
                | Phase::Serializing
                | Phase::Pausing
                | Phase::Reboot
                | Phase::ShuttingDown
                | Phase::ReadyingForTransport
                | Phase::StagingOut
        ) || self.is_cancelling()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current or target state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// An ordinary lifecycle phase.
    At(Phase),
    /// Corrupted; `Some(phase)` records the phase that was being reached.
    Corrupted(Option<Phase>),
}

impl State {
    /// The corruption threshold (`CorruptedGeneric`).
    pub const CORRUPTED: State = State::Corrupted(None);

    pub const UNSTAGED: State = State::At(Phase::Unstaged);
    pub const UNPROPAGATED: State = State::At(Phase::Unpropagated);
    pub const PROPAGATED: State = State::At(Phase::Propagated);
    pub const STARTED: State = State::At(Phase::Started);
    pub const SERIALIZED: State = State::At(Phase::Serialized);
    pub const PAUSED: State = State::At(Phase::Paused);
    pub const REBOOT: State = State::At(Phase::Reboot);
    pub const READY_FOR_TRANSPORT: State = State::At(Phase::ReadyForTransport);
    pub const STAGED_OUT: State = State::At(Phase::StagedOut);
    pub const DESTROYING: State = State::At(Phase::Destroying);
    pub const DESTROY_SUCCEEDED: State = State::At(Phase::DestroySucceeded);
    pub const DESTROY_FAILED: State = State::At(Phase::DestroyFailed);

    /// Whether the state is in the corrupted band.
    pub fn is_corrupted(self) -> bool {
        self >= State::CORRUPTED
    }

    /// The ordinary phase, if not corrupted.
    pub fn phase(self) -> Option<Phase> {
        match self {
            State::At(phase) => Some(phase),
            State::Corrupted(_) => None,
        }
    }

    /// The phase this state is about: the phase itself, or the phase a
    /// corrupted state was reaching.
    pub fn underlying(self) -> Option<Phase> {
        match self {
            State::At(phase) | State::Corrupted(Some(phase)) => Some(phase),
            State::Corrupted(None) => None,
        }
    }

    /// Corrupted counterpart ("corrupted while reaching this state").
    ///
    /// Already corrupted states are returned unchanged.
    pub fn corrupted(self) -> State {
        match self {
            State::At(phase) => State::Corrupted(Some(phase)),
            corrupted => corrupted,
        }
    }

    /// Durable integer code.
    pub fn code(self) -> i32 {
        match self {
            State::At(phase) => phase.code(),
            State::Corrupted(None) => 100,
            State::Corrupted(Some(phase)) => 100 + phase.code(),
        }
    }

    /// Inverse of [`State::code`].
    pub fn from_code(code: i32) -> Option<State> {
        match code {
            100 => Some(State::CORRUPTED),
            c if c > 100 => Phase::from_code(c - 100).map(|p| State::Corrupted(Some(p))),
            c => Phase::from_code(c).map(State::At),
        }
    }

    /// Whether clients may request this state as a target.
    ///
    /// Transitional, cancelling and destroy-outcome phases are never legal
    /// targets; any corrupted state is.
    pub fn is_legal_target(self) -> bool {
        match self {
            State::Corrupted(_) => true,
            State::At(phase) => matches!(
                phase,
                Phase::Unstaged
                    | Phase::Unpropagated
                    | Phase::Propagated
                    | Phase::Started
                    | Phase::Serialized
                    | Phase::Paused
                    | Phase::Reboot
                    | Phase::ReadyForTransport
                    | Phase::StagedOut
                    | Phase::Destroying
                    | Phase::DestroyFailed
            ),
        }
    }

    /// Whether reaching this state publishes a client-visible notification.
    pub fn notifies_clients(self) -> bool {
        match self {
            State::Corrupted(_) => true,
            State::At(phase) => matches!(
                phase,
                Phase::Unpropagated
                    | Phase::Propagated
                    | Phase::Started
                    | Phase::Serialized
                    | Phase::Paused
                    | Phase::ReadyForTransport
                    | Phase::StagedOut
                    | Phase::DestroySucceeded
                    | Phase::DestroyFailed
            ),
        }
    }

    /// States still accepted from the backend once the target is Destroying.
    ///
    /// Everything else arriving after destruction was requested is a stale
    /// completion and is dropped.
    pub fn accepted_while_destroying(self) -> bool {
        matches!(
            self,
            State::At(
                Phase::Unpropagated
                    | Phase::Propagated
                    | Phase::Started
                    | Phase::Paused
                    | Phase::ReadyingForTransport
                    | Phase::ReadyForTransport
                    | Phase::DestroySucceeded
                    | Phase::DestroyFailed
                    | Phase::StagingOut
            )
        )
    }
}

impl From<Phase> for State {
    fn from(phase: Phase) -> Self {
        State::At(phase)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::At(phase) => f.write_str(phase.as_str()),
            State::Corrupted(None) => f.write_str("Corrupted"),
            State::Corrupted(Some(phase)) => write!(f, "Corrupted+{}", phase),
        }
    }
}
