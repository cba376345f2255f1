// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance, group and resource-pool records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::State;

/// A disk partition attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Source image URI.
    pub image: String,
    /// Device or mount point inside the guest.
    pub mount_as: String,
    /// Whether this partition holds the root filesystem.
    pub root_file: bool,
    /// Whether the guest may write to it.
    pub read_write: bool,
}

/// Description of the virtual machine behind an instance.
///
/// Created once at instantiation; task results fill in the assigned
/// hostname and network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub name: String,
    pub memory_mb: u32,
    pub vcpus: u32,
    #[serde(default)]
    pub partitions: Vec<Partition>,
    /// Network requested by the client.
    pub requested_network: Option<String>,
    pub assigned_hostname: Option<String>,
    pub assigned_network: Option<String>,
    /// Images must be propagated to the backend node before starting.
    pub propagate_required: bool,
    /// Images must be copied back off the node before transport.
    pub unpropagate_required: bool,
}

impl VmDescriptor {
    /// A descriptor with the given name and sizing, requiring propagation
    /// but not unpropagation.
    pub fn new(name: impl Into<String>, memory_mb: u32, vcpus: u32) -> Self {
        Self {
            name: name.into(),
            memory_mb,
            vcpus,
            partitions: Vec::new(),
            requested_network: None,
            assigned_hostname: None,
            assigned_network: None,
            propagate_required: true,
            unpropagate_required: false,
        }
    }
}

/// Durable record of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: i64,
    pub group_id: Option<i64>,
    pub ensemble_id: Option<i64>,
    /// Position within the group request that created it.
    pub launch_index: i32,
    /// Identity of the client that created the instance.
    pub creator: String,
    pub state: State,
    pub target: State,
    pub descriptor: VmDescriptor,
    pub start_time: Option<DateTime<Utc>>,
    /// Absolute deadline after which the sweeper destroys the instance.
    pub termination_time: Option<DateTime<Utc>>,
    pub flags: InstanceFlags,
    /// Why the instance became corrupted, when it is.
    pub error_cause: Option<String>,
}

/// Operational flags of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFlags {
    pub ops_enabled: bool,
    pub vmm_access_ok: bool,
    pub last_in_group: bool,
    pub part_of_group_request: bool,
}

impl Default for InstanceFlags {
    fn default() -> Self {
        Self {
            ops_enabled: true,
            vmm_access_ok: true,
            last_in_group: false,
            part_of_group_request: false,
        }
    }
}

/// Kind of a collection of instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Instances created by one multi-instance request.
    Group,
    /// Instances that must be co-scheduled.
    Ensemble,
}

impl GroupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupKind::Group => "group",
            GroupKind::Ensemble => "ensemble",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<GroupKind> {
        match s {
            "group" => Some(GroupKind::Group),
            "ensemble" => Some(GroupKind::Ensemble),
            _ => None,
        }
    }
}

/// A group or ensemble. Membership is looked up through the instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: i64,
    pub kind: GroupKind,
    pub creator: String,
}

/// Instance with a termination deadline, as seen by the sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepableEntry {
    pub id: i64,
    pub termination_time: Option<DateTime<Utc>>,
}

impl SweepableEntry {
    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.termination_time.is_some_and(|t| t <= now)
    }
}

/// Capacity record for a backend node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePoolEntry {
    pub hostname: String,
    pub pool: String,
    /// Networks reachable from this node.
    pub networks: Vec<String>,
    pub max_memory_mb: i64,
    pub available_memory_mb: i64,
    pub preemptable_memory_mb: i64,
    pub active: bool,
}
