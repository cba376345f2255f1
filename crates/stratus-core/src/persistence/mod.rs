// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence port for instance records.
//!
//! Every state and target change is written here before it is applied in
//! memory, so a restarted manager can rebuild its instances from the store.
//! Each call is one logical update.
//!
//! Two backends ship with the crate:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`MemoryPersistence`] | tests and throwaway deployments |
//! | [`SqlitePersistence`] | durable single-node deployments |

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::model::{
    GroupKind, GroupRecord, InstanceFlags, InstanceRecord, ResourcePoolEntry, SweepableEntry,
    VmDescriptor,
};
use crate::state::State;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryPersistence;
pub use sqlite::SqlitePersistence;

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Durable store for instances, groups and resource-pool entries.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Allocate the next instance id (monotonic, starting at 1).
    async fn next_instance_id(&self) -> Result<i64>;

    /// Allocate the next group or ensemble id.
    async fn next_group_id(&self) -> Result<i64>;

    /// Store a new instance record.
    async fn insert_instance(&self, record: &InstanceRecord) -> Result<()>;

    /// Load an instance record, `None` if it does not exist.
    async fn load(&self, id: i64) -> Result<Option<InstanceRecord>>;

    /// Record a new current state, with the error cause for corrupted states.
    async fn set_state(&self, id: i64, state: State, error: Option<&str>) -> Result<()>;

    /// Record a new target state.
    async fn set_target_state(&self, id: i64, target: State) -> Result<()>;

    /// Replace the VM descriptor.
    async fn update_descriptor(&self, id: i64, descriptor: &VmDescriptor) -> Result<()>;

    /// Replace the operational flags.
    async fn update_flags(&self, id: i64, flags: &InstanceFlags) -> Result<()>;

    /// Set or clear the termination deadline.
    async fn set_termination_time(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()>;

    /// Delete the instance record.
    async fn remove(&self, id: i64) -> Result<()>;

    /// Ids of every stored instance.
    async fn find_active_ids(&self) -> Result<Vec<i64>>;

    /// Instances carrying a termination deadline.
    async fn sweepable_instances(&self) -> Result<Vec<SweepableEntry>>;

    /// Store a group or ensemble.
    async fn insert_group(&self, group: &GroupRecord) -> Result<()>;

    /// Load a group or ensemble.
    async fn load_group(&self, kind: GroupKind, id: i64) -> Result<Option<GroupRecord>>;

    /// Delete a group or ensemble record (members are not touched).
    async fn remove_group(&self, kind: GroupKind, id: i64) -> Result<()>;

    /// Ids of the instances in a group, in launch order.
    async fn group_members(&self, group_id: i64) -> Result<Vec<i64>>;

    /// Ids of the instances in an ensemble.
    async fn ensemble_members(&self, ensemble_id: i64) -> Result<Vec<i64>>;

    /// Insert or replace a backend node capacity record.
    async fn upsert_pool_entry(&self, entry: &ResourcePoolEntry) -> Result<()>;

    /// All backend node capacity records.
    async fn list_pool_entries(&self) -> Result<Vec<ResourcePoolEntry>>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<()>;
}
