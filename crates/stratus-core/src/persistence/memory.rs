// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::model::{
    GroupKind, GroupRecord, InstanceFlags, InstanceRecord, ResourcePoolEntry, SweepableEntry,
    VmDescriptor,
};
use crate::state::State;

use super::{Persistence, Result};

#[derive(Default)]
struct Store {
    instances: BTreeMap<i64, InstanceRecord>,
    groups: HashMap<(GroupKind, i64), GroupRecord>,
    pool: BTreeMap<String, ResourcePoolEntry>,
    last_instance_id: i64,
    last_group_id: i64,
}

/// Persistence kept entirely in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryPersistence {
    store: Mutex<Store>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> Result<MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| PersistenceError::database("lock", "memory store poisoned"))
    }

    fn with_instance<T>(
        &self,
        id: i64,
        f: impl FnOnce(&mut InstanceRecord) -> T,
    ) -> Result<T> {
        let mut store = self.store()?;
        let record = store
            .instances
            .get_mut(&id)
            .ok_or(PersistenceError::NotFound(id))?;
        Ok(f(record))
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn next_instance_id(&self) -> Result<i64> {
        let mut store = self.store()?;
        store.last_instance_id += 1;
        Ok(store.last_instance_id)
    }

    async fn next_group_id(&self) -> Result<i64> {
        let mut store = self.store()?;
        store.last_group_id += 1;
        Ok(store.last_group_id)
    }

    async fn insert_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut store = self.store()?;
        if store.instances.contains_key(&record.id) {
            return Err(PersistenceError::database(
                "insert_instance",
                format!("instance {} already exists", record.id),
            ));
        }
        store.last_instance_id = store.last_instance_id.max(record.id);
        store.instances.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: i64) -> Result<Option<InstanceRecord>> {
        Ok(self.store()?.instances.get(&id).cloned())
    }

    async fn set_state(&self, id: i64, state: State, error: Option<&str>) -> Result<()> {
        self.with_instance(id, |record| {
            record.state = state;
            record.error_cause = error.map(str::to_string);
        })
    }

    async fn set_target_state(&self, id: i64, target: State) -> Result<()> {
        self.with_instance(id, |record| record.target = target)
    }

    async fn update_descriptor(&self, id: i64, descriptor: &VmDescriptor) -> Result<()> {
        self.with_instance(id, |record| record.descriptor = descriptor.clone())
    }

    async fn update_flags(&self, id: i64, flags: &InstanceFlags) -> Result<()> {
        self.with_instance(id, |record| record.flags = *flags)
    }

    async fn set_termination_time(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        self.with_instance(id, |record| record.termination_time = at)
    }

    async fn remove(&self, id: i64) -> Result<()> {
        self.store()?
            .instances
            .remove(&id)
            .map(|_| ())
            .ok_or(PersistenceError::NotFound(id))
    }

    async fn find_active_ids(&self) -> Result<Vec<i64>> {
        Ok(self.store()?.instances.keys().copied().collect())
    }

    async fn sweepable_instances(&self) -> Result<Vec<SweepableEntry>> {
        Ok(self
            .store()?
            .instances
            .values()
            .filter(|r| r.termination_time.is_some())
            .map(|r| SweepableEntry {
                id: r.id,
                termination_time: r.termination_time,
            })
            .collect())
    }

    async fn insert_group(&self, group: &GroupRecord) -> Result<()> {
        let mut store = self.store()?;
        store.last_group_id = store.last_group_id.max(group.id);
        store.groups.insert((group.kind, group.id), group.clone());
        Ok(())
    }

    async fn load_group(&self, kind: GroupKind, id: i64) -> Result<Option<GroupRecord>> {
        Ok(self.store()?.groups.get(&(kind, id)).cloned())
    }

    async fn remove_group(&self, kind: GroupKind, id: i64) -> Result<()> {
        self.store()?.groups.remove(&(kind, id));
        Ok(())
    }

    async fn group_members(&self, group_id: i64) -> Result<Vec<i64>> {
        let store = self.store()?;
        let mut members: Vec<&InstanceRecord> = store
            .instances
            .values()
            .filter(|r| r.group_id == Some(group_id))
            .collect();
        members.sort_by_key(|r| (r.launch_index, r.id));
        Ok(members.into_iter().map(|r| r.id).collect())
    }

    async fn ensemble_members(&self, ensemble_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .store()?
            .instances
            .values()
            .filter(|r| r.ensemble_id == Some(ensemble_id))
            .map(|r| r.id)
            .collect())
    }

    async fn upsert_pool_entry(&self, entry: &ResourcePoolEntry) -> Result<()> {
        self.store()?
            .pool
            .insert(entry.hostname.clone(), entry.clone());
        Ok(())
    }

    async fn list_pool_entries(&self) -> Result<Vec<ResourcePoolEntry>> {
        Ok(self.store()?.pool.values().cloned().collect())
    }

    async fn health_check(&self) -> Result<()> {
        self.store().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VmDescriptor;

    fn record(id: i64, group_id: Option<i64>, launch_index: i32) -> InstanceRecord {
        InstanceRecord {
            id,
            group_id,
            ensemble_id: None,
            launch_index,
            creator: "tester".to_string(),
            state: State::UNSTAGED,
            target: State::UNSTAGED,
            descriptor: VmDescriptor::new(format!("vm-{id}"), 256, 1),
            start_time: None,
            termination_time: None,
            flags: InstanceFlags::default(),
            error_cause: None,
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_skip_inserted() {
        let p = MemoryPersistence::new();
        assert_eq!(p.next_instance_id().await.unwrap(), 1);
        p.insert_instance(&record(10, None, 0)).await.unwrap();
        assert_eq!(p.next_instance_id().await.unwrap(), 11);
        assert_eq!(p.next_group_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_state_updates_and_remove() {
        let p = MemoryPersistence::new();
        p.insert_instance(&record(1, None, 0)).await.unwrap();

        p.set_state(1, State::STARTED.corrupted(), Some("boom"))
            .await
            .unwrap();
        p.set_target_state(1, State::DESTROYING).await.unwrap();

        let loaded = p.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.state, State::STARTED.corrupted());
        assert_eq!(loaded.target, State::DESTROYING);
        assert_eq!(loaded.error_cause.as_deref(), Some("boom"));

        p.remove(1).await.unwrap();
        assert!(p.load(1).await.unwrap().is_none());
        assert!(matches!(
            p.remove(1).await,
            Err(PersistenceError::NotFound(1))
        ));
        assert!(matches!(
            p.set_state(1, State::STARTED, None).await,
            Err(PersistenceError::NotFound(1))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let p = MemoryPersistence::new();
        p.insert_instance(&record(1, None, 0)).await.unwrap();
        assert!(p.insert_instance(&record(1, None, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_group_members_in_launch_order() {
        let p = MemoryPersistence::new();
        p.insert_instance(&record(3, Some(1), 1)).await.unwrap();
        p.insert_instance(&record(2, Some(1), 0)).await.unwrap();
        p.insert_instance(&record(4, Some(2), 0)).await.unwrap();

        assert_eq!(p.group_members(1).await.unwrap(), vec![2, 3]);
        assert_eq!(p.group_members(2).await.unwrap(), vec![4]);
        assert!(p.group_members(9).await.unwrap().is_empty());
    }
}
