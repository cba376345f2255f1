// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::PersistenceError;
use crate::model::{
    GroupKind, GroupRecord, InstanceFlags, InstanceRecord, ResourcePoolEntry, SweepableEntry,
    VmDescriptor,
};
use crate::state::State;

use super::{Persistence, Result};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run the embedded SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| PersistenceError::database("migrate", format!("Failed to run migrations: {}", e)))
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: i64,
    group_id: Option<i64>,
    ensemble_id: Option<i64>,
    launch_index: i32,
    creator: String,
    state: i32,
    target_state: i32,
    descriptor: String,
    start_time: Option<DateTime<Utc>>,
    termination_time: Option<DateTime<Utc>>,
    ops_enabled: bool,
    vmm_access_ok: bool,
    last_in_group: bool,
    part_of_group_request: bool,
    error_cause: Option<String>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = PersistenceError;

    fn try_from(row: InstanceRow) -> std::result::Result<Self, Self::Error> {
        let id = row.instance_id;
        let decode_state = |code: i32| {
            State::from_code(code).ok_or_else(|| PersistenceError::Decode {
                id,
                details: format!("unknown state code {}", code),
            })
        };
        let descriptor: VmDescriptor =
            serde_json::from_str(&row.descriptor).map_err(|e| PersistenceError::Decode {
                id,
                details: format!("descriptor: {}", e),
            })?;

        Ok(InstanceRecord {
            id,
            group_id: row.group_id,
            ensemble_id: row.ensemble_id,
            launch_index: row.launch_index,
            creator: row.creator,
            state: decode_state(row.state)?,
            target: decode_state(row.target_state)?,
            descriptor,
            start_time: row.start_time,
            termination_time: row.termination_time,
            flags: InstanceFlags {
                ops_enabled: row.ops_enabled,
                vmm_access_ok: row.vmm_access_ok,
                last_in_group: row.last_in_group,
                part_of_group_request: row.part_of_group_request,
            },
            error_cause: row.error_cause,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PoolEntryRow {
    hostname: String,
    pool: String,
    networks: String,
    max_memory_mb: i64,
    available_memory_mb: i64,
    preemptable_memory_mb: i64,
    active: bool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates missing parent directories and the database file, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                PersistenceError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                PersistenceError::database(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn next_sequence(&self, name: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            UPDATE id_sequences SET last_value = last_value + 1
            WHERE name = ?
            RETURNING last_value
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    fn expect_row(id: i64, rows_affected: u64) -> Result<()> {
        if rows_affected == 0 {
            Err(PersistenceError::NotFound(id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn next_instance_id(&self) -> Result<i64> {
        self.next_sequence("instance").await
    }

    async fn next_group_id(&self) -> Result<i64> {
        self.next_sequence("group").await
    }

    async fn insert_instance(&self, record: &InstanceRecord) -> Result<()> {
        let descriptor = serde_json::to_string(&record.descriptor)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO instances (
                instance_id, group_id, ensemble_id, launch_index, creator,
                state, target_state, descriptor, start_time, termination_time,
                ops_enabled, vmm_access_ok, last_in_group, part_of_group_request, error_cause
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(record.group_id)
        .bind(record.ensemble_id)
        .bind(record.launch_index)
        .bind(&record.creator)
        .bind(record.state.code())
        .bind(record.target.code())
        .bind(&descriptor)
        .bind(record.start_time)
        .bind(record.termination_time)
        .bind(record.flags.ops_enabled)
        .bind(record.flags.vmm_access_ok)
        .bind(record.flags.last_in_group)
        .bind(record.flags.part_of_group_request)
        .bind(&record.error_cause)
        .execute(&mut *tx)
        .await?;

        // Keep the sequence ahead of explicitly chosen ids.
        sqlx::query(
            "UPDATE id_sequences SET last_value = MAX(last_value, ?) WHERE name = 'instance'",
        )
        .bind(record.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, id: i64) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT instance_id, group_id, ensemble_id, launch_index, creator,
                   state, target_state, descriptor, start_time, termination_time,
                   ops_enabled, vmm_access_ok, last_in_group, part_of_group_request, error_cause
            FROM instances
            WHERE instance_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn set_state(&self, id: i64, state: State, error: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE instances SET state = ?, error_cause = ? WHERE instance_id = ?",
        )
        .bind(state.code())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::expect_row(id, result.rows_affected())
    }

    async fn set_target_state(&self, id: i64, target: State) -> Result<()> {
        let result = sqlx::query("UPDATE instances SET target_state = ? WHERE instance_id = ?")
            .bind(target.code())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Self::expect_row(id, result.rows_affected())
    }

    async fn update_descriptor(&self, id: i64, descriptor: &VmDescriptor) -> Result<()> {
        let json = serde_json::to_string(descriptor)?;
        let result = sqlx::query("UPDATE instances SET descriptor = ? WHERE instance_id = ?")
            .bind(json)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Self::expect_row(id, result.rows_affected())
    }

    async fn update_flags(&self, id: i64, flags: &InstanceFlags) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET ops_enabled = ?, vmm_access_ok = ?, last_in_group = ?, part_of_group_request = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(flags.ops_enabled)
        .bind(flags.vmm_access_ok)
        .bind(flags.last_in_group)
        .bind(flags.part_of_group_request)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::expect_row(id, result.rows_affected())
    }

    async fn set_termination_time(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        let result =
            sqlx::query("UPDATE instances SET termination_time = ? WHERE instance_id = ?")
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;

        Self::expect_row(id, result.rows_affected())
    }

    async fn remove(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Self::expect_row(id, result.rows_affected())
    }

    async fn find_active_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn sweepable_instances(&self) -> Result<Vec<SweepableEntry>> {
        let rows: Vec<(i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT instance_id, termination_time
            FROM instances
            WHERE termination_time IS NOT NULL
            ORDER BY instance_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, termination_time)| SweepableEntry {
                id,
                termination_time,
            })
            .collect())
    }

    async fn insert_group(&self, group: &GroupRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO instance_groups (kind, group_id, creator) VALUES (?, ?, ?)")
            .bind(group.kind.as_str())
            .bind(group.id)
            .bind(&group.creator)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE id_sequences SET last_value = MAX(last_value, ?) WHERE name = 'group'")
            .bind(group.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_group(&self, kind: GroupKind, id: i64) -> Result<Option<GroupRecord>> {
        let row: Option<(String, i64, String)> = sqlx::query_as(
            "SELECT kind, group_id, creator FROM instance_groups WHERE kind = ? AND group_id = ?",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(kind, id, creator)| -> Result<GroupRecord> {
            let kind = GroupKind::parse(&kind).ok_or_else(|| {
                PersistenceError::database("load_group", format!("unknown group kind '{}'", kind))
            })?;
            Ok(GroupRecord { id, kind, creator })
        })
        .transpose()
    }

    async fn remove_group(&self, kind: GroupKind, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM instance_groups WHERE kind = ? AND group_id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn group_members(&self, group_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT instance_id FROM instances WHERE group_id = ? ORDER BY launch_index, instance_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn ensemble_members(&self, ensemble_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT instance_id FROM instances WHERE ensemble_id = ? ORDER BY instance_id",
        )
        .bind(ensemble_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn upsert_pool_entry(&self, entry: &ResourcePoolEntry) -> Result<()> {
        let networks = serde_json::to_string(&entry.networks)?;

        sqlx::query(
            r#"
            INSERT INTO resource_pool_entries (
                hostname, pool, networks, max_memory_mb, available_memory_mb,
                preemptable_memory_mb, active
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (hostname) DO UPDATE SET
                pool = excluded.pool,
                networks = excluded.networks,
                max_memory_mb = excluded.max_memory_mb,
                available_memory_mb = excluded.available_memory_mb,
                preemptable_memory_mb = excluded.preemptable_memory_mb,
                active = excluded.active
            "#,
        )
        .bind(&entry.hostname)
        .bind(&entry.pool)
        .bind(networks)
        .bind(entry.max_memory_mb)
        .bind(entry.available_memory_mb)
        .bind(entry.preemptable_memory_mb)
        .bind(entry.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_pool_entries(&self) -> Result<Vec<ResourcePoolEntry>> {
        let rows = sqlx::query_as::<_, PoolEntryRow>(
            r#"
            SELECT hostname, pool, networks, max_memory_mb, available_memory_mb,
                   preemptable_memory_mb, active
            FROM resource_pool_entries
            ORDER BY hostname
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ResourcePoolEntry> {
                Ok(ResourcePoolEntry {
                    networks: serde_json::from_str(&row.networks)?,
                    hostname: row.hostname,
                    pool: row.pool,
                    max_memory_mb: row.max_memory_mb,
                    available_memory_mb: row.available_memory_mb,
                    preemptable_memory_mb: row.preemptable_memory_mb,
                    active: row.active,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
