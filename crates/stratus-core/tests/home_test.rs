// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance home tests: creation, groups, recovery and backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use stratus_core::dispatch::CompletionSink;
use stratus_core::engine::EngineConfig;
use stratus_core::executor::{MockExecutor, TaskContext, TaskKind, TaskOutcome};
use stratus_core::home::{CreateRequest, InstanceHome};
use stratus_core::model::{GroupKind, ResourcePoolEntry};
use stratus_core::persistence::{Persistence, SqlitePersistence};
use stratus_core::state::{Phase, State};
use stratus_core::Error;

#[tokio::test]
async fn test_create_group_assigns_launch_order() {
    let t = test_home(Arc::new(fast_mock()));

    let instances = t
        .home
        .create(CreateRequest::new("alice", descriptor("batch")).count(3))
        .await
        .unwrap();
    assert_eq!(instances.len(), 3);

    let records: Vec<_> = instances.iter().map(|i| i.snapshot()).collect();
    let group_id = records[0].group_id.expect("group id");
    for (idx, record) in records.iter().enumerate() {
        assert_eq!(record.group_id, Some(group_id));
        assert_eq!(record.launch_index, idx as i32);
        assert!(record.flags.part_of_group_request);
        assert_eq!(record.flags.last_in_group, idx == 2);
        assert_eq!(record.state, State::UNSTAGED);
        assert_eq!(record.ensemble_id, None);
    }

    let ids: Vec<i64> = instances.iter().map(|i| i.id()).collect();
    assert_eq!(t.home.group_members(group_id).await.unwrap(), ids);
}

#[tokio::test]
async fn test_single_instance_has_no_group() {
    let t = test_home(Arc::new(fast_mock()));
    let inst = t
        .home
        .create(CreateRequest::new("alice", descriptor("solo")))
        .await
        .unwrap()
        .remove(0);

    let record = inst.snapshot();
    assert_eq!(record.group_id, None);
    assert!(!record.flags.part_of_group_request);
    assert!(record.flags.last_in_group);
}

#[tokio::test]
async fn test_coscheduled_instances_share_an_ensemble() {
    let t = test_home(Arc::new(fast_mock()));
    let instances = t
        .home
        .create(
            CreateRequest::new("alice", descriptor("mpi"))
                .count(2)
                .coschedule(true),
        )
        .await
        .unwrap();

    let ensemble_id = instances[0].snapshot().ensemble_id.expect("ensemble id");
    let ids: Vec<i64> = instances.iter().map(|i| i.id()).collect();
    assert_eq!(t.home.ensemble_members(ensemble_id).await.unwrap(), ids);

    t.home.destroy_ensemble(ensemble_id).await.unwrap();
    assert!(t.home.active_ids().await.unwrap().is_empty());
    assert!(
        t.persistence
            .load_group(GroupKind::Ensemble, ensemble_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_create_validation_mutates_nothing() {
    let t = test_home(Arc::new(fast_mock()));

    let zero = CreateRequest::new("alice", descriptor("web")).count(0);
    let err = t.home.create(zero).await.unwrap_err();
    assert!(matches!(err, Error::ParameterProblem { ref field, .. } if field == "count"));

    let unnamed = CreateRequest::new("alice", descriptor("  "));
    let err = t.home.create(unnamed).await.unwrap_err();
    assert_eq!(err.error_code(), "PARAMETER_PROBLEM");

    let mut tiny = descriptor("web");
    tiny.memory_mb = 0;
    let err = t.home.create(CreateRequest::new("alice", tiny)).await.unwrap_err();
    assert!(matches!(err, Error::ParameterProblem { ref field, .. } if field == "memory_mb"));

    let illegal = CreateRequest::new("alice", descriptor("web"))
        .initial_target(State::At(Phase::Starting));
    let err = t.home.create(illegal).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTargetState(_)));

    assert!(t.home.active_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unpropagation_rejected_when_disabled() {
    let t = test_home_with(
        Arc::new(fast_mock()),
        EngineConfig {
            unpropagate_enabled: false,
            ..EngineConfig::default()
        },
    );
    let mut desc = descriptor("transport");
    desc.unpropagate_required = true;

    let err = t
        .home
        .create(CreateRequest::new("alice", desc))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ParameterProblem { ref field, .. } if field == "unpropagate_required")
    );
}

#[tokio::test]
async fn test_failed_initial_target_rolls_back_creation() {
    let mock = Arc::new(fast_mock().without(&[TaskKind::Propagate, TaskKind::PropagateAndStart]));
    let t = test_home(mock);

    let err = t
        .home
        .create(
            CreateRequest::new("alice", descriptor("web"))
                .count(2)
                .initial_target(State::STARTED),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskNotImplemented { .. }));

    assert!(t.home.active_ids().await.unwrap().is_empty());
    assert!(
        t.persistence
            .load_group(GroupKind::Group, 1)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_destroy_group_removes_members_and_group() {
    let mock = Arc::new(fast_mock());
    let t = test_home(mock.clone());
    let instances = t
        .home
        .create(
            CreateRequest::new("alice", descriptor("batch"))
                .count(3)
                .initial_target(State::STARTED),
        )
        .await
        .unwrap();
    for inst in &instances {
        wait_for_state(inst, State::STARTED).await;
    }
    let group_id = instances[0].snapshot().group_id.unwrap();

    t.home.destroy_group(group_id).await.unwrap();

    for inst in &instances {
        assert!(inst.is_destroyed());
        assert!(
            mock.executed_for(inst.id())
                .contains(&TaskKind::CancelAllAtVmm)
        );
    }
    assert!(t.home.active_ids().await.unwrap().is_empty());
    assert!(
        t.persistence
            .load_group(GroupKind::Group, group_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_destroy_group_aggregates_member_failures() {
    let t = test_home(Arc::new(fast_mock()));
    let instances = t
        .home
        .create(CreateRequest::new("alice", descriptor("batch")).count(3))
        .await
        .unwrap();
    let group_id = instances[0].snapshot().group_id.unwrap();
    let stuck = instances[1].id();
    t.persistence.fail_remove_for(stuck);

    let err = t.home.destroy_group(group_id).await.unwrap_err();
    match err {
        Error::GroupDestroyFailed {
            kind,
            group_id: failed_group,
            failures,
        } => {
            assert_eq!(kind, "group");
            assert_eq!(failed_group, group_id);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, stuck);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(instances[0].is_destroyed());
    assert!(instances[2].is_destroyed());
    assert!(!instances[1].is_destroyed());
    assert!(
        t.persistence
            .load_group(GroupKind::Group, group_id)
            .await
            .unwrap()
            .is_some()
    );

    t.persistence.allow_remove(stuck);
    t.home.destroy_group(group_id).await.unwrap();
}

#[tokio::test]
async fn test_unknown_ids_do_not_exist() {
    let t = test_home(Arc::new(fast_mock()));

    assert!(matches!(
        t.home.find(404).await,
        Err(Error::DoesNotExist { kind: "instance", id: 404 })
    ));
    assert!(!t.home.exists(404).await.unwrap());
    assert!(matches!(
        t.home.destroy_group(7).await,
        Err(Error::DoesNotExist { kind: "group", id: 7 })
    ));
}

#[tokio::test]
async fn test_recover_corrupts_interrupted_and_finishes_destroys() {
    let persistence = Arc::new(FlakyPersistence::new());
    let interrupted = seed(
        &persistence,
        State::At(Phase::Propagating),
        State::PROPAGATED,
        descriptor("interrupted"),
    )
    .await;
    let steady = seed(
        &persistence,
        State::STARTED,
        State::STARTED,
        descriptor("steady"),
    )
    .await;
    let doomed = seed(
        &persistence,
        State::STARTED,
        State::DESTROYING,
        descriptor("doomed"),
    )
    .await;

    let mock = Arc::new(fast_mock());
    let t = test_home_on(persistence, mock.clone(), EngineConfig::default());
    let report = t.home.recover().await.unwrap();

    assert_eq!(report.loaded, 3);
    assert_eq!(report.corrupted, vec![interrupted]);
    assert_eq!(report.destroyed, vec![doomed]);
    assert!(report.resumed.is_empty());

    let inst = t.home.find(interrupted).await.unwrap();
    assert_eq!(inst.state(), State::At(Phase::Propagating).corrupted());
    assert_eq!(inst.error_cause().as_deref(), Some("interrupted by restart"));

    assert_eq!(t.home.find(steady).await.unwrap().state(), State::STARTED);
    assert!(!t.home.exists(doomed).await.unwrap());
    assert_eq!(mock.executed_for(doomed), vec![TaskKind::CancelAllAtVmm]);
    assert_eq!(t.home.active_ids().await.unwrap(), vec![interrupted, steady]);
}

#[tokio::test]
async fn test_recover_resumes_instances_short_of_their_target() {
    let persistence = Arc::new(FlakyPersistence::new());
    let id = seed(
        &persistence,
        State::PROPAGATED,
        State::STARTED,
        descriptor("halfway"),
    )
    .await;

    let mock = Arc::new(fast_mock());
    let t = test_home_on(persistence, mock.clone(), EngineConfig::default());
    let report = t.home.recover().await.unwrap();

    assert_eq!(report.resumed, vec![id]);
    assert!(report.corrupted.is_empty());

    let inst = t.home.find(id).await.unwrap();
    wait_for_state(&inst, State::STARTED).await;
    assert_eq!(mock.executed_for(id), vec![TaskKind::Start]);
}

#[tokio::test]
async fn test_shutdown_leaves_instance_at_last_stable_state() {
    let mock = Arc::new(MockExecutor::gated().without(&[TaskKind::PropagateAndStart]));
    let t = test_home(mock.clone());

    let inst = t
        .home
        .create(CreateRequest::new("alice", descriptor("draining")).initial_target(State::STARTED))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(inst.state(), State::At(Phase::Propagating));

    let home = t.home.clone();
    let shutdown = tokio::spawn(async move { home.shutdown().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    mock.release(1);
    shutdown.await.unwrap();

    // Propagate finished during the drain; Start could not be dispatched.
    assert_eq!(inst.state(), State::PROPAGATED);
    assert_eq!(inst.target(), State::STARTED);
    assert_eq!(inst.error_cause(), None);
    let stored = t.persistence.load(inst.id()).await.unwrap().unwrap();
    assert_eq!(stored.state, State::PROPAGATED);
    assert_eq!(stored.target, State::STARTED);
    assert_eq!(mock.executed_for(inst.id()), vec![TaskKind::Propagate]);

    // A restarted manager finishes the transition.
    let restarted = Arc::new(fast_mock());
    let t2 = test_home_on(t.persistence.clone(), restarted.clone(), EngineConfig::default());
    let report = t2.home.recover().await.unwrap();
    assert_eq!(report.resumed, vec![inst.id()]);
    let inst = t2.home.find(inst.id()).await.unwrap();
    wait_for_state(&inst, State::STARTED).await;
    assert_eq!(restarted.executed_for(inst.id()), vec![TaskKind::Start]);
}

#[tokio::test]
async fn test_recover_reruns_cancel_interrupted_by_restart() {
    let persistence = Arc::new(FlakyPersistence::new());
    let id = seed(
        &persistence,
        State::At(Phase::CancellingAtVmm),
        State::DESTROYING,
        descriptor("half-cancelled"),
    )
    .await;

    let mock = Arc::new(fast_mock());
    let t = test_home_on(persistence, mock.clone(), EngineConfig::default());
    let report = t.home.recover().await.unwrap();

    assert_eq!(report.destroyed, vec![id]);
    assert!(!t.home.exists(id).await.unwrap());
    assert_eq!(mock.executed_for(id), vec![TaskKind::CancelAllAtVmm]);
}

#[tokio::test]
async fn test_stale_completion_does_not_record_task_result() {
    let persistence = Arc::new(FlakyPersistence::new());
    let id = seed(
        &persistence,
        State::At(Phase::Serializing),
        State::DESTROYING,
        descriptor("late"),
    )
    .await;

    let t = test_home_on(persistence, Arc::new(fast_mock()), EngineConfig::default());
    let inst = t.home.find(id).await.unwrap();

    let ctx = TaskContext {
        task_id: uuid::Uuid::new_v4(),
        instance_id: id,
        name: "late".to_string(),
        descriptor: inst.descriptor(),
        group_id: None,
        ensemble_id: None,
        launch_index: 0,
        notify_state: State::SERIALIZED,
    };
    let outcome = TaskOutcome {
        assigned_hostname: Some("late-node".to_string()),
        assigned_network: Some("10.0.0.0/24".to_string()),
        message: None,
    };
    t.home
        .task_completed(TaskKind::ShutdownSerialize, ctx, Ok(outcome))
        .await;

    assert_eq!(inst.state(), State::At(Phase::Serializing));
    assert_eq!(inst.descriptor().assigned_hostname, None);
    assert_eq!(inst.descriptor().assigned_network, None);
    let stored = t.persistence.load(id).await.unwrap().unwrap();
    assert_eq!(stored.descriptor.assigned_hostname, None);
    assert_eq!(stored.descriptor.assigned_network, None);
}

#[tokio::test]
async fn test_resource_pool_entries() {
    let t = test_home(Arc::new(fast_mock()));
    let mut entry = ResourcePoolEntry {
        hostname: "node-1".to_string(),
        pool: "default".to_string(),
        networks: vec!["net-a".to_string()],
        max_memory_mb: 65536,
        available_memory_mb: 32768,
        preemptable_memory_mb: 0,
        active: true,
    };
    t.home.register_pool_entry(&entry).await.unwrap();

    entry.available_memory_mb = 1024;
    t.home.register_pool_entry(&entry).await.unwrap();

    assert_eq!(t.home.resource_pool().await.unwrap(), vec![entry]);
    t.home.health_check().await.unwrap();
}

#[tokio::test]
async fn test_sqlite_backed_home_persists_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stratus.db");

    let persistence = Arc::new(SqlitePersistence::from_path(&path).await.unwrap());
    let home = InstanceHome::builder()
        .persistence(persistence.clone())
        .executor(Arc::new(fast_mock()))
        .build()
        .unwrap();

    let inst = home
        .create(CreateRequest::new("alice", descriptor("durable")).initial_target(State::STARTED))
        .await
        .unwrap()
        .remove(0);
    wait_for_state(&inst, State::STARTED).await;
    home.shutdown().await;

    let reopened = SqlitePersistence::from_path(&path).await.unwrap();
    let stored = reopened.load(inst.id()).await.unwrap().unwrap();
    assert_eq!(stored.state, State::STARTED);
    assert_eq!(stored.target, State::STARTED);
    assert_eq!(
        stored.descriptor.assigned_hostname,
        Some(format!("mock-node-{}", inst.id()))
    );
}

#[tokio::test]
async fn test_builder_requires_persistence_and_executor() {
    let err = InstanceHome::builder()
        .executor(Arc::new(MockExecutor::new()))
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("persistence"));
}
