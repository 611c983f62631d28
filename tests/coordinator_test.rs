//! Tests for the coordinator lifecycle: registration, heartbeats, role
//! locks and shutdown.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use steward::{
    CoordinationError, Coordinator, CoordinatorConfig, InProcessConnector, LockFilter,
    MemoryPersistence, Persistence, WorldFilter, WorldKind,
};

fn test_config(kind: WorldKind) -> CoordinatorConfig {
    CoordinatorConfig {
        kind,
        auto_validity_check: Some(false),
        validity_timeout: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(50),
        delayed_executor: false,
    }
}

#[tokio::test]
async fn heartbeat_task_keeps_the_world_fresh() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();
    let mut coordinator = Coordinator::new(
        test_config(WorldKind::Executor),
        store.clone_box(),
        Box::new(connector),
    );
    coordinator.start().await?;

    // Well past the validity timeout; only the heartbeat task keeps the
    // registration alive.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let live = coordinator
        .registry()
        .find_worlds(&WorldFilter::default(), false)
        .await?;
    assert_eq!(live.len(), 1);
    assert!(Utc::now() - live[0].last_seen < chrono::Duration::milliseconds(200));

    coordinator.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_surrenders_locks_and_deregisters() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();
    let mut config = test_config(WorldKind::Executor);
    config.delayed_executor = true;
    let mut coordinator = Coordinator::new(config, store.clone_box(), Box::new(connector));
    coordinator.start().await?;
    let world_id = coordinator.world().id;

    assert_eq!(
        store
            .find_locks(&LockFilter::owned_by(world_id))
            .await?
            .len(),
        1,
        "delayed-executor role is claimed on start"
    );

    coordinator.stop().await;

    assert!(
        store
            .find_locks(&LockFilter::owned_by(world_id))
            .await?
            .is_empty()
    );
    assert!(
        coordinator
            .registry()
            .find_worlds(&WorldFilter::default(), true)
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn client_worlds_cannot_run_the_sweep() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();
    let mut client = Coordinator::new(
        test_config(WorldKind::Client),
        store.clone_box(),
        Box::new(connector),
    );
    client.start().await?;

    let err = client.auto_execute().await.expect_err("clients have no executor");
    assert!(matches!(err, CoordinationError::Executor(_)));
    Ok(())
}

#[tokio::test]
async fn stats_reflect_cluster_counters() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();
    let mut config = test_config(WorldKind::Executor);
    config.delayed_executor = true;
    let mut coordinator = Coordinator::new(config, store.clone_box(), Box::new(connector));
    coordinator.start().await?;

    let stats = coordinator.stats().await?;
    assert_eq!(stats.worlds_registered, 1);
    assert_eq!(stats.locks_total, 1);
    assert_eq!(stats.locks_held, 1);

    coordinator.stop().await;
    Ok(())
}

#[test]
fn auto_validity_check_defaults_follow_world_kind() {
    let executor = CoordinatorConfig {
        kind: WorldKind::Executor,
        auto_validity_check: None,
        ..CoordinatorConfig::default()
    };
    assert!(executor.auto_validity_check_enabled());

    let client = CoordinatorConfig {
        kind: WorldKind::Client,
        auto_validity_check: None,
        ..CoordinatorConfig::default()
    };
    assert!(!client.auto_validity_check_enabled());
}
