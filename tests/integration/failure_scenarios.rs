//! Storage outages, slow writes, cancelled flushes and bad telemetry

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rules_engine::{
    actors::{CancellationToken, EngineHandle},
    config::EngineConfig,
    error::{EngineError, PersistenceError},
    storage::{MemoryBackend, StorageBackend, StorageError},
};

use crate::helpers::*;

#[tokio::test]
async fn test_outage_keeps_state_until_backend_recovers() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        flush_batch_size: 2,
        ..EngineConfig::default()
    };
    let manager = manager_with(backend.clone(), &config, &rule("hot", "supply_temp > 30"), 4);
    for i in 0..4 {
        manager.ingest_at(&raw(i, 0, 40.0), base());
    }

    backend.set_failing(true);
    assert_matches!(
        manager.flush(&CancellationToken::new()).await,
        Err(PersistenceError::Storage(_))
    );
    assert_eq!(manager.dirty_count(), 4);
    assert_eq!(backend.actor_state_count().await, 0);

    // later telemetry keeps accumulating while the backend is down
    manager.ingest_at(&raw(0, 5, 41.0), base());
    assert_eq!(manager.dirty_count(), 4);

    backend.set_failing(false);
    let report = manager.flush(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.actors_written, 4);
    assert_eq!(report.insights_written, 4);
    assert_eq!(manager.dirty_count(), 0);
    assert_eq!(
        manager.actor_state(&instance_id("hot", 0)),
        backend.get_actor_state(&instance_id("hot", 0)).await.unwrap()
    );
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        persistence_timeout_secs: 1,
        ..EngineConfig::default()
    };
    let manager = manager_with(backend.clone(), &config, &rule("hot", "supply_temp > 30"), 1);
    manager.ingest_at(&raw(0, 0, 40.0), base());

    backend.set_write_delay(Duration::from_millis(1500));
    assert_matches!(
        manager.flush(&CancellationToken::new()).await,
        Err(PersistenceError::Timeout(timeout)) if timeout == Duration::from_secs(1)
    );
    assert_eq!(manager.dirty_count(), 1);

    backend.set_write_delay(Duration::ZERO);
    let report = manager.flush(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.actors_written, 1);
}

#[tokio::test]
async fn test_idle_cancel_does_not_suppress_next_flush() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        partitions: 2,
        ..EngineConfig::default()
    };
    let manager = manager_with(backend.clone(), &config, &rule("hot", "supply_temp > 30"), 3);
    let engine = EngineHandle::spawn(Arc::clone(&manager), &config);

    for i in 0..3 {
        engine.send(raw(i, 0, 40.0)).await.unwrap();
    }
    engine.sync().await.unwrap();

    assert!(!engine.cancel_flush());
    let report = engine.flush().await.unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.actors_written, 3);
    assert_eq!(manager.dirty_count(), 0);
    assert_eq!(backend.actor_state_count().await, 3);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_engine_flush_writes_later() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        partitions: 2,
        flush_batch_size: 1,
        ..EngineConfig::default()
    };
    let manager = manager_with(backend.clone(), &config, &rule("hot", "supply_temp > 30"), 3);
    let engine = EngineHandle::spawn(Arc::clone(&manager), &config);

    for i in 0..3 {
        engine.send(raw(i, 0, 40.0)).await.unwrap();
    }
    engine.sync().await.unwrap();

    backend.set_write_delay(Duration::from_millis(200));
    let (report, cancelled) = tokio::join!(engine.flush(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.cancel_flush()
    });
    let report = report.unwrap();
    assert!(cancelled);
    assert!(report.cancelled);
    assert!(report.actors_written < 3);
    assert!(manager.dirty_count() > 0);

    // the next flush gets a fresh token
    backend.set_write_delay(Duration::ZERO);
    let report = engine.shutdown().await.unwrap();
    assert!(!report.cancelled);
    assert_eq!(backend.actor_state_count().await, 3);
    assert_eq!(manager.dirty_count(), 0);
}

#[tokio::test]
async fn test_engine_surfaces_storage_errors() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig::default();
    let manager = manager_with(backend.clone(), &config, &rule("hot", "supply_temp > 30"), 1);
    let engine = EngineHandle::spawn(manager, &config);

    engine.send(raw(0, 0, 40.0)).await.unwrap();
    engine.sync().await.unwrap();

    backend.close().await.unwrap();
    assert_matches!(
        engine.flush().await,
        Err(EngineError::Persistence(PersistenceError::Storage(
            StorageError::UnhealthyBackend(_)
        )))
    );

    let health = backend.health_check().await.unwrap();
    assert!(!health.healthy);
}

#[test]
fn test_non_finite_and_late_points_change_nothing() {
    let manager = manager_with(
        Arc::new(MemoryBackend::new()),
        &EngineConfig::default(),
        &rule("hot", "supply_temp > 30"),
        1,
    );
    let id = instance_id("hot", 0);

    manager.ingest_at(&raw(0, 10, 20.0), base());
    let before = manager.actor_state(&id).unwrap();

    manager.ingest_at(&raw(0, 15, f64::NAN), base());
    manager.ingest_at(&raw(0, 5, 40.0), base());
    manager.ingest_at(&raw(0, 10, 40.0), base());

    let after = manager.actor_state(&id).unwrap();
    assert_eq!(after.timestamp, before.timestamp);
    assert_eq!(after.timed_values["AHU-0-SAT"].len(), 1);
    assert_eq!(after.timed_values["AHU-0-SAT"].discarded(), 3);
    assert!(manager.insight(&id).is_none());
}

#[tokio::test]
async fn test_restore_skips_unknown_instances() {
    let backend = Arc::new(MemoryBackend::new());
    let first = manager_with(
        backend.clone(),
        &EngineConfig::default(),
        &rule("hot", "supply_temp > 30"),
        3,
    );
    for i in 0..3 {
        first.ingest_at(&raw(i, 0, 40.0), base());
    }
    first.flush(&CancellationToken::new()).await.unwrap();

    let second = manager_with(
        backend.clone(),
        &EngineConfig::default(),
        &rule("hot", "supply_temp > 30"),
        1,
    );
    assert_eq!(second.restore_from_backend().await.unwrap(), 1);
    assert_eq!(second.insights().len(), 1);
    assert_eq!(second.dirty_count(), 0);
}
