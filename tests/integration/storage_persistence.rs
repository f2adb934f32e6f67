//! Engine state persisted to SQLite and restored by a fresh process

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rules_engine::{
    actors::{CancellationToken, EngineHandle},
    config::{EngineConfig, StorageConfig},
    rules::GlobalVariable,
    storage::{StorageBackend, open_backend, sqlite::SqliteBackend},
};
use tempfile::tempdir;

use crate::helpers::*;

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("engine.db");
    let rule = rule("hot", "supply_temp > 30");

    let first_backend: Arc<dyn StorageBackend> =
        Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let first = manager_with(Arc::clone(&first_backend), &EngineConfig::default(), &rule, 3);
    for i in 0..3 {
        first.ingest_at(&raw(i, 0, 20.0 + 10.0 * i as f64), base());
        first.ingest_at(&raw(i, 5, 25.0 + 10.0 * i as f64), base());
    }
    let report = first.flush(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.actors_written, 3);
    assert_eq!(report.insights_written, 2);
    first_backend.close().await.unwrap();

    let second_backend: Arc<dyn StorageBackend> =
        Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let second = manager_with(second_backend, &EngineConfig::default(), &rule, 3);
    assert_eq!(second.restore_from_backend().await.unwrap(), 3);

    assert_eq!(second.insights(), first.insights());
    let id = instance_id("hot", 2);
    let restored = second.actor_state(&id).unwrap();
    assert_eq!(restored.timestamp, first.actor_state(&id).unwrap().timestamp);
    assert_eq!(restored.timed_values["AHU-2-SAT"].len(), 2);

    // restored actors continue where they left off
    second.ingest_at(&raw(2, 10, 20.0), base());
    assert!(second.insight(&id).is_some_and(|i| !i.is_faulty()));
}

#[tokio::test]
async fn test_engine_shutdown_persists_to_sqlite() {
    let temp_dir = tempdir().unwrap();
    let storage = StorageConfig::Sqlite {
        path: temp_dir.path().join("engine.db"),
    };
    let config = EngineConfig {
        storage: Some(storage.clone()),
        ..EngineConfig::default()
    };

    let backend = open_backend(&storage).await.unwrap();
    let manager = manager_with(
        Arc::clone(&backend),
        &config,
        &rule("hot", "supply_temp > 30"),
        4,
    );
    let engine = EngineHandle::spawn(manager, &config);
    for i in 0..4 {
        engine.send(raw(i, 0, 40.0)).await.unwrap();
    }
    engine.shutdown().await.unwrap();

    assert_eq!(backend.load_actor_states().await.unwrap().len(), 4);
    assert_eq!(backend.load_insights().await.unwrap().len(), 4);

    let health = backend.health_check().await.unwrap();
    assert!(health.healthy);
    backend.close().await.unwrap();
}

#[tokio::test]
async fn test_rules_and_globals_persist() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("rules.db"))
        .await
        .unwrap();

    let rules = vec![rule("b", "supply_temp > limit"), rule("a", "supply_temp > 1")];
    let globals = vec![GlobalVariable::new("limit", "30")];
    backend.save_rules(rules.clone()).await.unwrap();
    backend.save_global_variables(globals.clone()).await.unwrap();

    assert_eq!(backend.load_rules().await.unwrap(), rules);
    assert_eq!(backend.load_global_variables().await.unwrap(), globals);
}
