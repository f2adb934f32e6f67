//! Concurrent ingestion, flushing and partitioned delivery

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rules_engine::{
    actors::{CancellationToken, EngineHandle, engine::partition_for},
    config::EngineConfig,
    storage::MemoryBackend,
};

use crate::helpers::*;

const EQUIPMENT: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_ingest_touches_every_actor_once() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager_with(
        backend.clone(),
        &EngineConfig::default(),
        &rule("hot", "supply_temp > 30"),
        EQUIPMENT,
    );

    // each task owns a disjoint set of sensors, so per-sensor order holds
    let tasks: Vec<_> = (0..4)
        .map(|task| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let mut routed = 0;
                for i in (task..EQUIPMENT).step_by(4) {
                    for minute in 0..20 {
                        let value = if minute % 2 == 0 { 40.0 } else { 20.0 };
                        routed += manager.ingest_at(&raw(i, minute * 5, value), base());
                    }
                }
                routed
            })
        })
        .collect();

    let mut routed = 0;
    for task in tasks {
        routed += task.await.unwrap();
    }

    assert_eq!(routed, EQUIPMENT * 20);
    assert_eq!(manager.active_count(), EQUIPMENT);
    for i in 0..EQUIPMENT {
        let insight = manager.insight(&instance_id("hot", i)).unwrap();
        assert_eq!(insight.occurrences.len(), 10);
        assert!(!insight.has_overlapping_occurrences());
    }

    let report = manager.flush(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.actors_written, EQUIPMENT);
    assert_eq!(backend.actor_state_count().await, EQUIPMENT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flush_during_ingest_loses_nothing() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        flush_batch_size: 3,
        ..EngineConfig::default()
    };
    let manager = manager_with(backend.clone(), &config, &rule("hot", "supply_temp > 30"), EQUIPMENT);

    let writer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            for minute in 0..50 {
                for i in 0..EQUIPMENT {
                    manager.ingest_at(&raw(i, minute, 40.0 + minute as f64), base());
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let flusher = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            for _ in 0..10 {
                manager.flush(&CancellationToken::new()).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    flusher.await.unwrap();
    manager.flush(&CancellationToken::new()).await.unwrap();

    assert_eq!(manager.dirty_count(), 0);
    assert_eq!(backend.actor_state_count().await, EQUIPMENT);
    assert_eq!(backend.insight_count().await, EQUIPMENT);
}

#[tokio::test]
async fn test_concurrent_flushes_are_serialized() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager_with(
        backend.clone(),
        &EngineConfig::default(),
        &rule("hot", "supply_temp > 30"),
        4,
    );
    for i in 0..4 {
        manager.ingest_at(&raw(i, 0, 40.0), base());
    }

    let token = CancellationToken::new();
    let (a, b) = tokio::join!(manager.flush(&token), manager.flush(&token));
    let written = a.unwrap().actors_written + b.unwrap().actors_written;
    assert_eq!(written, 4);
}

#[tokio::test]
async fn test_engine_delivers_across_partitions() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        partitions: 4,
        channel_capacity: 8,
        ..EngineConfig::default()
    };
    let manager = manager_with(backend.clone(), &config, &rule("hot", "supply_temp > 30"), EQUIPMENT);
    let engine = EngineHandle::spawn(Arc::clone(&manager), &config);
    assert_eq!(engine.partitions(), 4);

    for minute in 0..10 {
        for i in 0..EQUIPMENT {
            engine.send(raw(i, minute, 35.0)).await.unwrap();
        }
    }

    let stats = engine.sync().await.unwrap();
    assert_eq!(stats.received, (EQUIPMENT * 10) as u64);
    assert_eq!(stats.routed, (EQUIPMENT * 10) as u64);
    assert_eq!(manager.insights().len(), EQUIPMENT);

    let report = engine.shutdown().await.unwrap();
    assert_eq!(report.actors_written, EQUIPMENT);
    assert_eq!(backend.insight_count().await, EQUIPMENT);
}

#[test]
fn test_same_sensor_always_maps_to_same_partition() {
    for i in 0..EQUIPMENT {
        let first = partition_for(&raw(i, 0, 1.0), 4);
        assert!((0..50).all(|minute| partition_for(&raw(i, minute, 2.0), 4) == first));
    }
}
