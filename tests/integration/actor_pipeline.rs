//! Telemetry flowing through the manager into actor state and insights

use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;
use rules_engine::{
    actors::CancellationToken,
    config::EngineConfig,
    rules::model::{OVER_HOW_MANY_HOURS, PERCENTAGE_OF_TIME},
    storage::MemoryBackend,
};

use crate::helpers::*;

#[test]
fn test_sustained_fault_over_window() {
    let rule = rule("sustained", "supply_temp > 0")
        .with_element(OVER_HOW_MANY_HOURS, 1.0)
        .with_element(PERCENTAGE_OF_TIME, 0.1);
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);

    // 10 of 60 minutes on
    for i in 0..12 {
        let value = if i == 6 || i == 7 { 1.0 } else { 0.0 };
        assert_eq!(manager.ingest_at(&raw(0, i * 5, value), base()), 1);
    }

    let insight = manager.insight(&instance_id("sustained", 0)).expect("insight created");
    assert!(insight.faulted_count >= 1);
    assert!(insight.occurrences.iter().any(|o| o.is_faulted));
    assert!(!insight.has_overlapping_occurrences());
}

#[test]
fn test_short_blip_below_threshold() {
    let rule = rule("sustained", "supply_temp > 0")
        .with_element(OVER_HOW_MANY_HOURS, 1.0)
        .with_element(PERCENTAGE_OF_TIME, 0.5);
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);

    for i in 0..12 {
        let value = if i == 6 { 1.0 } else { 0.0 };
        manager.ingest_at(&raw(0, i * 5, value), base());
    }

    assert!(manager.insight(&instance_id("sustained", 0)).is_none());
    assert_eq!(manager.active_count(), 1);
}

#[test]
fn test_instant_rule_opens_and_closes_occurrence() {
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);

    for (minute, value) in [(0, 20.0), (5, 35.0), (10, 36.0), (15, 25.0)] {
        manager.ingest_at(&raw(0, minute, value), base());
    }

    let insight = manager.insight(&instance_id("hot", 0)).expect("insight created");
    assert_eq!(insight.occurrences.len(), 1);
    assert_eq!(insight.occurrences[0].started, base() + Duration::minutes(5));
    assert_eq!(insight.occurrences[0].ended, Some(base() + Duration::minutes(15)));
    assert!(!insight.is_faulty());
}

#[test]
fn test_points_route_only_to_their_equipment() {
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 3);

    manager.ingest_at(&raw(1, 0, 40.0), base());

    assert!(manager.insight(&instance_id("hot", 0)).is_none());
    assert!(manager.insight(&instance_id("hot", 1)).is_some_and(|i| i.is_faulty()));
    assert!(manager.insight(&instance_id("hot", 2)).is_none());
    assert_eq!(manager.dirty_count(), 1);
}

#[test]
fn test_latency_converges_to_delivery_delay() {
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);

    for i in 0..6 {
        manager.ingest_at(
            &raw_delayed(0, i * 15, 20.0 + i as f64, Duration::minutes(9)),
            base(),
        );
    }

    let state = manager.actor_state(&instance_id("hot", 0)).expect("actor exists");
    let minutes = state.timed_values["AHU-0-SAT"].latency().num_seconds() as f64 / 60.0;
    assert!((8.0..=10.0).contains(&minutes), "latency was {minutes} minutes");
}

#[tokio::test]
async fn test_flush_prunes_month_old_point() {
    let backend = Arc::new(MemoryBackend::new());
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(backend.clone(), &EngineConfig::default(), &rule, 1);

    manager.ingest_at(&raw(0, 0, 20.0), base());
    let month_later = 30 * 24 * 60;
    manager.ingest_at(&raw(0, month_later, 21.0), base());

    let report = manager.flush(&CancellationToken::new()).await.unwrap();
    assert!(report.points_pruned >= 1);
    assert_eq!(report.actors_written, 1);

    let state = manager.actor_state(&instance_id("hot", 0)).unwrap();
    let sensor = &state.timed_values["AHU-0-SAT"];
    assert_eq!(sensor.len(), 1);
    assert_eq!(
        sensor.last().map(|p| p.timestamp),
        Some(base() + Duration::minutes(month_later))
    );
}

#[test]
fn test_evaluation_error_does_not_stop_actor() {
    let rule = rule("ratio", "supply_temp > 30").with_parameter(
        rules_engine::rules::RuleParameter::new("Ratio", "ratio", "supply_temp / 0"),
    );
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);

    manager.ingest_at(&raw(0, 0, 40.0), base());
    manager.ingest_at(&raw(0, 5, 41.0), base());

    let state = manager.actor_state(&instance_id("ratio", 0)).unwrap();
    assert!(state.output_values.last_invalid.is_some());
    assert!(manager.insight(&instance_id("ratio", 0)).is_some_and(|i| i.is_faulty()));
}

#[test]
fn test_impact_scores_reach_insight() {
    let rule = rule("costly", "supply_temp > 30").with_impact_score(
        rules_engine::rules::RuleParameter::new("Cost", "cost", "supply_temp * 2"),
    );
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);

    manager.ingest_at(&raw(0, 0, 40.0), base());

    let state = manager.actor_state(&instance_id("costly", 0)).unwrap();
    assert_eq!(state.output_values.latest_scores.get("cost"), Some(&80.0));
}
