//! Insight status changes, sync gating and cooldown after resolution

use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;
use rules_engine::{
    config::EngineConfig,
    insights::InsightStatus,
    rules::model::{OVER_HOW_MANY_HOURS, PERCENTAGE_OF_TIME_OFF},
    storage::MemoryBackend,
};

use crate::helpers::*;

fn config(cooldown_hours: f64) -> EngineConfig {
    EngineConfig {
        default_cooldown_hours: cooldown_hours,
        compression: false,
        ..EngineConfig::default()
    }
}

#[test]
fn test_new_insight_is_sync_candidate() {
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &config(1.0), &rule, 2);

    manager.ingest_at(&raw(0, 0, 40.0), base());

    let insight = manager.insight(&instance_id("hot", 0)).unwrap();
    assert_eq!(insight.status, InsightStatus::New);
    assert!(!insight.has_synced());

    let candidates = manager.sync_candidates(base());
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, instance_id("hot", 0));
}

#[test]
fn test_command_disabled_never_syncs() {
    let rule = rule("hot", "supply_temp > 30").with_command_enabled(false);
    let manager = manager_with(Arc::new(MemoryBackend::new()), &config(1.0), &rule, 1);

    manager.ingest_at(&raw(0, 0, 40.0), base());

    assert!(manager.insight(&instance_id("hot", 0)).is_some());
    assert!(manager.sync_candidates(base()).is_empty());
}

#[test]
fn test_reopen_waits_for_default_cooldown() {
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &config(2.0), &rule, 1);
    let id = instance_id("hot", 0);

    manager.ingest_at(&raw(0, 0, 40.0), base());
    manager.ingest_at(&raw(0, 5, 20.0), base());
    assert_eq!(
        manager.insight(&id).map(|i| i.status),
        Some(InsightStatus::ReadyToResolve)
    );

    let synced = base() + Duration::minutes(10);
    manager.with_insight_mut(&id, |insight| insight.resolve(synced));

    manager.ingest_at(&raw(0, 15, 45.0), base());
    let insight = manager.insight(&id).unwrap();
    assert_eq!(insight.status, InsightStatus::Open);
    assert_eq!(insight.next_allowed_sync_date, synced + Duration::hours(2));
    assert!(insight.is_faulty());

    let allowed = insight.next_allowed_sync_date;
    assert!(!insight.should_sync(allowed - Duration::seconds(1)));
    assert!(insight.should_sync(allowed));
}

#[test]
fn test_window_sets_cooldown() {
    let rule = rule("hot", "supply_temp > 30")
        .with_element(OVER_HOW_MANY_HOURS, 4.0)
        .with_element(PERCENTAGE_OF_TIME_OFF, 0.5);
    let manager = manager_with(Arc::new(MemoryBackend::new()), &config(1.0), &rule, 1);
    let id = instance_id("hot", 0);

    // on for one hour, then off for one hour: half the observed window
    for (minute, value) in [(0, 40.0), (60, 20.0), (120, 20.0)] {
        manager.ingest_at(&raw(0, minute, value), base());
    }
    assert!(manager.insight(&id).is_some_and(|i| !i.is_faulty()));

    let synced = base() + Duration::minutes(150);
    manager.with_insight_mut(&id, |insight| insight.resolve(synced));

    for minute in [300, 305] {
        manager.ingest_at(&raw(0, minute, 45.0), base());
    }
    let insight = manager.insight(&id).unwrap();
    assert_eq!(insight.status, InsightStatus::Open);
    assert_eq!(insight.next_allowed_sync_date, synced + Duration::hours(4));
}

#[test]
fn test_ignored_insight_stays_quiet() {
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &config(1.0), &rule, 1);
    let id = instance_id("hot", 0);

    manager.ingest_at(&raw(0, 0, 40.0), base());
    manager.with_insight_mut(&id, |insight| insight.ignore(base()));
    manager.ingest_at(&raw(0, 5, 20.0), base());
    manager.ingest_at(&raw(0, 10, 40.0), base());

    let insight = manager.insight(&id).unwrap();
    assert_eq!(insight.status, InsightStatus::Ignored);
    assert!(insight.is_faulty());
    assert!(!insight.should_sync(base() + Duration::days(1)));
}

#[test]
fn test_flapping_never_overlaps() {
    let rule = rule("hot", "supply_temp > 30");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &config(1.0), &rule, 1);

    for i in 0..40 {
        let value = if i % 3 == 0 { 40.0 } else { 20.0 };
        manager.ingest_at(&raw(0, i * 5, value), base());
    }

    let insight = manager.insight(&instance_id("hot", 0)).unwrap();
    assert_eq!(insight.occurrences.len(), 14);
    assert_eq!(insight.faulted_count, 14);
    assert!(!insight.has_overlapping_occurrences());
    assert!(insight.occurrences.windows(2).all(|w| w[0].started < w[1].started));
}
