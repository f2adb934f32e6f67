//! Rolling-window behaviour across sensors, temporal functions and compression

use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;
use rules_engine::{
    config::EngineConfig,
    rules::{
        CumulativeType, RESULT, Rule, RuleParameter, RuleTemplate,
        model::{MAX_TRIGGER, OVER_HOW_MANY_HOURS, PERCENTAGE_OF_TIME, PERCENTAGE_OF_TIME_OFF},
    },
    storage::MemoryBackend,
};

use crate::helpers::*;

#[test]
fn test_second_sensor_at_same_instant_does_not_decide_alone() {
    let rule = rule("either", "supply_temp + return_temp > 0")
        .with_element(OVER_HOW_MANY_HOURS, 1.0)
        .with_element(PERCENTAGE_OF_TIME, 0.5);
    let manager =
        paired_manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);
    let id = instance_id("either", 0);

    for minute in (0..60).step_by(5) {
        manager.ingest_at(&raw(0, minute, 0.0), base());
        manager.ingest_at(&raw_return(0, minute, 0.0), base());
    }

    manager.ingest_at(&raw(0, 60, 1.0), base());
    manager.ingest_at(&raw_return(0, 60, 0.0), base());
    assert!(manager.insight(&id).is_none());

    let state = manager.actor_state(&id).unwrap();
    assert_eq!(state.output_values.trigger_count, 1);
    assert!(!state.output_values.faulted);

    for minute in (65..=120).step_by(5) {
        manager.ingest_at(&raw(0, minute, 1.0), base());
        manager.ingest_at(&raw_return(0, minute, 1.0), base());
    }

    let insight = manager.insight(&id).expect("insight created");
    assert!(insight.is_faulty());
    assert_eq!(insight.occurrences.len(), 1);
    assert_eq!(insight.occurrences[0].started, base() + Duration::minutes(60));
}

#[test]
fn test_temporal_function_over_comparison_keeps_fault() {
    let rule = rule("recent", "ANY(supply_temp > 30, 1h)");
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);
    let id = instance_id("recent", 0);

    for (minute, value) in [(0, 35.0), (10, 20.0), (20, 20.0)] {
        manager.ingest_at(&raw(0, minute, value), base());
    }
    // the newest reading alone is below the limit
    assert!(manager.insight(&id).is_some_and(|i| i.is_faulty()));

    manager.ingest_at(&raw(0, 80, 20.0), base());
    let insight = manager.insight(&id).unwrap();
    assert!(!insight.is_faulty());
    assert_eq!(insight.occurrences.len(), 1);
    assert_eq!(insight.occurrences[0].started, base());
    assert_eq!(insight.occurrences[0].ended, Some(base() + Duration::minutes(80)));
}

#[test]
fn test_compressed_band_ramp_reaches_detector() {
    let rule = rule("band", "supply_temp")
        .with_template(RuleTemplate::AnyHysteresis)
        .with_element(MAX_TRIGGER, 15.0)
        .with_element(OVER_HOW_MANY_HOURS, 1.0)
        .with_element(PERCENTAGE_OF_TIME, 0.6);
    let config = EngineConfig::default();
    assert!(config.compression);
    let manager = manager_with(Arc::new(MemoryBackend::new()), &config, &rule, 1);
    let id = instance_id("band", 0);

    for (minute, value) in [(0, 10.0), (30, 20.0), (60, 30.0)] {
        manager.ingest_at(&raw(0, minute, value), base());
    }
    assert!(manager.insight(&id).is_none());

    // the ramp is linear but every result sample is a step
    let state = manager.actor_state(&id).unwrap();
    assert_eq!(state.output_values.points.len(), 3);

    manager.ingest_at(&raw(0, 75, 40.0), base());
    let insight = manager.insight(&id).expect("insight created");
    assert!(insight.is_faulty());
    assert_eq!(insight.occurrences[0].started, base() + Duration::minutes(30));
}

#[test]
fn test_occurrence_spans_trigger_runs() {
    let rule = rule("sustained", "supply_temp > 0")
        .with_element(OVER_HOW_MANY_HOURS, 1.0)
        .with_element(PERCENTAGE_OF_TIME, 0.5)
        .with_element(PERCENTAGE_OF_TIME_OFF, 0.5);
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);
    let id = instance_id("sustained", 0);

    for minute in (0..=150).step_by(5) {
        let value = if minute < 60 { 1.0 } else { 0.0 };
        manager.ingest_at(&raw(0, minute, value), base());
    }

    // the detector lags both edges; the occurrence does not
    let insight = manager.insight(&id).expect("insight created");
    assert!(!insight.is_faulty());
    assert_eq!(insight.occurrences.len(), 1);
    assert_eq!(insight.occurrences[0].started, base());
    assert_eq!(insight.occurrences[0].ended, Some(base() + Duration::minutes(60)));
}

#[test]
fn test_accumulated_runtime_drives_result() {
    let rule = Rule::new("runtime", AHU)
        .with_parameter(
            RuleParameter::new("Runtime", "runtime", "supply_temp > 30")
                .with_cumulative_type(CumulativeType::AccumulateTimeMinutes),
        )
        .with_parameter(RuleParameter::new("Result", RESULT, "runtime > 20"))
        .with_command_enabled(true);
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &rule, 1);
    let id = instance_id("runtime", 0);

    for (minute, value) in [(0, 35.0), (10, 35.0), (20, 35.0)] {
        manager.ingest_at(&raw(0, minute, value), base());
    }
    assert!(manager.insight(&id).is_none());

    manager.ingest_at(&raw(0, 30, 35.0), base());
    manager.ingest_at(&raw(0, 40, 20.0), base());

    let state = manager.actor_state(&id).unwrap();
    assert_eq!(state.timed_values["runtime"].last_value(), Some(30.0));

    let insight = manager.insight(&id).expect("insight created");
    assert!(insight.is_faulty());
    assert_eq!(insight.occurrences[0].started, base() + Duration::minutes(30));
}
