//! Rule bundles bound against equipment, including broken rules and macros

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rules_engine::{
    config::EngineConfig,
    progress::{ChannelProgress, NoopProgress},
    rules::{
        GlobalVariable, RESULT, Rule, RuleBundle, RuleInstanceFactory, RuleInstanceStatus,
        RuleParameter,
    },
    storage::{MemoryBackend, StorageBackend},
};

use crate::helpers::*;

fn bundle(rules: Vec<Rule>, globals: Vec<GlobalVariable>, count: usize) -> RuleBundle {
    RuleBundle {
        rules,
        global_variables: globals,
        equipment: (0..count).map(equipment).collect(),
    }
}

#[test]
fn test_macro_failure_is_isolated() {
    let bundle = bundle(
        vec![
            rule("broken-user", "broken > limit"),
            rule("limit-user", "supply_temp > limit"),
        ],
        vec![
            GlobalVariable::new("broken", "OPTION(1, 2"),
            GlobalVariable::new("limit", "30"),
        ],
        2,
    );

    let instances =
        RuleInstanceFactory::generate_all(&bundle.rules, &bundle.snapshot(), &NoopProgress);
    assert_eq!(instances.len(), 4);

    let (ready, failed): (Vec<_>, Vec<_>) = instances.iter().partition(|i| i.is_ready());
    assert!(ready.iter().all(|i| i.rule_id == "limit-user"));
    assert!(failed.iter().all(|i| i.rule_id == "broken-user"));
    assert!(failed.iter().all(|i| i.status == RuleInstanceStatus::BindingFailed));
    assert!(failed.iter().all(|i| i.scan_error.is_some()));
}

#[test]
fn test_macro_value_drives_evaluation() {
    let bundle = bundle(
        vec![rule("limit-user", "supply_temp > limit")],
        vec![GlobalVariable::new("limit", "30")],
        1,
    );
    let instances =
        RuleInstanceFactory::generate_all(&bundle.rules, &bundle.snapshot(), &NoopProgress);

    let manager = Arc::new(rules_engine::actors::ActorManager::new(
        Arc::new(MemoryBackend::new()),
        &EngineConfig::default(),
    ));
    manager.register_instances(instances);

    manager.ingest_at(&raw(0, 0, 29.0), base());
    assert!(manager.insight(&instance_id("limit-user", 0)).is_none());

    manager.ingest_at(&raw(0, 5, 31.0), base());
    assert!(manager.insight(&instance_id("limit-user", 0)).is_some_and(|i| i.is_faulty()));
}

#[test]
fn test_failed_instances_receive_no_telemetry() {
    let broken = Rule::new("broken", AHU)
        .with_parameter(RuleParameter::new("Result", RESULT, "[dtmi:Unknown;1] > 1"));
    let manager = manager_with(Arc::new(MemoryBackend::new()), &EngineConfig::default(), &broken, 2);

    assert_eq!(manager.len(), 2);
    assert_eq!(manager.ingest_at(&raw(0, 0, 40.0), base()), 0);
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn test_rules_without_matching_equipment_are_skipped() {
    let other = Rule::new("pumps", "dtmi:com:example:Pump;1")
        .with_parameter(RuleParameter::new("Result", RESULT, "1 > 0"));
    let bundle = bundle(vec![other, rule("hot", "supply_temp > 30")], vec![], 3);

    let instances =
        RuleInstanceFactory::generate_all(&bundle.rules, &bundle.snapshot(), &NoopProgress);
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i.rule_id == "hot"));
}

#[test]
fn test_reregistration_replaces_and_removes() {
    let manager = manager_with(
        Arc::new(MemoryBackend::new()),
        &EngineConfig::default(),
        &rule("hot", "supply_temp > 30"),
        3,
    );
    manager.ingest_at(&raw(0, 0, 40.0), base());

    let report = manager.register_instances(instances(&rule("hot", "supply_temp > 50"), 2));
    assert_eq!(report.ready, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(manager.len(), 2);

    // state survives the new definition
    assert!(manager.insight(&instance_id("hot", 0)).is_some());
    manager.ingest_at(&raw(0, 5, 45.0), base());
    assert!(manager.insight(&instance_id("hot", 0)).is_some_and(|i| !i.is_faulty()));
}

#[tokio::test]
async fn test_generation_reports_progress() {
    let (progress, mut updates) = ChannelProgress::new(16);
    let bundle = bundle(
        vec![rule("a", "supply_temp > 1"), rule("b", "supply_temp > 2")],
        vec![],
        1,
    );

    RuleInstanceFactory::generate_all(&bundle.rules, &bundle.snapshot(), &progress);
    drop(progress);

    let mut seen = Vec::new();
    while let Some(update) = updates.recv().await {
        seen.push(update);
    }
    assert!(seen.len() >= 2);
    assert!(seen.iter().any(|u| u.percent >= 100.0));
}

#[tokio::test]
async fn test_bundle_round_trips_through_storage() {
    let backend = MemoryBackend::new();
    let bundle = bundle(
        vec![rule("b", "supply_temp > 2"), rule("a", "supply_temp > 1")],
        vec![GlobalVariable::new("limit", "30")],
        1,
    );

    backend.save_rules(bundle.rules.clone()).await.unwrap();
    backend
        .save_global_variables(bundle.global_variables.clone())
        .await
        .unwrap();

    assert_eq!(backend.load_rules().await.unwrap(), bundle.rules);
    assert_eq!(
        backend.load_global_variables().await.unwrap(),
        bundle.global_variables
    );
}
