//! Fixtures shared by the integration tests

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rules_engine::{
    actors::{ActorManager, RawData},
    config::EngineConfig,
    progress::NoopProgress,
    rules::{GenerationSnapshot, RESULT, Rule, RuleInstance, RuleInstanceFactory, RuleParameter},
    storage::StorageBackend,
    twins::{EquipmentBinding, TwinBinding},
};

pub const AHU: &str = "dtmi:com:example:AirHandlingUnit;1";
pub const SAT: &str = "dtmi:com:example:SupplyAirTemperatureSensor;1";
pub const RAT: &str = "dtmi:com:example:ReturnAirTemperatureSensor;1";

pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap()
}

/// One air handler `AHU-{i}` with a supply temperature sensor fed by `trend-{i}`
pub fn equipment(i: usize) -> EquipmentBinding {
    EquipmentBinding::new(
        TwinBinding::new("equipment", AHU, format!("AHU-{i}")),
        vec![
            TwinBinding::new("supply_temp", SAT, format!("AHU-{i}-SAT"))
                .with_trend_id(format!("trend-{i}"))
                .with_unit("degC"),
        ],
    )
}

/// Same as [`equipment`], plus a return temperature sensor fed by `return-{i}`
pub fn paired_equipment(i: usize) -> EquipmentBinding {
    let mut binding = equipment(i);
    binding.sensors.push(
        TwinBinding::new("return_temp", RAT, format!("AHU-{i}-RAT"))
            .with_trend_id(format!("return-{i}"))
            .with_unit("degC"),
    );
    binding
}

pub fn snapshot(count: usize) -> GenerationSnapshot {
    GenerationSnapshot::new(&[], (0..count).map(equipment).collect())
}

pub fn rule(id: &str, result: &str) -> Rule {
    Rule::new(id, AHU)
        .with_parameter(RuleParameter::new("Result", RESULT, result))
        .with_command_enabled(true)
}

pub fn instances(rule: &Rule, count: usize) -> Vec<RuleInstance> {
    RuleInstanceFactory::generate_all(std::slice::from_ref(rule), &snapshot(count), &NoopProgress)
}

/// A manager with `count` instances of `rule` registered
pub fn manager_with(
    backend: Arc<dyn StorageBackend>,
    config: &EngineConfig,
    rule: &Rule,
    count: usize,
) -> Arc<ActorManager> {
    let manager = Arc::new(ActorManager::new(backend, config));
    manager.register_instances(instances(rule, count));
    manager
}

/// A manager with `count` instances of `rule` over [`paired_equipment`]
pub fn paired_manager_with(
    backend: Arc<dyn StorageBackend>,
    config: &EngineConfig,
    rule: &Rule,
    count: usize,
) -> Arc<ActorManager> {
    let snapshot = GenerationSnapshot::new(&[], (0..count).map(paired_equipment).collect());
    let instances =
        RuleInstanceFactory::generate_all(std::slice::from_ref(rule), &snapshot, &NoopProgress);
    let manager = Arc::new(ActorManager::new(backend, config));
    manager.register_instances(instances);
    manager
}

/// Return temperature sample of equipment `i`, `minutes` after [`base`]
pub fn raw_return(i: usize, minutes: i64, value: f64) -> RawData {
    let at = base() + Duration::minutes(minutes);
    RawData::with_trend_id(format!("return-{i}"), at, at, value)
}

/// Sample of sensor `i`, `minutes` after [`base`], arriving without delay
pub fn raw(i: usize, minutes: i64, value: f64) -> RawData {
    let at = base() + Duration::minutes(minutes);
    RawData::with_trend_id(format!("trend-{i}"), at, at, value)
}

/// Same as [`raw`], enqueued `lag` after the source timestamp
pub fn raw_delayed(i: usize, minutes: i64, value: f64, lag: Duration) -> RawData {
    let at = base() + Duration::minutes(minutes);
    RawData::with_trend_id(format!("trend-{i}"), at, at + lag, value)
}

pub fn instance_id(rule_id: &str, i: usize) -> String {
    RuleInstance::instance_id(rule_id, &format!("AHU-{i}"))
}
