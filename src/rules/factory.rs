//! Generation of rule instances from rules and twin bindings

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::instance::{BoundParameter, ParameterKind, RuleInstance, RuleInstanceStatus};
use super::model::{GlobalVariable, RESULT, Rule, RuleParameter, RuleThresholds};
use crate::error::{BindingError, ConfigurationError};
use crate::expressions::{BindingContext, MacroTable};
use crate::progress::{ProgressTracker, report_progress};
use crate::twins::EquipmentBinding;

/// Read-only inputs shared by every rule of one generation batch
#[derive(Debug, Clone, Default)]
pub struct GenerationSnapshot {
    macros: MacroTable,
    equipment: Vec<EquipmentBinding>,
}

impl GenerationSnapshot {
    pub fn new(globals: &[GlobalVariable], equipment: Vec<EquipmentBinding>) -> Self {
        let macros = MacroTable::resolve(globals);
        for (name, err) in macros.errors() {
            warn!("global variable {name} is unusable: {err}");
        }

        Self { macros, equipment }
    }

    pub fn macros(&self) -> &MacroTable {
        &self.macros
    }

    pub fn equipment(&self) -> &[EquipmentBinding] {
        &self.equipment
    }

    /// Equipment whose model matches the rule's primary model
    pub fn equipment_for<'a>(
        &'a self,
        model_id: &'a str,
    ) -> impl Iterator<Item = &'a EquipmentBinding> + 'a {
        self.equipment
            .iter()
            .filter(move |binding| binding.equipment.model_id == model_id)
    }
}

/// Rules, global variables and equipment bindings loaded together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleBundle {
    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub global_variables: Vec<GlobalVariable>,

    #[serde(default)]
    pub equipment: Vec<EquipmentBinding>,
}

impl RuleBundle {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn snapshot(&self) -> GenerationSnapshot {
        GenerationSnapshot::new(&self.global_variables, self.equipment.clone())
    }
}

pub struct RuleInstanceFactory;

impl RuleInstanceFactory {
    /// Instances of one rule, one per matching equipment. Never fails as a
    /// whole: problems are recorded on the instances.
    #[instrument(skip_all, fields(rule = %rule.id))]
    pub fn generate(rule: &Rule, snapshot: &GenerationSnapshot) -> Vec<RuleInstance> {
        let checked = rule.thresholds().and_then(|thresholds| {
            if rule.has_result() {
                Ok(thresholds)
            } else {
                Err(ConfigurationError::InvalidRule {
                    rule_id: rule.id.clone(),
                    message: format!("no parameter named {RESULT}"),
                })
            }
        });

        let instances: Vec<RuleInstance> = snapshot
            .equipment_for(&rule.primary_model_id)
            .map(|equipment| match &checked {
                Ok(thresholds) => bind_instance(rule, *thresholds, equipment, snapshot.macros()),
                Err(err) => RuleInstance::failed(
                    &rule.id,
                    &rule.name,
                    &equipment.equipment.twin_id,
                    rule.template,
                    err.to_string(),
                ),
            })
            .collect();

        if instances.is_empty() {
            debug!("no equipment of model {}", rule.primary_model_id);
        }

        instances
    }

    pub fn generate_all(
        rules: &[Rule],
        snapshot: &GenerationSnapshot,
        progress: &dyn ProgressTracker,
    ) -> Vec<RuleInstance> {
        let mut instances = Vec::new();
        let total = rules.len().max(1) as f64;

        for (idx, rule) in rules.iter().enumerate() {
            let generated = Self::generate(rule, snapshot);
            let failed = generated.iter().filter(|i| !i.is_ready()).count();

            report_progress(
                progress,
                "generate",
                (idx + 1) as f64 / total * 100.0,
                &format!(
                    "{}: {} instances, {} failed",
                    rule.id,
                    generated.len(),
                    failed
                ),
            );

            instances.extend(generated);
        }

        let failed = instances.iter().filter(|i| !i.is_ready()).count();
        info!(
            "generated {} rule instances from {} rules ({} failed)",
            instances.len(),
            rules.len(),
            failed
        );

        instances
    }
}

fn bind_all(
    parameters: &[RuleParameter],
    kind: ParameterKind,
    context: &mut BindingContext<'_>,
) -> Vec<BoundParameter> {
    parameters
        .iter()
        .map(|parameter| {
            let binding = context.bind(&parameter.expression);
            match &binding {
                Ok(_) => context.declare(&parameter.field_id),
                Err(err) => {
                    debug!("{} failed to bind: {err}", parameter.field_id);
                    context.mark_failed(&parameter.field_id, err.clone());
                }
            }

            BoundParameter {
                name: parameter.name.clone(),
                field_id: parameter.field_id.clone(),
                units: parameter.units.clone(),
                cumulative_type: parameter.cumulative_type,
                kind,
                binding,
            }
        })
        .collect()
}

fn bind_instance(
    rule: &Rule,
    thresholds: RuleThresholds,
    equipment: &EquipmentBinding,
    macros: &MacroTable,
) -> RuleInstance {
    let mut context = BindingContext::new(&equipment.sensors, macros);
    let parameters = bind_all(&rule.parameters, ParameterKind::Parameter, &mut context);
    let impact_scores = bind_all(&rule.impact_scores, ParameterKind::ImpactScore, &mut context);

    let inputs: BTreeSet<&str> = parameters
        .iter()
        .chain(&impact_scores)
        .filter_map(BoundParameter::expression)
        .flat_map(|expression| expression.inputs().iter().map(String::as_str))
        .collect();

    let mut routes = HashMap::new();
    let mut units = HashMap::new();
    for sensor in equipment
        .sensors
        .iter()
        .filter(|sensor| inputs.contains(sensor.twin_id.as_str()))
    {
        if let Some(key) = sensor.source_key() {
            routes.insert(key, sensor.twin_id.clone());
        }
        if let Some(unit) = &sensor.unit {
            units.insert(sensor.twin_id.clone(), unit.clone());
        }
    }

    let result_error = parameters
        .iter()
        .find(|p| p.is_result())
        .and_then(BoundParameter::error);

    let (status, scan_error) = match result_error {
        Some(err) => (
            RuleInstanceStatus::BindingFailed,
            Some(scan_error(&parameters, err)),
        ),
        None => (RuleInstanceStatus::Ready, None),
    };

    let id = RuleInstance::instance_id(&rule.id, &equipment.equipment.twin_id);
    if let Some(scan_error) = &scan_error {
        debug!("{id} failed to bind: {scan_error}");
    }

    RuleInstance {
        id,
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        equipment_id: equipment.equipment.twin_id.clone(),
        template: rule.template,
        thresholds,
        parameters,
        impact_scores,
        routes,
        units,
        status,
        scan_error,
        command_enabled: rule.command_enabled,
    }
}

/// The result's failure followed by the root causes among the parameters.
fn scan_error(parameters: &[BoundParameter], result_error: &BindingError) -> String {
    let mut messages = vec![format!("{RESULT}: {result_error}")];
    messages.extend(
        parameters
            .iter()
            .filter(|p| !p.is_result())
            .filter_map(|p| match p.error() {
                Some(BindingError::FailedDependency(_)) | None => None,
                Some(err) => Some(format!("{}: {err}", p.field_id)),
            }),
    );
    messages.join("; ")
}
