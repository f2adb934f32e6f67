//! Rules bound to one concrete equipment

use std::collections::HashMap;

use chrono::Duration;

use super::model::{CumulativeType, RESULT, RuleTemplate, RuleThresholds};
use crate::error::BindingError;
use crate::expressions::BoundExpression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleInstanceStatus {
    Ready,
    BindingFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Parameter,
    ImpactScore,
}

/// One rule parameter (or impact score) together with its binding outcome
#[derive(Debug, Clone)]
pub struct BoundParameter {
    pub name: String,
    pub field_id: String,
    pub units: Option<String>,
    pub cumulative_type: CumulativeType,
    pub kind: ParameterKind,
    pub binding: Result<BoundExpression, BindingError>,
}

impl BoundParameter {
    pub fn expression(&self) -> Option<&BoundExpression> {
        self.binding.as_ref().ok()
    }

    pub fn error(&self) -> Option<&BindingError> {
        self.binding.as_ref().err()
    }

    pub fn is_result(&self) -> bool {
        self.kind == ParameterKind::Parameter && self.field_id == RESULT
    }
}

#[derive(Debug, Clone)]
pub struct RuleInstance {
    /// `{rule_id}_{equipment_twin_id}`
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub equipment_id: String,
    pub template: RuleTemplate,
    pub thresholds: RuleThresholds,

    /// Rule parameters in declaration order
    pub parameters: Vec<BoundParameter>,
    pub impact_scores: Vec<BoundParameter>,

    /// Telemetry source key to the buffer fed by it
    pub routes: HashMap<String, String>,

    /// Unit per sensor buffer
    pub units: HashMap<String, String>,

    pub status: RuleInstanceStatus,
    pub scan_error: Option<String>,
    pub command_enabled: bool,
}

impl RuleInstance {
    pub fn instance_id(rule_id: &str, equipment_id: &str) -> String {
        format!("{rule_id}_{equipment_id}")
    }

    /// An instance that can never evaluate, carrying the reason.
    pub fn failed(
        rule_id: &str,
        rule_name: &str,
        equipment_id: &str,
        template: RuleTemplate,
        scan_error: String,
    ) -> Self {
        Self {
            id: Self::instance_id(rule_id, equipment_id),
            rule_id: rule_id.to_string(),
            rule_name: rule_name.to_string(),
            equipment_id: equipment_id.to_string(),
            template,
            thresholds: RuleThresholds::default(),
            parameters: Vec::new(),
            impact_scores: Vec::new(),
            routes: HashMap::new(),
            units: HashMap::new(),
            status: RuleInstanceStatus::BindingFailed,
            scan_error: Some(scan_error),
            command_enabled: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == RuleInstanceStatus::Ready
    }

    pub fn result(&self) -> Option<&BoundParameter> {
        self.parameters.iter().find(|p| p.is_result())
    }

    /// Buffer fed by telemetry with this source key
    pub fn buffer_for(&self, source_key: &str) -> Option<&str> {
        self.routes.get(source_key).map(String::as_str)
    }

    /// How far back evaluation may look: temporal windows and the hysteresis window
    pub fn required_history(&self) -> Duration {
        self.parameters
            .iter()
            .chain(&self.impact_scores)
            .filter_map(BoundParameter::expression)
            .map(BoundExpression::required_history)
            .chain(self.thresholds.window())
            .max()
            .unwrap_or_else(Duration::zero)
    }
}
