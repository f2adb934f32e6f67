//! Rule definitions as loaded from storage or a rule bundle

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigurationError;

/// Variable name of the parameter every rule must define
pub const RESULT: &str = "result";

pub const OVER_HOW_MANY_HOURS: &str = "OverHowManyHours";
pub const PERCENTAGE_OF_TIME: &str = "PercentageOfTime";
pub const PERCENTAGE_OF_TIME_OFF: &str = "PercentageOfTimeOff";
pub const MIN_TRIGGER: &str = "MinTrigger";
pub const MAX_TRIGGER: &str = "MaxTrigger";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleParameter {
    pub name: String,

    /// Variable name other expressions use to refer to this parameter
    pub field_id: String,

    pub expression: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    #[serde(default)]
    pub cumulative_type: CumulativeType,
}

impl RuleParameter {
    pub fn new(
        name: impl Into<String>,
        field_id: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_id: field_id.into(),
            expression: expression.into(),
            units: None,
            cumulative_type: CumulativeType::Simple,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_cumulative_type(mut self, cumulative_type: CumulativeType) -> Self {
        self.cumulative_type = cumulative_type;
        self
    }
}

/// How a computed parameter value is stored in its buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CumulativeType {
    /// Store the value as computed
    #[default]
    Simple,

    /// Running total of every computed value
    Accumulate,

    /// Running total of value times the seconds since the previous sample
    AccumulateTimeSeconds,

    AccumulateTimeMinutes,

    AccumulateTimeHours,
}

impl CumulativeType {
    /// Next stored value given the previous one, the computed value and
    /// the seconds elapsed since the previous sample.
    pub fn apply(self, previous: Option<f64>, value: f64, elapsed_secs: f64) -> f64 {
        let increment = match self {
            CumulativeType::Simple => return value,
            CumulativeType::Accumulate => value,
            CumulativeType::AccumulateTimeSeconds => value * elapsed_secs,
            CumulativeType::AccumulateTimeMinutes => value * elapsed_secs / 60.0,
            CumulativeType::AccumulateTimeHours => value * elapsed_secs / 3600.0,
        };
        previous.unwrap_or(0.0) + increment
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    Macro,
    Const,
}

/// A named expression shared by all rules ("macro")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub name: String,

    #[serde(default)]
    pub variable_type: VariableType,

    /// Formal parameters for call-style use, e.g. `offset(x)`
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Locals first, the value of the macro last
    pub expressions: Vec<RuleParameter>,
}

impl GlobalVariable {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            expressions: vec![RuleParameter::new(name.clone(), RESULT, expression)],
            name,
            variable_type: VariableType::Macro,
            parameters: Vec::new(),
        }
    }

    pub fn constant(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            variable_type: VariableType::Const,
            ..Self::new(name, expression)
        }
    }

    pub fn with_parameters(mut self, parameters: &[&str]) -> Self {
        self.parameters = parameters.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_expressions(mut self, expressions: Vec<RuleParameter>) -> Self {
        self.expressions = expressions;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleTemplate {
    /// Fault while the result is true (optionally over a window)
    #[default]
    #[serde(rename = "any-fault")]
    AnyFault,

    /// Fault while the result leaves the [MinTrigger, MaxTrigger] band
    #[serde(rename = "any-hysteresis")]
    AnyHysteresis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleElement {
    pub id: String,
    pub value: f64,
}

impl RuleElement {
    pub fn new(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Equipment model the rule applies to
    pub primary_model_id: String,

    #[serde(default)]
    pub template: RuleTemplate,

    pub parameters: Vec<RuleParameter>,

    #[serde(default)]
    pub impact_scores: Vec<RuleParameter>,

    #[serde(default)]
    pub elements: Vec<RuleElement>,

    #[serde(default)]
    pub command_enabled: bool,
}

impl Rule {
    pub fn new(id: impl Into<String>, primary_model_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            primary_model_id: primary_model_id.into(),
            template: RuleTemplate::AnyFault,
            parameters: Vec::new(),
            impact_scores: Vec::new(),
            elements: Vec::new(),
            command_enabled: false,
        }
    }

    pub fn with_template(mut self, template: RuleTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_parameter(mut self, parameter: RuleParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_impact_score(mut self, score: RuleParameter) -> Self {
        self.impact_scores.push(score);
        self
    }

    pub fn with_element(mut self, id: &str, value: f64) -> Self {
        self.elements.push(RuleElement::new(id, value));
        self
    }

    pub fn with_command_enabled(mut self, enabled: bool) -> Self {
        self.command_enabled = enabled;
        self
    }

    pub fn has_result(&self) -> bool {
        self.parameters.iter().any(|p| p.field_id == RESULT)
    }

    pub fn thresholds(&self) -> Result<RuleThresholds, ConfigurationError> {
        RuleThresholds::from_rule(self)
    }
}

/// Typed view of a rule's elements
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleThresholds {
    pub over_how_many_hours: Option<f64>,
    pub percentage_of_time: Option<f64>,
    pub percentage_of_time_off: Option<f64>,
    pub min_trigger: Option<f64>,
    pub max_trigger: Option<f64>,
}

impl RuleThresholds {
    pub fn from_rule(rule: &Rule) -> Result<Self, ConfigurationError> {
        let invalid = |message: String| ConfigurationError::InvalidRule {
            rule_id: rule.id.clone(),
            message,
        };

        let mut thresholds = RuleThresholds::default();
        for element in &rule.elements {
            if !element.value.is_finite() {
                return Err(invalid(format!("{} must be a finite number", element.id)));
            }

            let slot = if element.id.eq_ignore_ascii_case(OVER_HOW_MANY_HOURS) {
                &mut thresholds.over_how_many_hours
            } else if element.id.eq_ignore_ascii_case(PERCENTAGE_OF_TIME) {
                &mut thresholds.percentage_of_time
            } else if element.id.eq_ignore_ascii_case(PERCENTAGE_OF_TIME_OFF) {
                &mut thresholds.percentage_of_time_off
            } else if element.id.eq_ignore_ascii_case(MIN_TRIGGER) {
                &mut thresholds.min_trigger
            } else if element.id.eq_ignore_ascii_case(MAX_TRIGGER) {
                &mut thresholds.max_trigger
            } else {
                debug!("rule {}: ignoring element {}", rule.id, element.id);
                continue;
            };
            *slot = Some(element.value);
        }

        if let Some(hours) = thresholds.over_how_many_hours {
            if hours <= 0.0 {
                return Err(invalid(format!("{OVER_HOW_MANY_HOURS} must be positive")));
            }
        }

        for (name, value) in [
            (PERCENTAGE_OF_TIME, thresholds.percentage_of_time),
            (PERCENTAGE_OF_TIME_OFF, thresholds.percentage_of_time_off),
        ] {
            if value.is_some_and(|v| !(0.0..=1.0).contains(&v)) {
                return Err(invalid(format!("{name} must be between 0 and 1")));
            }
        }

        if let (Some(min), Some(max)) = (thresholds.min_trigger, thresholds.max_trigger) {
            if min > max {
                return Err(invalid(format!(
                    "{MIN_TRIGGER} ({min}) is greater than {MAX_TRIGGER} ({max})"
                )));
            }
        }

        if rule.template == RuleTemplate::AnyHysteresis
            && thresholds.min_trigger.is_none()
            && thresholds.max_trigger.is_none()
        {
            return Err(invalid(format!(
                "any-hysteresis requires {MIN_TRIGGER} or {MAX_TRIGGER}"
            )));
        }

        Ok(thresholds)
    }

    /// Rolling window of the hysteresis detector
    pub fn window(&self) -> Option<Duration> {
        self.over_how_many_hours.map(hours)
    }

    /// How long a resolved insight stays quiet after re-faulting
    pub fn cooldown(&self, default: Duration) -> Duration {
        self.window().unwrap_or(default)
    }
}

/// Ten years
const MAX_HOURS: f64 = 87_600.0;

fn hours(value: f64) -> Duration {
    Duration::milliseconds((value.clamp(0.0, MAX_HOURS) * 3_600_000.0).round() as i64)
}
