//! Twin bindings and the present-value lookup collaborator
//!
//! A [`TwinBinding`] names one digital twin (an equipment or one of its
//! sensors) together with the identifiers of the physical telemetry point
//! feeding it. Rules are bound against an [`EquipmentBinding`]: the
//! equipment twin plus its sensors.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::actors::messages::RawData;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinBinding {
    /// Logical role, e.g. "sensor" or "setpoint"
    pub role: String,

    pub model_id: String,

    pub twin_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl TwinBinding {
    pub fn new(
        role: impl Into<String>,
        model_id: impl Into<String>,
        twin_id: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            model_id: model_id.into(),
            twin_id: twin_id.into(),
            ..Self::default()
        }
    }

    pub fn with_trend_id(mut self, trend_id: impl Into<String>) -> Self {
        self.trend_id = Some(trend_id.into());
        self
    }

    pub fn with_external_id(
        mut self,
        connector_id: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        self.connector_id = Some(connector_id.into());
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Key under which telemetry for this twin arrives, if it has any
    pub fn source_key(&self) -> Option<String> {
        source_key(
            self.trend_id.as_deref(),
            self.connector_id.as_deref(),
            self.external_id.as_deref(),
        )
    }

    /// Whether a bracketed reference or bare name designates this twin
    pub fn matches(&self, reference: &str) -> bool {
        self.model_id == reference || self.role == reference || self.twin_id == reference
    }
}

/// Trend id when present, otherwise `connector:external`, lower-cased
pub fn source_key(
    trend_id: Option<&str>,
    connector_id: Option<&str>,
    external_id: Option<&str>,
) -> Option<String> {
    if let Some(trend_id) = trend_id.filter(|id| !id.is_empty()) {
        return Some(trend_id.to_ascii_lowercase());
    }

    external_id.filter(|id| !id.is_empty()).map(|external_id| {
        format!("{}:{}", connector_id.unwrap_or_default(), external_id).to_ascii_lowercase()
    })
}

/// An equipment twin with the sensors bound to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentBinding {
    pub equipment: TwinBinding,

    #[serde(default)]
    pub sensors: Vec<TwinBinding>,
}

impl EquipmentBinding {
    pub fn new(equipment: TwinBinding, sensors: Vec<TwinBinding>) -> Self {
        Self { equipment, sensors }
    }
}

/// Current value lookup, used outside the ingest path
#[async_trait]
pub trait TwinInfoService: Send + Sync {
    async fn get_present_value(&self, external_ids: &[String]) -> HashMap<String, Option<f64>>;
}

/// Latest raw value per external id (or trend id)
#[derive(Debug, Default)]
pub struct PresentValueCache {
    values: DashMap<String, f64>,
}

impl PresentValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, raw: &RawData) {
        let Some(id) = raw.external_id.as_ref().or(raw.trend_id.as_ref()) else {
            return;
        };
        if raw.value.is_finite() {
            self.values.insert(id.clone(), raw.value);
        }
    }
}

#[async_trait]
impl TwinInfoService for PresentValueCache {
    async fn get_present_value(&self, external_ids: &[String]) -> HashMap<String, Option<f64>> {
        trace!("looking up present value of {} points", external_ids.len());
        external_ids
            .iter()
            .map(|id| (id.clone(), self.values.get(id).map(|value| *value)))
            .collect()
    }
}
