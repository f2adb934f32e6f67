//! Message types for the engine's tasks
//!
//! Telemetry flows to partition workers as plain [`RawData`]; everything
//! else is a command carrying a oneshot `respond_to` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::PersistenceError;
use crate::twins;

/// One telemetry point as delivered by the ingestion source
///
/// Delivery is at-least-once and may be out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawData {
    pub source_timestamp: DateTime<Utc>,

    pub enqueued_timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    pub value: f64,
}

impl RawData {
    pub fn with_trend_id(
        trend_id: impl Into<String>,
        source_timestamp: DateTime<Utc>,
        enqueued_timestamp: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            source_timestamp,
            enqueued_timestamp,
            trend_id: Some(trend_id.into()),
            connector_id: None,
            external_id: None,
            value,
        }
    }

    pub fn with_external_id(
        connector_id: impl Into<String>,
        external_id: impl Into<String>,
        source_timestamp: DateTime<Utc>,
        enqueued_timestamp: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            source_timestamp,
            enqueued_timestamp,
            trend_id: None,
            connector_id: Some(connector_id.into()),
            external_id: Some(external_id.into()),
            value,
        }
    }

    /// Same key a [`TwinBinding`](crate::twins::TwinBinding) produces
    pub fn source_key(&self) -> Option<String> {
        twins::source_key(
            self.trend_id.as_deref(),
            self.connector_id.as_deref(),
            self.external_id.as_deref(),
        )
    }
}

/// What a partition worker has seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,

    /// Points that reached at least one actor
    pub routed: u64,
}

#[derive(Debug)]
pub enum WorkerCommand {
    /// Answered once every telemetry point sent before it has been ingested
    Sync {
        respond_to: oneshot::Sender<WorkerStats>,
    },

    Shutdown,
}

/// Outcome of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub actors_written: usize,
    pub insights_written: usize,
    pub points_pruned: usize,
    pub batches: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
pub enum FlushCommand {
    FlushNow {
        respond_to: oneshot::Sender<Result<FlushReport, PersistenceError>>,
    },

    /// Final flush, then stop
    Shutdown {
        respond_to: oneshot::Sender<Result<FlushReport, PersistenceError>>,
    },
}
