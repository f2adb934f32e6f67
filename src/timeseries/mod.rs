//! Time-series primitives used by every actor
//!
//! A [`TimeSeriesBuffer`] holds the ordered history of one named variable
//! (a sensor, an intermediate parameter or the rule result). Buffers are
//! append-only in time, optionally compressed on insert and pruned by age
//! during flush.

pub mod buffer;
pub mod compression;
pub mod latency;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use buffer::{AddOutcome, Aggregation, MAX_POINTS, TimeSeriesBuffer};
pub use compression::{CompressionMode, TrajectoryCompressor};
pub use latency::LatencyEstimator;

/// A single timestamped sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub timestamp: DateTime<Utc>,

    pub value: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_bool: Option<bool>,

    /// Set on output samples by the hysteresis detector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faulted: Option<bool>,
}

impl TimedValue {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            value_bool: None,
            faulted: None,
        }
    }

    pub fn from_bool(timestamp: DateTime<Utc>, value: bool) -> Self {
        Self {
            timestamp,
            value: if value { 1.0 } else { 0.0 },
            value_bool: Some(value),
            faulted: None,
        }
    }

    pub fn with_faulted(mut self, faulted: bool) -> Self {
        self.faulted = Some(faulted);
        self
    }

    /// Truthiness of the sample: the boolean if present, otherwise non-zero.
    pub fn is_on(&self) -> bool {
        self.value_bool.unwrap_or(self.value != 0.0)
    }

    /// Same represented state, ignoring the timestamp
    pub fn is_the_same(&self, other: &TimedValue) -> bool {
        self.value == other.value
            && self.value_bool == other.value_bool
            && self.faulted == other.faulted
    }

    /// Whether the sample can be stored at all.
    pub fn is_storable(&self) -> bool {
        self.value.is_finite()
            && self.timestamp != DateTime::<Utc>::MIN_UTC
            && self.timestamp != DateTime::<Utc>::MAX_UTC
    }
}
