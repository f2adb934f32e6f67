//! Trajectory compression for buffer inserts
//!
//! When a new point arrives, the current tail is dropped if it lies on the
//! straight line between the point before it (the anchor) and the new point,
//! within a tolerance relative to the magnitude of the values. Constant runs
//! therefore collapse to their first and most recent sample.
//!
//! Computed series are read with step semantics, where interpolation would
//! rewrite history. Those use [`CompressionMode::Steps`], which only drops a
//! tail repeating its anchor.

use serde::{Deserialize, Serialize};

use super::TimedValue;

/// Default tolerance, in percent of the value magnitude
pub const DEFAULT_TOLERANCE_PERCENT: f64 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Drop a tail lying on the line from its anchor to the new point
    #[default]
    Trajectory,

    /// Drop a tail only when it repeats its anchor exactly
    Steps,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryCompressor {
    tolerance_percent: f64,

    #[serde(default)]
    mode: CompressionMode,
}

impl Default for TrajectoryCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_PERCENT)
    }
}

impl TrajectoryCompressor {
    pub fn new(tolerance_percent: f64) -> Self {
        Self {
            tolerance_percent: tolerance_percent.max(0.0),
            mode: CompressionMode::Trajectory,
        }
    }

    /// Same compressor restricted to repeated values
    pub fn for_steps(self) -> Self {
        Self {
            mode: CompressionMode::Steps,
            ..self
        }
    }

    pub fn tolerance_percent(&self) -> f64 {
        self.tolerance_percent
    }

    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    /// Returns true when `tail` carries no information beyond `anchor` and `next`.
    pub fn is_redundant(&self, anchor: &TimedValue, tail: &TimedValue, next: &TimedValue) -> bool {
        if self.mode == CompressionMode::Steps {
            return anchor.is_the_same(tail);
        }

        if anchor.faulted != tail.faulted || tail.faulted != next.faulted {
            return false;
        }

        match (anchor.value_bool, tail.value_bool, next.value_bool) {
            (None, None, None) => {}
            (Some(a), Some(t), Some(n)) => return a == t && t == n,
            _ => return false,
        }

        let span = (next.timestamp - anchor.timestamp).num_milliseconds() as f64;
        if span <= 0.0 {
            return false;
        }

        let offset = (tail.timestamp - anchor.timestamp).num_milliseconds() as f64;
        let projected = anchor.value + (next.value - anchor.value) * (offset / span);

        let magnitude = anchor.value.abs().max(tail.value.abs()).max(next.value.abs());
        let tolerance = magnitude * self.tolerance_percent / 100.0;

        (projected - tail.value).abs() <= tolerance
    }
}
