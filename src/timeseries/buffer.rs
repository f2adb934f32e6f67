use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{LatencyEstimator, TimedValue, TrajectoryCompressor};

/// Hard cap on points held by a single buffer
pub const MAX_POINTS: usize = 2500;

/// Upper bound for any retention horizon
pub fn max_buffer_age() -> Duration {
    Duration::days(365)
}

/// Result of inserting a point into a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended as a new tail
    Appended,

    /// Replaced the previous tail (which carried no extra information)
    Compressed,

    /// Overwrote a tail with the same timestamp
    Replaced,

    /// Same timestamp as the current tail
    Duplicate,

    /// Older than the current tail; discarded
    OutOfOrder,

    /// Non-finite value or unrepresentable timestamp
    Rejected,
}

impl AddOutcome {
    pub fn is_stored(self) -> bool {
        matches!(
            self,
            AddOutcome::Appended | AddOutcome::Compressed | AddOutcome::Replaced
        )
    }
}

/// Windowed aggregations available to temporal expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Average,
    Min,
    Max,
    Count,
    Sum,
    Any,
    All,
    Delta,
    StandardDeviation,
}

impl Aggregation {
    pub fn from_name(name: &str) -> Option<Self> {
        let aggregation = match name.to_ascii_uppercase().as_str() {
            "AVERAGE" | "AVG" => Aggregation::Average,
            "MIN" => Aggregation::Min,
            "MAX" => Aggregation::Max,
            "COUNT" => Aggregation::Count,
            "SUM" => Aggregation::Sum,
            "ANY" => Aggregation::Any,
            "ALL" => Aggregation::All,
            "DELTA" => Aggregation::Delta,
            "STND" => Aggregation::StandardDeviation,
            _ => return None,
        };
        Some(aggregation)
    }
}

/// Ordered, bounded history of one variable
///
/// Timestamps are strictly increasing. Late and duplicate points are
/// discarded and counted rather than re-sorted into the history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesBuffer {
    points: VecDeque<TimedValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<String>,

    #[serde(default)]
    latency: LatencyEstimator,

    #[serde(default)]
    discarded: u64,
}

impl TimeSeriesBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(unit: Option<String>) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn set_unit(&mut self, unit: Option<String>) {
        if unit.is_some() {
            self.unit = unit;
        }
    }

    /// Insert a point, compressing the tail when a compressor is given.
    pub fn add_point(
        &mut self,
        point: TimedValue,
        compressor: Option<&TrajectoryCompressor>,
    ) -> AddOutcome {
        if !point.is_storable() {
            self.discarded += 1;
            return AddOutcome::Rejected;
        }

        if let Some(last) = self.points.back() {
            if point.timestamp == last.timestamp {
                self.discarded += 1;
                return AddOutcome::Duplicate;
            }
            if point.timestamp < last.timestamp {
                self.discarded += 1;
                return AddOutcome::OutOfOrder;
            }
        }

        let len = self.points.len();
        if let Some(compressor) = compressor {
            if len >= 2
                && compressor.is_redundant(&self.points[len - 2], &self.points[len - 1], &point)
            {
                self.points[len - 1] = point;
                return AddOutcome::Compressed;
            }
        }

        self.points.push_back(point);
        if self.points.len() > MAX_POINTS {
            self.points.pop_front();
        }

        AddOutcome::Appended
    }

    /// Like [`add_point`](Self::add_point), but a point at the tail's
    /// timestamp overwrites the tail. Used for computed series.
    pub fn upsert_point(
        &mut self,
        point: TimedValue,
        compressor: Option<&TrajectoryCompressor>,
    ) -> AddOutcome {
        if point.is_storable() {
            if let Some(last) = self.points.back_mut() {
                if last.timestamp == point.timestamp {
                    *last = point;
                    return AddOutcome::Replaced;
                }
            }
        }
        self.add_point(point, compressor)
    }

    /// Feed an observed `enqueued - source` lag into the latency estimate.
    pub fn record_latency(&mut self, source: DateTime<Utc>, enqueued: DateTime<Utc>) {
        let lag = (enqueued - source).num_milliseconds() as f64 / 1000.0;
        self.latency.update(lag);
    }

    pub fn latency(&self) -> Duration {
        self.latency.as_duration()
    }

    pub fn latency_estimator(&self) -> &LatencyEstimator {
        &self.latency
    }

    /// Number of points rejected, duplicated or arriving out of order
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&TimedValue> {
        self.points.front()
    }

    pub fn last(&self) -> Option<&TimedValue> {
        self.points.back()
    }

    pub fn last_value(&self) -> Option<f64> {
        self.points.back().map(|point| point.value)
    }

    pub fn points(&self) -> impl Iterator<Item = &TimedValue> {
        self.points.iter()
    }

    pub fn points_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &TimedValue> {
        self.points
            .iter()
            .filter(move |p| p.timestamp >= start && p.timestamp <= end)
    }

    /// Seconds between the last two points
    pub fn last_delta_secs(&self) -> Option<f64> {
        let len = self.points.len();
        if len < 2 {
            return None;
        }
        let delta = self.points[len - 1].timestamp - self.points[len - 2].timestamp;
        Some(delta.num_milliseconds() as f64 / 1000.0)
    }

    /// Seconds from the tail to `at`, zero for an empty buffer
    pub fn seconds_since_last(&self, at: DateTime<Utc>) -> f64 {
        self.points.back().map_or(0.0, |last| {
            ((at - last.timestamp).num_milliseconds() as f64 / 1000.0).max(0.0)
        })
    }

    pub fn is_in_order(&self) -> bool {
        self.points
            .iter()
            .zip(self.points.iter().skip(1))
            .all(|(a, b)| a.timestamp < b.timestamp)
    }

    /// The point in effect at `at` (step semantics).
    pub fn value_at(&self, at: DateTime<Utc>) -> Option<&TimedValue> {
        let idx = self.points.partition_point(|p| p.timestamp <= at);
        if idx == 0 { None } else { self.points.get(idx - 1) }
    }

    /// The newest point strictly before `at`
    pub fn last_before(&self, at: DateTime<Utc>) -> Option<&TimedValue> {
        let idx = self.points.partition_point(|p| p.timestamp < at);
        idx.checked_sub(1).and_then(|idx| self.points.get(idx))
    }

    /// Remove points older than `min_date`, never dropping the newest point,
    /// then trim from the front down to `max_count`. Returns the number removed.
    pub fn apply_limits(&mut self, min_date: DateTime<Utc>, max_count: Option<usize>) -> usize {
        let mut removed = 0;

        while self.points.len() > 1
            && self
                .points
                .front()
                .is_some_and(|point| point.timestamp < min_date)
        {
            self.points.pop_front();
            removed += 1;
        }

        let cap = max_count.unwrap_or(MAX_POINTS).clamp(1, MAX_POINTS);
        while self.points.len() > cap {
            self.points.pop_front();
            removed += 1;
        }

        removed
    }

    /// Points in effect over `[start, end]` with how many seconds each held.
    fn segments(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(&TimedValue, f64)> {
        let mut segments = Vec::new();
        if end < start {
            return segments;
        }

        let first = self
            .points
            .partition_point(|p| p.timestamp <= start)
            .saturating_sub(1);
        let upper = self.points.partition_point(|p| p.timestamp <= end);

        for idx in first..upper {
            let point = &self.points[idx];
            let segment_start = point.timestamp.max(start);
            let segment_end = if idx + 1 < upper {
                self.points[idx + 1].timestamp.min(end)
            } else {
                end
            };
            let secs = (segment_end - segment_start).num_milliseconds() as f64 / 1000.0;
            segments.push((point, secs.max(0.0)));
        }

        segments
    }

    /// Time-weighted share of `[start, end]` during which `predicate` held.
    ///
    /// Only the observed part of the window counts. When the window has no
    /// duration yet, the latest point alone decides.
    pub fn time_weighted_fraction<F>(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        predicate: F,
    ) -> Option<f64>
    where
        F: Fn(&TimedValue) -> bool,
    {
        let segments = self.segments(start, end);
        let (last, _) = segments.last()?;

        let total: f64 = segments.iter().map(|(_, secs)| secs).sum();
        if total <= 0.0 {
            return Some(if predicate(last) { 1.0 } else { 0.0 });
        }

        let on: f64 = segments
            .iter()
            .filter(|(point, _)| predicate(point))
            .map(|(_, secs)| secs)
            .sum();

        Some(on / total)
    }

    /// Aggregate the window `[start, end]`. `None` means insufficient data.
    pub fn aggregate(
        &self,
        aggregation: Aggregation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<f64> {
        let in_range = || self.points_in_range(start, end);

        let segments = self.segments(start, end);

        let value = match aggregation {
            Aggregation::Count => in_range().count() as f64,
            Aggregation::Sum => in_range().map(|p| p.value).sum(),
            _ if segments.is_empty() => return None,
            Aggregation::Average => {
                let total: f64 = segments.iter().map(|(_, secs)| secs).sum();
                if total <= 0.0 {
                    segments[segments.len() - 1].0.value
                } else {
                    segments.iter().map(|(p, secs)| p.value * secs).sum::<f64>() / total
                }
            }
            Aggregation::Min => segments
                .iter()
                .map(|(p, _)| p.value)
                .fold(f64::INFINITY, f64::min),
            Aggregation::Max => segments
                .iter()
                .map(|(p, _)| p.value)
                .fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Any => bool_value(segments.iter().any(|(p, _)| p.is_on())),
            Aggregation::All => bool_value(segments.iter().all(|(p, _)| p.is_on())),
            Aggregation::Delta => segments[segments.len() - 1].0.value - segments[0].0.value,
            Aggregation::StandardDeviation => {
                let n = segments.len() as f64;
                let mean = segments.iter().map(|(p, _)| p.value).sum::<f64>() / n;
                let variance = segments
                    .iter()
                    .map(|(p, _)| (p.value - mean).powi(2))
                    .sum::<f64>()
                    / n;
                variance.sqrt()
            }
        };

        Some(value)
    }
}

fn bool_value(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}
