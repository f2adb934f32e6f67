//! The per rule instance runtime
//!
//! An [`Actor`] owns every buffer of one rule instance, the result series
//! with its fault flags and the instance's insight. It is only ever touched
//! by one task at a time (the [`ActorManager`](super::manager::ActorManager)
//! keeps it behind a map entry lock) and never awaits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::hysteresis::{FaultTransition, HysteresisDetector};
use super::messages::RawData;
use crate::config::EngineConfig;
use crate::error::EvaluationError;
use crate::expressions::{BoundExpression, EvalContext, Sample};
use crate::insights::{Insight, InsightAggregator, InsightChange};
use crate::rules::{BoundParameter, CumulativeType, RESULT, RuleInstance};
use crate::timeseries::buffer::max_buffer_age;
use crate::timeseries::{AddOutcome, MAX_POINTS, TimeSeriesBuffer, TimedValue, TrajectoryCompressor};

/// Impact scores are clamped to +/- this value
pub const IMPACT_SCORE_LIMIT: f64 = 1.0e9;

/// Shared, read-only settings of every actor
#[derive(Debug, Clone, Copy)]
pub struct ActorSettings {
    pub compressor: Option<TrajectoryCompressor>,
    pub retention: Duration,
    pub aggregator: InsightAggregator,
}

impl ActorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            compressor: config.compressor(),
            retention: config.retention(),
            aggregator: InsightAggregator::new(config.default_cooldown()),
        }
    }
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Result series of an actor with its fault bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputValues {
    /// `result` samples, each carrying the detector's fault flag
    pub points: TimeSeriesBuffer,

    pub faulted: bool,

    /// Number of transitions into fault
    pub faulted_count: u64,

    pub first_faulted: Option<DateTime<Utc>>,

    /// Number of result samples that were "on"
    pub trigger_count: u64,

    /// Whether the latest result sample was "on"
    #[serde(default)]
    pub triggered: bool,

    /// Start of the latest run of "on" samples
    #[serde(default)]
    pub last_trigger_on_time: Option<DateTime<Utc>>,

    /// Start of the latest run of "off" samples
    #[serde(default)]
    pub last_trigger_off_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub impact_scores: HashMap<String, TimeSeriesBuffer>,

    #[serde(default)]
    pub latest_scores: BTreeMap<String, f64>,

    /// Most recent evaluation failure
    pub last_invalid: Option<String>,
}

impl OutputValues {
    /// Store a result sample and return the time the transition took
    /// effect: the start of the run of samples that caused it.
    ///
    /// `replaced` is the "on" state of a tail at the same timestamp.
    fn record(
        &mut self,
        point: TimedValue,
        transition: FaultTransition,
        on: bool,
        replaced: Option<bool>,
        compressor: Option<&TrajectoryCompressor>,
    ) -> DateTime<Utc> {
        let at = point.timestamp;
        self.points.upsert_point(point, compressor);

        match (replaced, on) {
            (None | Some(false), true) => self.trigger_count += 1,
            (Some(true), false) => self.trigger_count = self.trigger_count.saturating_sub(1),
            _ => {}
        }

        if on && (!self.triggered || self.last_trigger_on_time.is_none()) {
            self.last_trigger_on_time = Some(at);
        }
        if !on && (self.triggered || self.last_trigger_off_time.is_none()) {
            self.last_trigger_off_time = Some(at);
        }
        self.triggered = on;

        if transition == FaultTransition::StartsToFault {
            self.faulted_count += 1;
            self.first_faulted.get_or_insert(at);
        }
        self.faulted = transition.is_faulted();

        let effective = match transition {
            FaultTransition::StartsToFault => self.last_trigger_on_time,
            FaultTransition::BackToOk if !on => self.last_trigger_off_time,
            _ => None,
        };
        effective.filter(|t| *t <= at).unwrap_or(at)
    }
}

/// Persisted state of one actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    /// Same as the rule instance id
    pub id: String,
    pub rule_id: String,
    pub earliest_seen: Option<DateTime<Utc>>,

    /// Time of the last evaluation
    pub timestamp: Option<DateTime<Utc>>,

    /// Sensor and parameter buffers by name
    pub timed_values: HashMap<String, TimeSeriesBuffer>,

    pub output_values: OutputValues,
}

impl ActorState {
    pub fn new(id: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rule_id: rule_id.into(),
            earliest_seen: None,
            timestamp: None,
            timed_values: HashMap::new(),
            output_values: OutputValues::default(),
        }
    }

    /// Newest point of any buffer, the result series included
    pub fn newest_point(&self) -> Option<DateTime<Utc>> {
        self.timed_values
            .values()
            .chain(std::iter::once(&self.output_values.points))
            .chain(self.output_values.impact_scores.values())
            .filter_map(|buffer| buffer.last().map(|p| p.timestamp))
            .max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Instance failed to bind
    Skipped,

    /// `result` was not recomputed in this pass
    NoResult,

    Output {
        transition: FaultTransition,
        insight: InsightChange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No buffer of this actor is fed by the point's source
    Unrouted,

    Discarded(AddOutcome),

    Evaluated(EvaluationOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneResult {
    pub removed: usize,
    pub valid: bool,
}

/// Drop points older than `horizon` before the newest point of the whole
/// actor. The buffer's own newest point always survives.
pub fn prune_and_check_valid(
    buffer: &mut TimeSeriesBuffer,
    newest_known_point: DateTime<Utc>,
    variable_name: &str,
    horizon: Duration,
) -> PruneResult {
    let horizon = horizon.min(max_buffer_age());
    let removed = buffer.apply_limits(newest_known_point - horizon, Some(MAX_POINTS));
    if removed > 0 {
        trace!("pruned {removed} points of {variable_name}");
    }

    let valid = !buffer.is_empty() && buffer.is_in_order();
    if !valid {
        warn!("buffer {variable_name} is invalid after pruning");
    }

    PruneResult { removed, valid }
}

/// Apply the parameter's cumulative type against the sample before `at`.
fn accumulate(
    buffer: Option<&TimeSeriesBuffer>,
    parameter: &BoundParameter,
    sample: Sample,
    at: DateTime<Utc>,
) -> Sample {
    if parameter.cumulative_type == CumulativeType::Simple {
        return sample;
    }

    let previous = buffer.and_then(|buffer| buffer.last_before(at));
    let elapsed = previous.map_or(0.0, |p| (at - p.timestamp).num_milliseconds() as f64 / 1000.0);
    Sample::Number(
        parameter
            .cumulative_type
            .apply(previous.map(|p| p.value), sample.as_f64(), elapsed),
    )
}

/// NaN is dropped; infinities and huge magnitudes are clamped.
pub fn guard_impact_score(value: f64) -> Option<f64> {
    if value.is_nan() {
        return None;
    }
    Some(value.clamp(-IMPACT_SCORE_LIMIT, IMPACT_SCORE_LIMIT))
}

#[derive(Debug, Clone)]
pub struct Actor {
    instance: Arc<RuleInstance>,
    detector: HysteresisDetector,
    state: ActorState,
    insight: Option<Insight>,
    dirty: bool,
    insight_dirty: bool,
}

impl Actor {
    pub fn new(instance: Arc<RuleInstance>) -> Self {
        let state = ActorState::new(&instance.id, &instance.rule_id);
        Self::restore(instance, state, None)
    }

    /// Rebuild an actor from persisted state. Restored actors start clean.
    pub fn restore(
        instance: Arc<RuleInstance>,
        state: ActorState,
        insight: Option<Insight>,
    ) -> Self {
        Self {
            detector: HysteresisDetector::new(instance.template, instance.thresholds),
            instance,
            state,
            insight,
            dirty: false,
            insight_dirty: false,
        }
    }

    /// Swap in a regenerated instance, keeping all accumulated state.
    pub fn replace_instance(&mut self, instance: Arc<RuleInstance>) {
        self.detector = HysteresisDetector::new(instance.template, instance.thresholds);
        self.instance = instance;
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn instance(&self) -> &RuleInstance {
        &self.instance
    }

    pub fn shared_instance(&self) -> Arc<RuleInstance> {
        Arc::clone(&self.instance)
    }

    pub fn state(&self) -> &ActorState {
        &self.state
    }

    pub fn insight(&self) -> Option<&Insight> {
        self.insight.as_ref()
    }

    /// Mutate the insight on behalf of the command system.
    pub fn update_insight<R>(&mut self, f: impl FnOnce(&mut Insight) -> R) -> Option<R> {
        let insight = self.insight.as_mut()?;
        self.insight_dirty = true;
        Some(f(insight))
    }

    pub(crate) fn set_insight(&mut self, insight: Insight) {
        self.insight = Some(insight);
    }

    /// Has seen telemetry
    pub fn is_active(&self) -> bool {
        self.state.earliest_seen.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.insight_dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.insight_dirty = self.insight.is_some();
    }

    /// Clone what needs persisting and clear the dirty flags.
    pub fn take_snapshot(&mut self) -> (Option<ActorState>, Option<Insight>) {
        let state = self.dirty.then(|| self.state.clone());
        let insight = if self.insight_dirty {
            self.insight.clone()
        } else {
            None
        };
        self.dirty = false;
        self.insight_dirty = false;
        (state, insight)
    }

    pub fn ingest(
        &mut self,
        raw: &RawData,
        settings: &ActorSettings,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        let Some(name) = raw
            .source_key()
            .and_then(|key| self.instance.buffer_for(&key).map(str::to_string))
        else {
            return IngestOutcome::Unrouted;
        };

        let unit = self.instance.units.get(&name).cloned();
        let buffer = self
            .state
            .timed_values
            .entry(name.clone())
            .or_insert_with(|| TimeSeriesBuffer::with_unit(unit));

        let outcome = buffer.add_point(
            TimedValue::new(raw.source_timestamp, raw.value),
            settings.compressor.as_ref(),
        );
        self.dirty = true;

        match outcome {
            AddOutcome::OutOfOrder => {
                debug!(
                    "{}: discarding late point for {name} at {}",
                    self.state.id, raw.source_timestamp
                );
                return IngestOutcome::Discarded(outcome);
            }
            AddOutcome::Duplicate | AddOutcome::Rejected => {
                trace!("{}: {outcome:?} point for {name}", self.state.id);
                return IngestOutcome::Discarded(outcome);
            }
            AddOutcome::Appended | AddOutcome::Compressed | AddOutcome::Replaced => {
                buffer.record_latency(raw.source_timestamp, raw.enqueued_timestamp);
            }
        }

        let earliest = self.state.earliest_seen.get_or_insert(raw.source_timestamp);
        if raw.source_timestamp < *earliest {
            *earliest = raw.source_timestamp;
        }

        let changed = HashSet::from([name]);
        IngestOutcome::Evaluated(self.evaluate(raw.source_timestamp, changed, settings, now))
    }

    /// Recompute every parameter affected by `changed` (or depending on
    /// time), then the fault state, impact scores and insight.
    pub fn evaluate(
        &mut self,
        at: DateTime<Utc>,
        mut changed: HashSet<String>,
        settings: &ActorSettings,
        now: DateTime<Utc>,
    ) -> EvaluationOutcome {
        if !self.instance.is_ready() {
            return EvaluationOutcome::Skipped;
        }

        // evaluation time never moves backwards
        let at = self.state.timestamp.map_or(at, |last| at.max(last));
        let instance = Arc::clone(&self.instance);
        // computed series are read with step semantics
        let derived = settings.compressor.map(TrajectoryCompressor::for_steps);
        let compressor = derived.as_ref();
        let mut result = None;

        for parameter in &instance.parameters {
            let Some(expression) = parameter.expression() else {
                continue;
            };

            let triggered = expression.is_time_dependent()
                || expression.inputs().iter().any(|input| changed.contains(input));
            if !triggered {
                continue;
            }

            let sample = self
                .compute(expression, &parameter.field_id, at)
                .map(|sample| {
                    let history = self.state.timed_values.get(&parameter.field_id);
                    accumulate(history, parameter, sample, at)
                })
                .and_then(|sample| {
                    if sample.is_finite() {
                        Ok(sample)
                    } else {
                        Err(EvaluationError::NonFinite)
                    }
                });

            match sample {
                Ok(sample) => {
                    self.state
                        .timed_values
                        .entry(parameter.field_id.clone())
                        .or_insert_with(|| TimeSeriesBuffer::with_unit(parameter.units.clone()))
                        .upsert_point(sample.to_timed_value(at), compressor);
                    changed.insert(parameter.field_id.clone());
                    if parameter.is_result() {
                        result = Some(sample);
                    }
                }
                Err(err) => self.record_invalid(&parameter.field_id, &err),
            }
        }

        self.state.timestamp = Some(at);
        self.dirty = true;

        let Some(sample) = result else {
            return EvaluationOutcome::NoResult;
        };

        let point = sample.to_timed_value(at);
        let output = &mut self.state.output_values;
        let transition = self.detector.evaluate(&output.points, &point, output.faulted);
        let point = point.with_faulted(transition.is_faulted());
        let replaced = output
            .points
            .last()
            .filter(|tail| tail.timestamp == at)
            .map(|tail| self.detector.is_on(tail));
        let effective = output.record(
            point,
            transition,
            self.detector.is_on(&point),
            replaced,
            compressor,
        );

        self.evaluate_impact_scores(at, compressor);

        let change = settings
            .aggregator
            .apply_at(&mut self.insight, &instance, &point, effective, now);
        if let Some(insight) = self.insight.as_mut() {
            if insight.impact_scores != self.state.output_values.latest_scores {
                insight.impact_scores = self.state.output_values.latest_scores.clone();
                self.insight_dirty = true;
            }
        }
        if change.is_change() {
            self.insight_dirty = true;
        }

        EvaluationOutcome::Output {
            transition,
            insight: change,
        }
    }

    fn compute(
        &self,
        expression: &BoundExpression,
        field_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Sample, EvaluationError> {
        let delta = self
            .state
            .timed_values
            .get(field_id)
            .map_or(0.0, |buffer| buffer.seconds_since_last(at));
        let context = EvalContext::new(at, &self.state.timed_values).with_delta_time(delta);
        expression.evaluate(&context)
    }

    fn evaluate_impact_scores(
        &mut self,
        at: DateTime<Utc>,
        compressor: Option<&TrajectoryCompressor>,
    ) {
        let instance = Arc::clone(&self.instance);
        for score in &instance.impact_scores {
            let Some(expression) = score.expression() else {
                continue;
            };

            let value = match self.compute(expression, &score.field_id, at) {
                Ok(sample) => sample.as_f64(),
                Err(err) => {
                    self.record_invalid(&score.field_id, &err);
                    continue;
                }
            };

            let Some(guarded) = guard_impact_score(value) else {
                trace!("{}: dropping NaN impact score {}", self.state.id, score.field_id);
                continue;
            };

            let output = &mut self.state.output_values;
            let buffer = output
                .impact_scores
                .entry(score.field_id.clone())
                .or_insert_with(|| TimeSeriesBuffer::with_unit(score.units.clone()));
            let accumulated = accumulate(Some(&*buffer), score, Sample::Number(guarded), at);
            let Some(score_value) = guard_impact_score(accumulated.as_f64()) else {
                continue;
            };
            buffer.upsert_point(TimedValue::new(at, score_value), compressor);
            output.latest_scores.insert(score.field_id.clone(), score_value);
        }
    }

    fn record_invalid(&mut self, field_id: &str, err: &EvaluationError) {
        trace!("{}: {field_id} could not be evaluated: {err}", self.state.id);
        self.state.output_values.last_invalid = Some(format!("{field_id}: {err}"));
    }

    /// Prune every buffer relative to the newest point of the actor.
    /// Returns the number of points removed.
    pub fn prune(&mut self, retention: Duration) -> usize {
        let Some(newest) = self.state.newest_point() else {
            return 0;
        };
        let horizon = retention.max(self.instance.required_history());

        let mut removed = 0;
        self.state.timed_values.retain(|name, buffer| {
            let result = prune_and_check_valid(buffer, newest, name, horizon);
            removed += result.removed;
            result.valid
        });

        let output = &mut self.state.output_values;
        removed += prune_and_check_valid(&mut output.points, newest, RESULT, horizon).removed;
        output.impact_scores.retain(|name, buffer| {
            let result = prune_and_check_valid(buffer, newest, name, horizon);
            removed += result.removed;
            result.valid
        });

        removed
    }
}
