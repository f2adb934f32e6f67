//! Sustained-fault detection over a rolling window

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::{RuleTemplate, RuleThresholds};
use crate::timeseries::{TimeSeriesBuffer, TimedValue};

/// How the fault state moved with one output sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultTransition {
    /// Not faulted before, not faulted now
    Ok,

    StillFaulted,

    StartsToFault,

    BackToOk,
}

impl FaultTransition {
    pub fn from_states(was_faulted: bool, is_faulted: bool) -> Self {
        match (was_faulted, is_faulted) {
            (false, false) => FaultTransition::Ok,
            (true, true) => FaultTransition::StillFaulted,
            (false, true) => FaultTransition::StartsToFault,
            (true, false) => FaultTransition::BackToOk,
        }
    }

    pub fn is_faulted(self) -> bool {
        matches!(
            self,
            FaultTransition::StillFaulted | FaultTransition::StartsToFault
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisDetector {
    template: RuleTemplate,
    thresholds: RuleThresholds,
}

impl HysteresisDetector {
    pub fn new(template: RuleTemplate, thresholds: RuleThresholds) -> Self {
        Self {
            template,
            thresholds,
        }
    }

    /// Whether a result sample counts as "on"
    ///
    /// With a trigger band the value must lie outside `[min, max]`.
    pub fn is_on(&self, sample: &TimedValue) -> bool {
        let banded = self.template == RuleTemplate::AnyHysteresis
            || self.thresholds.min_trigger.is_some()
            || self.thresholds.max_trigger.is_some();
        if !banded {
            return sample.is_on();
        }

        let value = sample.value;
        self.thresholds.min_trigger.is_some_and(|min| value < min)
            || self.thresholds.max_trigger.is_some_and(|max| value > max)
    }

    /// Decide the fault state for `next`, given the result history before it.
    ///
    /// The fraction uses step semantics: each sample holds until the
    /// following one. A point of `history` at `next`'s timestamp is about to
    /// be replaced and holds for no time. `next` itself only decides while
    /// nothing was observed before it.
    pub fn evaluate(
        &self,
        history: &TimeSeriesBuffer,
        next: &TimedValue,
        was_faulted: bool,
    ) -> FaultTransition {
        let faulted = match self.thresholds.window() {
            None => self.is_on(next),
            Some(window) => {
                let on = self.on_fraction(history, next, next.timestamp - window, next.timestamp);
                self.decide(on, was_faulted)
            }
        };

        FaultTransition::from_states(was_faulted, faulted)
    }

    fn on_fraction(
        &self,
        history: &TimeSeriesBuffer,
        next: &TimedValue,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> f64 {
        let fallback = if self.is_on(next) { 1.0 } else { 0.0 };
        let observed = history.first().is_some_and(|first| first.timestamp < end);
        match history.time_weighted_fraction(start, end, |p| self.is_on(p)) {
            Some(fraction) if observed => fraction,
            _ => fallback,
        }
    }

    fn decide(&self, on: f64, was_faulted: bool) -> bool {
        let enter = self.thresholds.percentage_of_time.unwrap_or(0.0);
        let enters = on > 0.0 && on >= enter;

        if !was_faulted {
            return enters;
        }

        match self.thresholds.percentage_of_time_off {
            Some(exit) => {
                let off = 1.0 - on;
                !(off > 0.0 && off >= exit)
            }
            None => enters,
        }
    }
}
