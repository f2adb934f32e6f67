//! Turns output samples of an actor into insight updates

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use super::{Insight, InsightStatus};
use crate::rules::RuleInstance;
use crate::timeseries::TimedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightChange {
    Unchanged,

    /// First fault of the instance
    Created,

    OccurrenceOpened,

    OccurrenceClosed,

    /// A resolved insight faulted again and is gated by the cooldown
    Reopened,

    /// Still faulted; dates refreshed
    Updated,
}

impl InsightChange {
    pub fn is_change(self) -> bool {
        self != InsightChange::Unchanged
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InsightAggregator {
    default_cooldown: Duration,
}

impl InsightAggregator {
    pub fn new(default_cooldown: Duration) -> Self {
        Self { default_cooldown }
    }

    pub fn cooldown(&self, instance: &RuleInstance) -> Duration {
        instance.thresholds.cooldown(self.default_cooldown)
    }

    /// Apply one output sample; `sample.faulted` carries the detector's verdict.
    pub fn apply(
        &self,
        slot: &mut Option<Insight>,
        instance: &RuleInstance,
        sample: &TimedValue,
        now: DateTime<Utc>,
    ) -> InsightChange {
        self.apply_at(slot, instance, sample, sample.timestamp, now)
    }

    /// Like [`apply`](Self::apply), but an occurrence opened or closed by this
    /// sample starts or ends at `effective` instead of the sample time.
    pub fn apply_at(
        &self,
        slot: &mut Option<Insight>,
        instance: &RuleInstance,
        sample: &TimedValue,
        effective: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> InsightChange {
        let faulted = sample.faulted == Some(true);
        let at = effective.min(sample.timestamp);

        let Some(insight) = slot.as_mut() else {
            if !faulted {
                return InsightChange::Unchanged;
            }

            let mut insight =
                Insight::new(&instance.id, &instance.rule_id, &instance.equipment_id, now);
            insight.rule_name = instance.rule_name.clone();
            insight.command_enabled = instance.command_enabled;
            insight.open_occurrence(at);
            debug!("{}: insight created", instance.id);
            *slot = Some(insight);
            return InsightChange::Created;
        };

        insight.command_enabled = instance.command_enabled;

        let change = match (insight.is_faulty(), faulted) {
            (false, false) => InsightChange::Unchanged,
            (true, true) => {
                insight.last_faulted_date = Some(sample.timestamp);
                InsightChange::Updated
            }
            (true, false) => {
                insight.close_occurrence(at);
                if matches!(
                    insight.status,
                    InsightStatus::New | InsightStatus::Open | InsightStatus::InProgress
                ) {
                    insight.status = InsightStatus::ReadyToResolve;
                }
                trace!("{}: occurrence closed at {at}", instance.id);
                InsightChange::OccurrenceClosed
            }
            (false, true) => {
                insight.open_occurrence(at);
                match insight.status {
                    InsightStatus::Resolved => {
                        insight.next_allowed_sync_date =
                            insight.last_sync_date + self.cooldown(instance);
                        insight.status = InsightStatus::Open;
                        debug!(
                            "{}: reopened, next sync allowed at {}",
                            instance.id, insight.next_allowed_sync_date
                        );
                        InsightChange::Reopened
                    }
                    InsightStatus::ReadyToResolve => {
                        insight.status = InsightStatus::Open;
                        InsightChange::OccurrenceOpened
                    }
                    _ => InsightChange::OccurrenceOpened,
                }
            }
        };

        if change.is_change() {
            insight.last_updated = now;
        }

        change
    }
}
