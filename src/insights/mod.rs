//! Insights: the durable record of a rule instance's faults
//!
//! One [`Insight`] exists per rule instance once it has faulted at least
//! once. Each contiguous faulted interval is an [`Occurrence`].

pub mod aggregator;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use aggregator::{InsightAggregator, InsightChange};

/// Oldest closed occurrences are dropped beyond this
pub const MAX_OCCURRENCES: usize = 250;

/// A synced insight is refreshed at least this often
pub fn sync_refresh_interval() -> Duration {
    Duration::hours(6)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    #[default]
    New,
    Open,
    InProgress,
    ReadyToResolve,
    Resolved,
    Ignored,
    Deleted,
}

impl InsightStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InsightStatus::New => "new",
            InsightStatus::Open => "open",
            InsightStatus::InProgress => "in_progress",
            InsightStatus::ReadyToResolve => "ready_to_resolve",
            InsightStatus::Resolved => "resolved",
            InsightStatus::Ignored => "ignored",
            InsightStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub started: DateTime<Utc>,

    /// `None` while ongoing
    pub ended: Option<DateTime<Utc>>,

    pub is_faulted: bool,
}

impl Occurrence {
    pub fn open(started: DateTime<Utc>) -> Self {
        Self {
            started,
            ended: None,
            is_faulted: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended.is_none()
    }

    /// Length of a closed occurrence, or up to `now` for an open one
    pub fn length(&self, now: DateTime<Utc>) -> Duration {
        self.ended.unwrap_or(now) - self.started
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// Same as the rule instance id
    pub id: String,
    pub rule_id: String,
    pub rule_instance_id: String,
    pub rule_name: String,
    pub equipment_id: String,
    pub status: InsightStatus,
    pub occurrences: Vec<Occurrence>,

    /// `MIN_UTC` until first synced; stored as epoch millis
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_sync_date: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub next_allowed_sync_date: DateTime<Utc>,

    pub faulted_count: u64,
    pub earliest_faulted_date: Option<DateTime<Utc>>,
    pub last_faulted_date: Option<DateTime<Utc>>,

    /// Latest guarded impact scores by field id
    #[serde(default)]
    pub impact_scores: BTreeMap<String, f64>,

    pub command_enabled: bool,
    pub last_updated: DateTime<Utc>,
}

impl Insight {
    pub fn new(
        id: impl Into<String>,
        rule_id: impl Into<String>,
        equipment_id: impl Into<String>,
        created: DateTime<Utc>,
    ) -> Self {
        let id = id.into();
        Self {
            rule_instance_id: id.clone(),
            id,
            rule_id: rule_id.into(),
            rule_name: String::new(),
            equipment_id: equipment_id.into(),
            status: InsightStatus::New,
            occurrences: Vec::new(),
            last_sync_date: DateTime::<Utc>::MIN_UTC,
            next_allowed_sync_date: DateTime::<Utc>::MIN_UTC,
            faulted_count: 0,
            earliest_faulted_date: None,
            last_faulted_date: None,
            impact_scores: BTreeMap::new(),
            command_enabled: false,
            last_updated: created,
        }
    }

    /// Has an open occurrence
    pub fn is_faulty(&self) -> bool {
        self.occurrences.last().is_some_and(Occurrence::is_open)
    }

    pub fn has_synced(&self) -> bool {
        self.last_sync_date != DateTime::<Utc>::MIN_UTC
    }

    pub fn has_overlapping_occurrences(&self) -> bool {
        let malformed = self
            .occurrences
            .iter()
            .any(|o| o.ended.is_some_and(|ended| ended < o.started));

        malformed
            || self.occurrences.windows(2).any(|pair| match pair[0].ended {
                None => true,
                Some(ended) => ended > pair[1].started,
            })
    }

    pub(crate) fn open_occurrence(&mut self, at: DateTime<Utc>) {
        if self.is_faulty() {
            return;
        }
        // never start before the previous one ended
        let started = match self.occurrences.last().and_then(|o| o.ended) {
            Some(ended) if ended > at => ended,
            _ => at,
        };
        self.occurrences.push(Occurrence::open(started));
        self.faulted_count += 1;
        self.earliest_faulted_date.get_or_insert(started);
        self.last_faulted_date = Some(at);
        self.trim_occurrences();
    }

    pub(crate) fn close_occurrence(&mut self, at: DateTime<Utc>) {
        if let Some(open) = self.occurrences.last_mut().filter(|o| o.is_open()) {
            open.ended = Some(at.max(open.started));
        }
    }

    fn trim_occurrences(&mut self) {
        while self.occurrences.len() > MAX_OCCURRENCES
            && self.occurrences.first().is_some_and(|o| !o.is_open())
        {
            self.occurrences.remove(0);
        }
    }

    /// Whether the external command system should be notified now
    pub fn should_sync(&self, now: DateTime<Utc>) -> bool {
        if !self.command_enabled
            || matches!(self.status, InsightStatus::Ignored | InsightStatus::Deleted)
            || self.occurrences.is_empty()
            || now < self.next_allowed_sync_date
        {
            return false;
        }

        if !self.has_synced() || self.is_faulty() {
            return true;
        }

        let since_sync = now - self.last_sync_date;
        if since_sync > sync_refresh_interval() {
            return true;
        }

        self.occurrences
            .last()
            .is_some_and(|last| since_sync > last.length(now) / 4)
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.last_sync_date = at;
        self.last_updated = at;
    }

    /// The command system resolved the insight.
    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.status = InsightStatus::Resolved;
        self.mark_synced(at);
    }

    pub fn ignore(&mut self, at: DateTime<Utc>) {
        self.status = InsightStatus::Ignored;
        self.last_updated = at;
    }
}
