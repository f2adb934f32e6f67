//! Records exchanged with the storage backends
//!
//! Actor states and insights are stored as JSON bodies keyed by id. Only
//! the columns needed for lookups (rule id, status, timestamps) are kept
//! outside the body.

use chrono::{DateTime, Utc};

use crate::actors::actor::ActorState;
use crate::insights::Insight;

/// One unit of work written by a flush
///
/// Backends write a batch atomically: either every record lands or none.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    pub actor_states: Vec<ActorState>,
    pub insights: Vec<Insight>,
}

impl FlushBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.actor_states.is_empty() && self.insights.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actor_states.len() + self.insights.len()
    }

    /// Ids of every actor with a record in this batch
    pub fn actor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .actor_states
            .iter()
            .map(|state| state.id.clone())
            .chain(self.insights.iter().map(|insight| insight.rule_instance_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Acknowledgement of a written batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushAck {
    pub actor_states: usize,
    pub insights: usize,
    pub written_at: DateTime<Utc>,
}
