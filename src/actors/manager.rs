//! Owner of every actor
//!
//! The [`ActorManager`] keeps actors in a [`DashMap`]. Every operation on
//! one actor (ingest, prune, snapshot, instance replacement) runs under
//! that actor's entry lock, so different actors proceed in parallel while
//! one actor never sees two writers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use super::actor::{Actor, ActorSettings, ActorState, IngestOutcome};
use super::cancel::CancellationToken;
use super::messages::{FlushReport, RawData};
use crate::config::EngineConfig;
use crate::error::PersistenceError;
use crate::insights::Insight;
use crate::rules::RuleInstance;
use crate::storage::{FlushBatch, StorageBackend};
use crate::twins::PresentValueCache;

/// Outcome of registering a freshly generated set of instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    pub ready: usize,
    pub failed: usize,

    /// Actors dropped because their instance no longer exists
    pub removed: usize,
}

pub struct ActorManager {
    actors: DashMap<String, Actor>,

    /// Source key -> ids of the actors it feeds
    routes: DashMap<String, Vec<String>>,

    backend: Arc<dyn StorageBackend>,
    settings: ActorSettings,
    flush_lock: Mutex<()>,
    batch_size: usize,
    persistence_timeout: Duration,
    present_values: Arc<PresentValueCache>,
}

impl ActorManager {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &EngineConfig) -> Self {
        Self {
            actors: DashMap::new(),
            routes: DashMap::new(),
            backend,
            settings: ActorSettings::from_config(config),
            flush_lock: Mutex::new(()),
            batch_size: config.flush_batch_size.max(1),
            persistence_timeout: config.persistence_timeout(),
            present_values: Arc::new(PresentValueCache::new()),
        }
    }

    pub fn settings(&self) -> &ActorSettings {
        &self.settings
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    /// Latest raw values, for the present value lookup
    pub fn present_values(&self) -> Arc<PresentValueCache> {
        Arc::clone(&self.present_values)
    }

    /// Install a generated instance set. Existing actors keep their state
    /// and switch to the new instance; actors whose instance disappeared
    /// are dropped.
    #[instrument(skip_all, fields(instances = instances.len()))]
    pub fn register_instances(&self, instances: Vec<RuleInstance>) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        let ids: HashSet<String> = instances.iter().map(|i| i.id.clone()).collect();

        for instance in instances {
            if instance.is_ready() {
                report.ready += 1;
            } else {
                report.failed += 1;
                debug!(
                    "{} is not runnable: {}",
                    instance.id,
                    instance.scan_error.as_deref().unwrap_or("unknown error")
                );
            }

            let instance = Arc::new(instance);
            match self.actors.get_mut(&instance.id) {
                Some(mut actor) => actor.replace_instance(instance),
                None => {
                    self.actors
                        .insert(instance.id.clone(), Actor::new(instance));
                }
            }
        }

        let before = self.actors.len();
        self.actors.retain(|id, _| ids.contains(id));
        report.removed = before - self.actors.len();

        self.rebuild_routes();

        info!(
            "registered {} ready and {} failed instances, removed {} actors",
            report.ready, report.failed, report.removed
        );
        report
    }

    fn rebuild_routes(&self) {
        let mut routes: HashMap<String, Vec<String>> = HashMap::new();
        for entry in self.actors.iter() {
            let instance = entry.instance();
            if !instance.is_ready() {
                continue;
            }
            for key in instance.routes.keys() {
                routes
                    .entry(key.clone())
                    .or_default()
                    .push(instance.id.clone());
            }
        }

        self.routes.retain(|key, _| routes.contains_key(key));
        for (key, mut ids) in routes {
            ids.sort();
            self.routes.insert(key, ids);
        }
        debug!("{} telemetry sources routed", self.routes.len());
    }

    /// Attach persisted state to registered actors. States and insights of
    /// unknown instances are ignored; actors that already saw telemetry
    /// are left untouched.
    #[instrument(skip_all, fields(states = states.len(), insights = insights.len()))]
    pub fn restore(&self, states: Vec<ActorState>, insights: Vec<Insight>) -> usize {
        let mut insights: HashMap<String, Insight> = insights
            .into_iter()
            .map(|insight| (insight.rule_instance_id.clone(), insight))
            .collect();
        let mut restored = 0;

        for state in states {
            let Some(mut actor) = self.actors.get_mut(&state.id) else {
                trace!("no instance for stored state {}", state.id);
                continue;
            };
            if actor.is_active() {
                continue;
            }

            let insight = insights.remove(&state.id);
            let instance = actor.shared_instance();
            *actor = Actor::restore(instance, state, insight);
            restored += 1;
        }

        for (id, insight) in insights {
            if let Some(mut actor) = self.actors.get_mut(&id) {
                if actor.insight().is_none() {
                    actor.set_insight(insight);
                }
            }
        }

        info!("restored {restored} actors");
        restored
    }

    pub async fn restore_from_backend(&self) -> Result<usize, PersistenceError> {
        let states = self.backend.load_actor_states().await?;
        let insights = self.backend.load_insights().await?;
        Ok(self.restore(states, insights))
    }

    /// Feed one raw point to every actor bound to its source. Returns the
    /// number of actors that accepted and evaluated it.
    pub fn ingest(&self, raw: &RawData) -> usize {
        self.ingest_at(raw, Utc::now())
    }

    pub fn ingest_at(&self, raw: &RawData, now: DateTime<Utc>) -> usize {
        self.present_values.record(raw);

        let Some(key) = raw.source_key() else {
            trace!("dropping point without source identifiers");
            return 0;
        };
        // clone so the route lock is released before touching actors
        let Some(ids) = self.routes.get(&key).map(|ids| ids.clone()) else {
            trace!("no actor bound to {key}");
            return 0;
        };

        let mut evaluated = 0;
        for id in &ids {
            let Some(mut actor) = self.actors.get_mut(id) else {
                continue;
            };
            if let IngestOutcome::Evaluated(_) = actor.ingest(raw, &self.settings, now) {
                evaluated += 1;
            }
        }
        evaluated
    }

    /// Write every dirty actor to the backend in batches.
    ///
    /// Each actor is pruned and snapshotted under its entry lock, then the
    /// lock is released before any I/O. A failed or timed-out batch leaves
    /// its actors dirty. Cancellation is checked between actors; the
    /// pending batch and every actor not yet visited stay dirty.
    #[instrument(skip_all)]
    pub async fn flush(&self, token: &CancellationToken) -> Result<FlushReport, PersistenceError> {
        let _guard = self.flush_lock.lock().await;

        let dirty: Vec<String> = self
            .actors
            .iter()
            .filter(|entry| entry.is_dirty())
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = FlushReport::default();
        if dirty.is_empty() {
            trace!("nothing to flush");
            return Ok(report);
        }
        debug!("flushing {} dirty actors", dirty.len());

        let mut batch = FlushBatch::new();
        let mut pending: Vec<String> = Vec::new();

        for id in &dirty {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let Some(mut actor) = self.actors.get_mut(id) else {
                continue;
            };
            report.points_pruned += actor.prune(self.settings.retention);
            let (state, insight) = actor.take_snapshot();
            drop(actor);

            batch.actor_states.extend(state);
            batch.insights.extend(insight);
            pending.push(id.clone());

            if pending.len() >= self.batch_size {
                let ids = std::mem::take(&mut pending);
                self.write_batch(std::mem::take(&mut batch), &ids, &mut report)
                    .await?;
            }
        }

        if report.cancelled {
            self.mark_dirty(&pending);
            warn!(
                "flush cancelled after {} batches, {} actors left dirty",
                report.batches,
                self.dirty_count()
            );
            return Ok(report);
        }

        if !pending.is_empty() {
            self.write_batch(batch, &pending, &mut report).await?;
        }

        info!(
            "flushed {} actor states and {} insights in {} batches ({} points pruned)",
            report.actors_written, report.insights_written, report.batches, report.points_pruned
        );
        Ok(report)
    }

    async fn write_batch(
        &self,
        batch: FlushBatch,
        ids: &[String],
        report: &mut FlushReport,
    ) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }

        let result =
            tokio::time::timeout(self.persistence_timeout, self.backend.flush_batch(batch)).await;

        match result {
            Ok(Ok(ack)) => {
                report.actors_written += ack.actor_states;
                report.insights_written += ack.insights;
                report.batches += 1;
                Ok(())
            }
            Ok(Err(err)) => {
                self.mark_dirty(ids);
                error!("failed to write batch of {} actors: {err}", ids.len());
                Err(PersistenceError::Storage(err))
            }
            Err(_) => {
                self.mark_dirty(ids);
                error!(
                    "writing batch of {} actors timed out after {:?}",
                    ids.len(),
                    self.persistence_timeout
                );
                Err(PersistenceError::Timeout(self.persistence_timeout))
            }
        }
    }

    fn mark_dirty(&self, ids: &[String]) {
        for id in ids {
            if let Some(mut actor) = self.actors.get_mut(id) {
                actor.mark_dirty();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.actors.iter().filter(|entry| entry.is_dirty()).count()
    }

    /// Number of actors that have seen telemetry
    pub fn active_count(&self) -> usize {
        self.actors.iter().filter(|entry| entry.is_active()).count()
    }

    pub fn actor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.actors.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn actor_state(&self, id: &str) -> Option<ActorState> {
        self.actors.get(id).map(|actor| actor.state().clone())
    }

    pub fn insight(&self, id: &str) -> Option<Insight> {
        self.actors.get(id).and_then(|actor| actor.insight().cloned())
    }

    /// Every insight, ordered by id
    pub fn insights(&self) -> Vec<Insight> {
        let mut insights: Vec<Insight> = self
            .actors
            .iter()
            .filter_map(|actor| actor.insight().cloned())
            .collect();
        insights.sort_by(|a, b| a.id.cmp(&b.id));
        insights
    }

    /// Insights the command system should be notified about now
    pub fn sync_candidates(&self, now: DateTime<Utc>) -> Vec<Insight> {
        self.insights()
            .into_iter()
            .filter(|insight| insight.should_sync(now))
            .collect()
    }

    /// Apply an external change (sync, resolve, ignore) to an insight; the
    /// actor becomes dirty.
    pub fn with_insight_mut<R>(&self, id: &str, f: impl FnOnce(&mut Insight) -> R) -> Option<R> {
        self.actors.get_mut(id)?.update_insight(f)
    }
}
