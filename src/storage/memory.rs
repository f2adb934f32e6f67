//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Testing without database dependencies
//! - Running the engine without storage configured
//!
//! Writes can be made to fail or stall on demand to exercise the flush
//! error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{FlushAck, FlushBatch};
use crate::actors::actor::ActorState;
use crate::insights::Insight;
use crate::rules::{GlobalVariable, Rule};

#[derive(Debug, Default)]
struct Tables {
    rules: Vec<Rule>,
    globals: Vec<GlobalVariable>,
    actor_states: HashMap<String, ActorState>,
    insights: HashMap<String, Insight>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    failing: AtomicBool,
    write_delay_ms: AtomicU64,
    flushes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `flush_batch` fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every following `flush_batch` by `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successfully written batches
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub async fn actor_state_count(&self) -> usize {
        self.tables.read().await.actor_states.len()
    }

    pub async fn insight_count(&self) -> usize {
        self.tables.read().await.insights.len()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::UnhealthyBackend(
                "in-memory backend is closed".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load_rules(&self) -> StorageResult<Vec<Rule>> {
        self.ensure_open()?;
        Ok(self.tables.read().await.rules.clone())
    }

    async fn save_rules(&self, rules: Vec<Rule>) -> StorageResult<()> {
        self.ensure_open()?;
        debug!("storing {} rules in memory", rules.len());
        self.tables.write().await.rules = rules;
        Ok(())
    }

    async fn load_global_variables(&self) -> StorageResult<Vec<GlobalVariable>> {
        self.ensure_open()?;
        Ok(self.tables.read().await.globals.clone())
    }

    async fn save_global_variables(&self, globals: Vec<GlobalVariable>) -> StorageResult<()> {
        self.ensure_open()?;
        self.tables.write().await.globals = globals;
        Ok(())
    }

    async fn load_actor_states(&self) -> StorageResult<Vec<ActorState>> {
        self.ensure_open()?;
        Ok(self.tables.read().await.actor_states.values().cloned().collect())
    }

    async fn get_actor_state(&self, id: &str) -> StorageResult<Option<ActorState>> {
        self.ensure_open()?;
        Ok(self.tables.read().await.actor_states.get(id).cloned())
    }

    async fn load_insights(&self) -> StorageResult<Vec<Insight>> {
        self.ensure_open()?;
        Ok(self.tables.read().await.insights.values().cloned().collect())
    }

    async fn get_insight(&self, id: &str) -> StorageResult<Option<Insight>> {
        self.ensure_open()?;
        Ok(self.tables.read().await.insights.get(id).cloned())
    }

    async fn delete_insight(&self, id: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.tables.write().await.insights.remove(id).is_some())
    }

    async fn flush_batch(&self, batch: FlushBatch) -> StorageResult<FlushAck> {
        self.ensure_open()?;

        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            warn!("in-memory backend rejecting batch of {} records", batch.len());
            return Err(StorageError::Rejected(format!(
                "in-memory backend refused {} records",
                batch.len()
            )));
        }

        let ack = FlushAck {
            actor_states: batch.actor_states.len(),
            insights: batch.insights.len(),
            written_at: Utc::now(),
        };

        let mut tables = self.tables.write().await;
        for state in batch.actor_states {
            tables.actor_states.insert(state.id.clone(), state);
        }
        for insight in batch.insights {
            tables.insights.insert(insight.id.clone(), insight);
        }
        drop(tables);

        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!(
            "in-memory backend stored {} actor states, {} insights",
            ack.actor_states, ack.insights
        );
        Ok(ack)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let tables = self.tables.read().await;
        let closed = self.closed.load(Ordering::SeqCst);
        Ok(HealthStatus {
            healthy: !closed,
            message: if closed {
                "In-memory storage closed".to_string()
            } else {
                "In-memory storage operational".to_string()
            },
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("actor_states".to_string(), tables.actor_states.len().to_string()),
                ("insights".to_string(), tables.insights.len().to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let tables = self.tables.read().await;
        Ok(format!(
            "In-Memory: {} rules, {} actor states, {} insights",
            tables.rules.len(),
            tables.actor_states.len(),
            tables.insights.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
