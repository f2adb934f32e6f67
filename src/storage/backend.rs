//! Storage backend trait definition
//!
//! The engine only ever talks to persistence through [`StorageBackend`]:
//! repositories for rules, global variables, actor states and insights.

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::StorageResult;
use super::schema::{FlushAck, FlushBatch};
use crate::actors::actor::ActorState;
use crate::insights::Insight;
use crate::rules::{GlobalVariable, Rule};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// Implementations must be `Send + Sync` as they are shared between the
/// flush scheduler and the startup path.
///
/// ## Error Handling
///
/// Methods return `StorageResult<T>`; backend-specific failures are
/// converted to `StorageError` variants.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn load_rules(&self) -> StorageResult<Vec<Rule>>;

    /// Replace the stored rule set
    async fn save_rules(&self, rules: Vec<Rule>) -> StorageResult<()>;

    async fn load_global_variables(&self) -> StorageResult<Vec<GlobalVariable>>;

    /// Replace the stored global variables
    async fn save_global_variables(&self, globals: Vec<GlobalVariable>) -> StorageResult<()>;

    /// Every actor state, used once at startup
    async fn load_actor_states(&self) -> StorageResult<Vec<ActorState>>;

    async fn get_actor_state(&self, id: &str) -> StorageResult<Option<ActorState>>;

    /// Every insight, used once at startup
    async fn load_insights(&self) -> StorageResult<Vec<Insight>>;

    async fn get_insight(&self, id: &str) -> StorageResult<Option<Insight>>;

    /// Returns whether an insight was removed
    async fn delete_insight(&self, id: &str) -> StorageResult<bool>;

    /// Upsert one batch of actor states and insights atomically
    async fn flush_batch(&self, batch: FlushBatch) -> StorageResult<FlushAck>;

    /// Check backend health
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable stats about the backend
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
