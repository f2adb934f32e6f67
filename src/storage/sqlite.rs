//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Reads proceed while a flush is writing
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Records are stored as JSON bodies; lookup columns (rule id, status,
//! timestamps in Unix milliseconds) sit next to them.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{RecordKind, StorageError, StorageResult};
use super::schema::{FlushAck, FlushBatch};
use crate::actors::actor::ActorState;
use crate::insights::Insight;
use crate::rules::{GlobalVariable, Rule};

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open {
                path: db_path_str.clone(),
                reason: e.to_string(),
            })?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Open {
                path: db_path_str.clone(),
                reason: format!("migration failed: {e}"),
            })?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn encode<T: Serialize>(kind: RecordKind, id: &str, record: &T) -> StorageResult<String> {
        serde_json::to_string(record).map_err(|e| StorageError::encode(kind, id, e))
    }

    /// Rows are selected as `key, body`; the key names the record in errors.
    fn decode<T: DeserializeOwned>(kind: RecordKind, row: &SqliteRow) -> StorageResult<T> {
        let key: String = row.try_get("key")?;
        let body: String = row.try_get("body")?;
        serde_json::from_str(&body).map_err(|e| StorageError::decode(kind, key, e))
    }

    fn decode_all<T: DeserializeOwned>(
        kind: RecordKind,
        rows: Vec<SqliteRow>,
    ) -> StorageResult<Vec<T>> {
        rows.iter().map(|row| Self::decode(kind, row)).collect()
    }

    async fn count(&self, table: &str) -> StorageResult<i64> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self))]
    async fn load_rules(&self) -> StorageResult<Vec<Rule>> {
        let rows = sqlx::query("SELECT id AS key, body FROM rules ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await?;
        Self::decode_all(RecordKind::Rule, rows)
    }

    #[instrument(skip(self, rules), fields(count = rules.len()))]
    async fn save_rules(&self, rules: Vec<Rule>) -> StorageResult<()> {
        let now = Self::timestamp_to_millis(&Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM rules").execute(&mut *tx).await?;
        for (position, rule) in rules.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO rules (id, position, body, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    position = excluded.position,
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&rule.id)
            .bind(position as i64)
            .bind(Self::encode(RecordKind::Rule, &rule.id, rule)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("stored {} rules", rules.len());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_global_variables(&self) -> StorageResult<Vec<GlobalVariable>> {
        let rows =
            sqlx::query("SELECT name AS key, body FROM global_variables ORDER BY position ASC")
                .fetch_all(&self.pool)
                .await?;
        Self::decode_all(RecordKind::GlobalVariable, rows)
    }

    #[instrument(skip(self, globals), fields(count = globals.len()))]
    async fn save_global_variables(&self, globals: Vec<GlobalVariable>) -> StorageResult<()> {
        let now = Self::timestamp_to_millis(&Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM global_variables")
            .execute(&mut *tx)
            .await?;
        for (position, global) in globals.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO global_variables (name, position, body, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (name) DO UPDATE SET
                    position = excluded.position,
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&global.name)
            .bind(position as i64)
            .bind(Self::encode(RecordKind::GlobalVariable, &global.name, global)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_actor_states(&self) -> StorageResult<Vec<ActorState>> {
        let rows = sqlx::query("SELECT id AS key, body FROM actor_states")
            .fetch_all(&self.pool)
            .await?;
        let states: Vec<ActorState> = Self::decode_all(RecordKind::ActorState, rows)?;
        debug!("loaded {} actor states", states.len());
        Ok(states)
    }

    #[instrument(skip(self))]
    async fn get_actor_state(&self, id: &str) -> StorageResult<Option<ActorState>> {
        let row = sqlx::query("SELECT id AS key, body FROM actor_states WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(|row| Self::decode(RecordKind::ActorState, row))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn load_insights(&self) -> StorageResult<Vec<Insight>> {
        let rows = sqlx::query("SELECT id AS key, body FROM insights ORDER BY last_updated ASC")
            .fetch_all(&self.pool)
            .await?;
        let insights: Vec<Insight> = Self::decode_all(RecordKind::Insight, rows)?;
        debug!("loaded {} insights", insights.len());
        Ok(insights)
    }

    #[instrument(skip(self))]
    async fn get_insight(&self, id: &str) -> StorageResult<Option<Insight>> {
        let row = sqlx::query("SELECT id AS key, body FROM insights WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(|row| Self::decode(RecordKind::Insight, row))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_insight(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM insights WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, batch), fields(records = batch.len()))]
    async fn flush_batch(&self, batch: FlushBatch) -> StorageResult<FlushAck> {
        let written_at = Utc::now();
        let ack = FlushAck {
            actor_states: batch.actor_states.len(),
            insights: batch.insights.len(),
            written_at,
        };
        if batch.is_empty() {
            return Ok(ack);
        }

        let now = Self::timestamp_to_millis(&written_at);
        let mut tx = self.pool.begin().await?;

        for state in &batch.actor_states {
            sqlx::query(
                r#"
                INSERT INTO actor_states (id, rule_id, evaluated_at, body, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    rule_id = excluded.rule_id,
                    evaluated_at = excluded.evaluated_at,
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&state.id)
            .bind(&state.rule_id)
            .bind(state.timestamp.as_ref().map(Self::timestamp_to_millis))
            .bind(Self::encode(RecordKind::ActorState, &state.id, state)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for insight in &batch.insights {
            sqlx::query(
                r#"
                INSERT INTO insights (id, rule_id, equipment_id, status, last_updated, body)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    rule_id = excluded.rule_id,
                    equipment_id = excluded.equipment_id,
                    status = excluded.status,
                    last_updated = excluded.last_updated,
                    body = excluded.body
                "#,
            )
            .bind(&insight.id)
            .bind(&insight.rule_id)
            .bind(&insight.equipment_id)
            .bind(insight.status.as_str())
            .bind(Self::timestamp_to_millis(&insight.last_updated))
            .bind(Self::encode(RecordKind::Insight, &insight.id, insight)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "flushed {} actor states and {} insights",
            ack.actor_states, ack.insights
        );
        Ok(ack)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let rules = self.count("rules").await?;
        let actor_states = self.count("actor_states").await?;
        let insights = self.count("insights").await?;

        let newest: (Option<i64>,) = sqlx::query_as("SELECT MAX(updated_at) FROM actor_states")
            .fetch_one(&self.pool)
            .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        let last_flush = newest
            .0
            .map(|millis| Self::millis_to_timestamp(millis).to_rfc3339())
            .unwrap_or_else(|| "never".to_string());

        Ok(format!(
            "SQLite: {} rules, {} actor states, {} insights, {:.2} MB on disk, last flush: {}",
            rules, actor_states, insights, file_size_mb, last_flush
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::insights::InsightStatus;
    use crate::rules::RuleParameter;
    use crate::timeseries::TimedValue;

    async fn backend() -> (tempfile::TempDir, SqliteBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        (temp_dir, backend)
    }

    fn state(id: &str) -> ActorState {
        let mut state = ActorState::new(id, "hot");
        let now = Utc::now();
        state.timestamp = Some(now);
        state
            .output_values
            .points
            .add_point(TimedValue::from_bool(now, true).with_faulted(true), None);
        state.output_values.latest_scores.insert("cost".to_string(), 12.5);
        state
    }

    #[tokio::test]
    async fn test_sqlite_backend_creation() {
        let (_dir, backend) = backend().await;
        assert!(backend.health_check().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_flush_round_trip() {
        let (_dir, backend) = backend().await;

        let mut insight = Insight::new("hot_AHU-1", "hot", "AHU-1", Utc::now());
        insight.status = InsightStatus::ReadyToResolve;

        let ack = backend
            .flush_batch(FlushBatch {
                actor_states: vec![state("hot_AHU-1"), state("hot_AHU-2")],
                insights: vec![insight.clone()],
            })
            .await
            .unwrap();
        assert_eq!((ack.actor_states, ack.insights), (2, 1));

        let original = state("hot_AHU-1");
        let loaded = backend.get_actor_state("hot_AHU-1").await.unwrap().unwrap();
        assert_eq!(loaded.rule_id, original.rule_id);
        assert_eq!(loaded.output_values.points.len(), 1);
        assert_eq!(
            loaded.output_values.points.last().and_then(|p| p.faulted),
            Some(true)
        );
        assert_eq!(loaded.output_values.latest_scores["cost"], 12.5);
        assert_eq!(backend.load_actor_states().await.unwrap().len(), 2);
        assert_eq!(backend.get_insight("hot_AHU-1").await.unwrap(), Some(insight));
    }

    #[tokio::test]
    async fn test_flush_upserts_existing_rows() {
        let (_dir, backend) = backend().await;

        let mut insight = Insight::new("hot_AHU-1", "hot", "AHU-1", Utc::now());
        backend
            .flush_batch(FlushBatch {
                actor_states: vec![],
                insights: vec![insight.clone()],
            })
            .await
            .unwrap();

        insight.resolve(Utc::now() + Duration::minutes(5));
        backend
            .flush_batch(FlushBatch {
                actor_states: vec![],
                insights: vec![insight],
            })
            .await
            .unwrap();

        let insights = backend.load_insights().await.unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].status, InsightStatus::Resolved);
        assert!(backend.delete_insight("hot_AHU-1").await.unwrap());
        assert!(backend.load_insights().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rules_keep_order() {
        let (_dir, backend) = backend().await;
        let rules = vec![
            Rule::new("b", "dtmi:AHU;1").with_parameter(RuleParameter::new("R", "result", "1")),
            Rule::new("a", "dtmi:AHU;1"),
        ];

        backend.save_rules(rules.clone()).await.unwrap();
        assert_eq!(backend.load_rules().await.unwrap(), rules);

        backend.save_rules(vec![rules[1].clone()]).await.unwrap();
        assert_eq!(backend.load_rules().await.unwrap().len(), 1);

        let globals = vec![GlobalVariable::new("DOUBLE", "x * 2").with_parameters(&["x"])];
        backend.save_global_variables(globals.clone()).await.unwrap();
        assert_eq!(backend.load_global_variables().await.unwrap(), globals);
    }

    #[tokio::test]
    async fn test_corrupt_body_names_the_record() {
        let (_dir, backend) = backend().await;
        sqlx::query(
            "INSERT INTO insights (id, rule_id, equipment_id, status, last_updated, body) \
             VALUES ('hot_AHU-9', 'hot', 'AHU-9', 'faulty_now', 0, '{not json')",
        )
        .execute(&backend.pool)
        .await
        .unwrap();

        let err = backend.get_insight("hot_AHU-9").await.unwrap_err();
        assert!(matches!(
            &err,
            StorageError::Decode { kind: RecordKind::Insight, id, .. } if id == "hot_AHU-9"
        ));
        assert!(backend.load_insights().await.is_err());
    }

    #[tokio::test]
    async fn test_get_stats() {
        let (_dir, backend) = backend().await;
        backend
            .flush_batch(FlushBatch {
                actor_states: vec![state("hot_AHU-1")],
                insights: vec![],
            })
            .await
            .unwrap();

        let stats = backend.get_stats().await.unwrap();
        assert!(stats.contains("1 actor states"), "{stats}");
    }
}
