//! Persistence of rules, actor states and insights
//!
//! ## Backends
//!
//! - **SQLite** (default feature `storage-sqlite`): embedded database
//! - **In-Memory**: no persistence, for tests or runs without storage
//!
//! ## Usage
//!
//! ```no_run
//! use rules_engine::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./rules-engine.db").await?;
//!     let insights = backend.load_insights().await?;
//!     println!("{} insights", insights.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{RecordKind, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::{FlushAck, FlushBatch};

use crate::config::StorageConfig;

/// Open the backend selected by the configuration.
pub async fn open_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::None => {
            info!("no storage configured, state is kept in memory only");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => Ok(Arc::new(sqlite::SqliteBackend::new(path).await?)),
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::Unsupported("sqlite")),
    }
}
