//! Error types for persisting engine records

use std::fmt;

use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// The kind of engine record a storage failure concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Rule,
    GlobalVariable,
    ActorState,
    Insight,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Rule => "rule",
            RecordKind::GlobalVariable => "global variable",
            RecordKind::ActorState => "actor state",
            RecordKind::Insight => "insight",
        })
    }
}

/// Failures while loading or flushing rules, actor states and insights
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store could not be opened or its schema brought up to date
    #[error("cannot open store at {path}: {reason}")]
    Open { path: String, reason: String },

    /// The configured backend is not compiled into this build
    #[error("storage backend {0} is not available in this build")]
    Unsupported(&'static str),

    #[error("failed to encode {kind} {id}: {source}")]
    Encode {
        kind: RecordKind,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored body no longer matches the record layout
    #[error("failed to decode {kind} {id}: {source}")]
    Decode {
        kind: RecordKind,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Database(String),

    /// The backend refused a write; nothing from the batch was stored
    #[error("storage backend rejected the write: {0}")]
    Rejected(String),

    /// The backend is closed or otherwise not serving calls
    #[error("storage backend unhealthy: {0}")]
    UnhealthyBackend(String),
}

impl StorageError {
    pub fn encode(kind: RecordKind, id: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Encode {
            kind,
            id: id.into(),
            source,
        }
    }

    pub fn decode(kind: RecordKind, id: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Decode {
            kind,
            id: id.into(),
            source,
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}
