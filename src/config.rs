use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::error::ConfigurationError;
use crate::timeseries::TrajectoryCompressor;

/// Environment variable naming the default config file
pub const CONFIG_ENV: &str = "RULES_ENGINE_CONFIG";

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database file
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::None
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./rules-engine.db")
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct EngineConfig {
    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,

    /// Minimum history kept per buffer when pruning
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Actors written per storage call
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    #[serde(default = "default_persistence_timeout_secs")]
    pub persistence_timeout_secs: u64,

    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Allowed deviation from a straight trajectory, in percent of the value
    #[serde(default = "default_compression_tolerance")]
    pub compression_tolerance_percent: f64,

    /// Telemetry worker count
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Reopen cooldown for rules without OverHowManyHours
    #[serde(default = "default_cooldown_hours")]
    pub default_cooldown_hours: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: None,
            retention_days: default_retention_days(),
            flush_interval_secs: default_flush_interval_secs(),
            flush_batch_size: default_flush_batch_size(),
            persistence_timeout_secs: default_persistence_timeout_secs(),
            compression: default_compression(),
            compression_tolerance_percent: default_compression_tolerance(),
            partitions: default_partitions(),
            channel_capacity: default_channel_capacity(),
            default_cooldown_hours: default_cooldown_hours(),
        }
    }
}

fn default_retention_days() -> u32 {
    7
}

fn default_flush_interval_secs() -> u64 {
    300
}

fn default_flush_batch_size() -> usize {
    100
}

fn default_persistence_timeout_secs() -> u64 {
    30
}

fn default_compression() -> bool {
    true
}

fn default_compression_tolerance() -> f64 {
    crate::timeseries::compression::DEFAULT_TOLERANCE_PERCENT
}

fn default_partitions() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_cooldown_hours() -> f64 {
    1.0
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: &str| Err(ConfigurationError::InvalidEngine(message.to_string()));

        if self.flush_batch_size == 0 {
            return invalid("flush_batch_size must be at least 1");
        }
        if self.partitions == 0 {
            return invalid("partitions must be at least 1");
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be at least 1");
        }
        if self.flush_interval_secs == 0 {
            return invalid("flush_interval_secs must be at least 1");
        }
        if self.persistence_timeout_secs == 0 {
            return invalid("persistence_timeout_secs must be at least 1");
        }
        if !self.compression_tolerance_percent.is_finite() || self.compression_tolerance_percent < 0.0
        {
            return invalid("compression_tolerance_percent must be a non-negative number");
        }
        if !self.default_cooldown_hours.is_finite() || self.default_cooldown_hours < 0.0 {
            return invalid("default_cooldown_hours must be a non-negative number");
        }

        Ok(())
    }

    pub fn storage(&self) -> StorageConfig {
        self.storage.clone().unwrap_or_default()
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence_timeout_secs)
    }

    pub fn default_cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.default_cooldown_hours * 3_600_000.0).round() as i64)
    }

    pub fn compressor(&self) -> Option<TrajectoryCompressor> {
        self.compression
            .then(|| TrajectoryCompressor::new(self.compression_tolerance_percent))
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<EngineConfig> {
    let file_content = std::fs::read_to_string(path)?;
    let config: EngineConfig = serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}

/// Config path from the command line, else from the environment (or `.env`)
pub fn config_path(cli: Option<String>) -> Option<String> {
    cli.or_else(|| {
        dotenv::dotenv().ok();
        std::env::var(CONFIG_ENV).ok()
    })
}
