//! Serializable sync configuration.
//!
//! Loaded from a TOML file. Every section and field has a default, so an
//! empty file is a valid configuration:
//!
//! ```toml
//! [source]
//! base_url = "https://api.binance.com/api/v3/klines"
//! interval = "1m"
//! max_rows_per_call = 1000
//! timeout_secs = 10
//!
//! [store]
//! dir = "data/candles"
//!
//! [progress]
//! path = "data/last_fetch.json"
//!
//! [universe]
//! path = "config/universe.toml"
//!
//! [sync]
//! default_start = "2024-01-01T00:00:00Z"
//! chunk_bars = 1000
//! retry_delay_secs = 10
//! concurrency = 1
//! pass_interval_secs = 60
//! ```

use barsync_core::data::SourceSettings;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest per-request row cap a config may set.
pub const MAX_ROWS_PER_CALL_LIMIT: usize = 100_000;

/// Errors from loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("cannot parse config: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Complete configuration for the sync service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub source: SourceSettings,
    pub store: StoreSettings,
    pub progress: ProgressSettings,
    pub universe: UniverseSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Root directory of the Parquet store.
    pub dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/candles"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    /// JSON checkpoint file.
    pub path: PathBuf,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/last_fetch.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseSettings {
    /// TOML universe file.
    pub path: PathBuf,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/universe.toml"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    // ── Range ──
    /// Start used for symbols with no known first-available date.
    pub default_start: DateTime<Utc>,

    // ── Chunking & retry ──
    /// Bars per fetch; at most `source.max_rows_per_call`.
    pub chunk_bars: usize,
    pub retry_delay_secs: u64,

    // ── Threading ──
    /// Symbols synced at the same time. 1 = strictly sequential.
    pub concurrency: usize,

    // ── Forever mode ──
    pub pass_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            default_start: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            chunk_bars: barsync_core::data::DEFAULT_MAX_ROWS_PER_CALL,
            retry_delay_secs: 10,
            concurrency: 1,
            pass_interval_secs: 60,
        }
    }
}

impl SyncConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.source.base_url.trim().is_empty() {
            return invalid("source.base_url", "must not be empty");
        }
        if self.source.max_rows_per_call == 0 {
            return invalid("source.max_rows_per_call", "must be at least 1");
        }
        if self.source.max_rows_per_call > MAX_ROWS_PER_CALL_LIMIT {
            return Err(ConfigError::Invalid {
                field: "source.max_rows_per_call",
                reason: format!("must be at most {MAX_ROWS_PER_CALL_LIMIT}"),
            });
        }
        if self.source.timeout_secs == 0 {
            return invalid("source.timeout_secs", "must be at least 1");
        }
        if self.sync.chunk_bars == 0 {
            return invalid("sync.chunk_bars", "must be at least 1");
        }
        if self.sync.chunk_bars > self.source.max_rows_per_call {
            return Err(ConfigError::Invalid {
                field: "sync.chunk_bars",
                reason: format!(
                    "{} exceeds source.max_rows_per_call ({})",
                    self.sync.chunk_bars, self.source.max_rows_per_call
                ),
            });
        }
        if self.sync.concurrency == 0 {
            return invalid("sync.concurrency", "must be at least 1");
        }
        if !self.source.interval.is_aligned(self.sync.default_start) {
            return Err(ConfigError::Invalid {
                field: "sync.default_start",
                reason: format!("not aligned to the {} interval", self.source.interval),
            });
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.sync.retry_delay_secs)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.sync.pass_interval_secs)
    }
}
