//! Durable per-symbol checkpoint file.
//!
//! A flat JSON object mapping canonical symbol to the next open time the
//! engine should fetch:
//!
//! ```json
//! { "BTCUSDT": "2024-01-01T00:05:00Z" }
//! ```
//!
//! The checkpoint is only a resume hint; the store's own max timestamp is
//! authoritative. Every write rewrites the whole file via `.tmp` + rename, so
//! a crash leaves either the old or the new map on disk.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Symbol to resume-cursor map, ordered for stable file output.
pub type ProgressMap = BTreeMap<String, DateTime<Utc>>;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress file I/O error at {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("progress serialization error: {0}")]
    Serialize(String),
}

/// Checkpoint store backed by a single JSON file.
///
/// All read-modify-write cycles go through one mutex, so concurrent symbol
/// workers never lose each other's updates.
pub struct ProgressTracker {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProgressTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole map. A missing file is an empty map; an unreadable or
    /// unparsable file is logged and also treated as empty.
    pub fn load(&self) -> ProgressMap {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ProgressMap::new(),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "progress file unreadable, starting from store watermarks"
                );
                return ProgressMap::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "progress file is not valid JSON, ignoring it"
                );
                ProgressMap::new()
            }
        }
    }

    /// Cursor recorded for one symbol.
    pub fn get(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.load().get(symbol).copied()
    }

    /// Overwrite the file with `map`.
    pub fn save(&self, map: &ProgressMap) -> Result<(), ProgressError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_atomic(map)
    }

    /// Record `cursor` for `symbol`, unless the stored value is already at or
    /// past it.
    ///
    /// Returns whether the file changed.
    pub fn record(&self, symbol: &str, cursor: DateTime<Utc>) -> Result<bool, ProgressError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut map = self.load();
        if map.get(symbol).is_some_and(|existing| *existing >= cursor) {
            return Ok(false);
        }
        map.insert(symbol.to_string(), cursor);
        self.write_atomic(&map)?;
        Ok(true)
    }

    fn write_atomic(&self, map: &ProgressMap) -> Result<(), ProgressError> {
        let io_err = |e: std::io::Error| ProgressError::Io {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(map)
            .map_err(|e| ProgressError::Serialize(e.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            io_err(e)
        })
    }
}
