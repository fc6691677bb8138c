//! In-memory candle store.
//!
//! Same insert-or-skip semantics as the Parquet store, without durability.
//! Used for dry runs and as the reference store in engine tests.

use super::store::{check_symbols, CandleStore, StoreError};
use crate::domain::Candle;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, Candle>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows stored for a symbol (0 when the table does not exist).
    pub fn row_count(&self, symbol: &str) -> usize {
        self.lock().get(symbol).map_or(0, |t| t.len())
    }

    /// All open times stored for a symbol, ascending.
    pub fn open_times(&self, symbol: &str) -> Vec<DateTime<Utc>> {
        self.lock()
            .get(symbol)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `ensure_table` has been called for a symbol.
    pub fn has_table(&self, symbol: &str) -> bool {
        self.lock().contains_key(symbol)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<DateTime<Utc>, Candle>>> {
        // Poisoning leaves the map structurally valid.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CandleStore for MemoryStore {
    fn ensure_table(&self, symbol: &str) -> Result<(), StoreError> {
        self.lock().entry(symbol.to_string()).or_default();
        Ok(())
    }

    fn upsert(&self, symbol: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        check_symbols(symbol, candles)?;
        let mut tables = self.lock();
        let table = tables.entry(symbol.to_string()).or_default();
        let mut inserted = 0;
        for candle in candles {
            if !table.contains_key(&candle.open_time) {
                table.insert(candle.open_time, candle.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn max_timestamp(&self, symbol: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()
            .get(symbol)
            .and_then(|t| t.keys().next_back().copied()))
    }

    fn query(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        if end < start {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()
            .get(symbol)
            .map(|t| t.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }
}
