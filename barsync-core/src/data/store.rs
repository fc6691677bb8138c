//! Time-series store trait and store error types.
//!
//! One logical table per canonical symbol, keyed by candle open time. Rows are
//! immutable once written: an upsert that hits an existing open time skips
//! the row rather than replacing it.

use crate::domain::Candle;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from the store. "No rows" is never an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("corrupt store data: {0}")]
    Corrupt(String),

    #[error("candle for '{found}' passed to the '{expected}' table")]
    SymbolMismatch { expected: String, found: String },
}

/// Trait for per-symbol candle stores.
pub trait CandleStore: Send + Sync {
    /// Create the symbol's table if absent. Idempotent and safe to call
    /// concurrently for different symbols.
    fn ensure_table(&self, symbol: &str) -> Result<(), StoreError>;

    /// Insert candles, silently skipping open times already stored.
    ///
    /// Returns the number of rows actually inserted.
    fn upsert(&self, symbol: &str, candles: &[Candle]) -> Result<usize, StoreError>;

    /// Greatest stored open time, or `None` when the symbol has no rows or no
    /// table yet. A store that knows it lost rows reports a time before the
    /// loss so the missing range is fetched again.
    fn max_timestamp(&self, symbol: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Candles with `start <= open_time <= end`, ascending.
    fn query(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError>;
}

/// Reject candles that belong to a different symbol's table.
pub(crate) fn check_symbols(symbol: &str, candles: &[Candle]) -> Result<(), StoreError> {
    match candles.iter().find(|c| c.symbol != symbol) {
        Some(c) => Err(StoreError::SymbolMismatch {
            expected: symbol.to_string(),
            found: c.symbol.clone(),
        }),
        None => Ok(()),
    }
}
