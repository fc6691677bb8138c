//! Candle source trait and fetch error types.
//!
//! The CandleSource trait abstracts over the remote market-data API so the
//! synchronization engine can be driven by scripted sources in tests.

use crate::domain::{Candle, Interval};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Per-call row cap of the klines endpoint.
pub const DEFAULT_MAX_ROWS_PER_CALL: usize = 1000;

/// Errors from a single fetch. All of them are recoverable by retrying the
/// same request later; the source itself never retries.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("rate limited by provider (status {status}, retry after {retry_after_secs:?}s)")]
    RateLimited {
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Trait for candle sources.
///
/// `fetch` covers the half-open range `[start, end)`. Callers keep the span at
/// or below [`CandleSource::max_rows_per_call`] bars. An empty result means
/// "no bars in this span" and is not an error.
pub trait CandleSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Largest number of bars a single call may return.
    fn max_rows_per_call(&self) -> usize {
        DEFAULT_MAX_ROWS_PER_CALL
    }

    /// Fetch candles for `symbol` with open times in `[start, end)`, ascending.
    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError>;
}
