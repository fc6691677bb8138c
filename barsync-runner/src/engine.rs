//! Per-symbol backfill state machine.
//!
//! For one symbol, within a pass horizon fixed at pass start:
//!
//! ```text
//! Resuming -> Fetching -> Persisting -> Advancing -> (Fetching | CaughtUp)
//!                 ^            |
//!                 +- Retrying -+
//! ```
//!
//! The cursor (next open time to fetch) only moves after a chunk has been
//! durably upserted, and is checkpointed before the next fetch starts. A
//! crash at any point therefore re-fetches at most the chunk in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use barsync_core::data::{
    CandleSource, CandleStore, FetchError, ProgressError, ProgressTracker, StoreError,
};
use barsync_core::domain::{Candle, Interval, SymbolDescriptor, ValidationError};

use crate::config::{ConfigError, SyncConfig};

/// Errors from the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("progress error: {0}")]
    Progress(#[from] ProgressError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// Engine knobs, fixed for the lifetime of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub interval: Interval,
    /// Bars per chunk. Clamped to the source's per-call cap.
    pub chunk_bars: usize,
    pub retry_delay: Duration,
    pub concurrency: usize,
    pub default_start: DateTime<Utc>,
}

impl EngineSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            interval: config.source.interval,
            chunk_bars: config.sync.chunk_bars,
            retry_delay: config.retry_delay(),
            concurrency: config.sync.concurrency,
            default_start: config.sync.default_start,
        }
    }
}

/// Range of one pass. `end` is exclusive and interval-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassHorizon {
    /// Overrides every symbol's own start when set.
    pub start_override: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

/// How a symbol's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SymbolOutcome {
    /// Nothing was missing; no request was made.
    UpToDate,
    /// Fetched through to the horizon.
    Synced,
    /// Aborted before fetching; other symbols are unaffected.
    Failed { error: String },
    /// Stopped by the cancel flag.
    Cancelled,
}

/// What one symbol's run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolReport {
    pub symbol: String,
    pub outcome: SymbolOutcome,
    /// First open time requested this pass, if any.
    pub from: Option<DateTime<Utc>>,
    /// Resume cursor at the end of the run.
    pub cursor: Option<DateTime<Utc>>,
    pub chunks: usize,
    pub empty_chunks: usize,
    pub rows_fetched: usize,
    pub rows_inserted: usize,
    pub retries: usize,
    pub elapsed_secs: f64,
}

impl SymbolReport {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            outcome: SymbolOutcome::UpToDate,
            from: None,
            cursor: None,
            chunks: 0,
            empty_chunks: 0,
            rows_fetched: 0,
            rows_inserted: 0,
            retries: 0,
            elapsed_secs: 0.0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SymbolOutcome::Failed { .. })
    }
}

/// Combine the two watermarks into the next open time to fetch.
///
/// The store's max open time is authoritative; the checkpoint is a hint.
/// When both exist the earlier cursor wins, so data the store does not hold
/// is never skipped.
pub fn resume_cursor(
    stored_max: Option<DateTime<Utc>>,
    checkpoint: Option<DateTime<Utc>>,
    interval: Interval,
) -> Option<DateTime<Utc>> {
    let derived = stored_max.map(|t| t + interval.duration());
    match (derived, checkpoint) {
        (Some(d), Some(c)) => Some(d.min(c)),
        (d, c) => d.or(c),
    }
}

/// Result of one fetch + persist attempt.
struct ChunkResult {
    fetched: usize,
    inserted: usize,
    last_open: Option<DateTime<Utc>>,
}

/// The synchronization engine: one source, one store, one checkpoint file.
pub struct SyncEngine {
    source: Arc<dyn CandleSource>,
    store: Arc<dyn CandleStore>,
    tracker: Arc<ProgressTracker>,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn CandleSource>,
        store: Arc<dyn CandleStore>,
        tracker: Arc<ProgressTracker>,
        mut settings: EngineSettings,
    ) -> Self {
        let cap = source.max_rows_per_call().max(1);
        if settings.chunk_bars == 0 || settings.chunk_bars > cap {
            tracing::warn!(
                requested = settings.chunk_bars,
                cap,
                "chunk_bars out of range, clamping to the source cap"
            );
            settings.chunk_bars = settings.chunk_bars.clamp(1, cap);
        }
        settings.concurrency = settings.concurrency.max(1);
        Self {
            source,
            store,
            tracker,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &dyn CandleStore {
        self.store.as_ref()
    }

    pub fn source(&self) -> &dyn CandleSource {
        self.source.as_ref()
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Width of one chunk.
    pub fn chunk_span(&self) -> chrono::Duration {
        let bars = i64::try_from(self.settings.chunk_bars).unwrap_or(i64::MAX);
        self.settings
            .interval
            .minutes()
            .checked_mul(bars)
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Horizon for a pass started at `now`.
    pub fn horizon(
        &self,
        start_override: Option<DateTime<Utc>>,
        end_override: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PassHorizon {
        let interval = self.settings.interval;
        PassHorizon {
            start_override: start_override.map(|s| interval.truncate(s)),
            end: interval.truncate(end_override.unwrap_or(now)),
        }
    }

    /// Bring one symbol up to the horizon.
    ///
    /// `checkpoint` is this symbol's value from the progress map loaded at
    /// pass start. Fetch and upsert errors are retried until they succeed or
    /// `cancel` is set; only errors while resuming fail the symbol.
    pub fn sync_symbol(
        &self,
        descriptor: &SymbolDescriptor,
        checkpoint: Option<DateTime<Utc>>,
        horizon: &PassHorizon,
        cancel: Option<&AtomicBool>,
    ) -> SymbolReport {
        let started = Instant::now();
        let symbol = descriptor.symbol.as_str();
        let mut report = SymbolReport::new(symbol);

        // ── Resuming ──
        let resume = match self.resume(symbol, checkpoint) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(symbol, error = %e, "cannot resume symbol, skipping it this pass");
                report.outcome = SymbolOutcome::Failed {
                    error: e.to_string(),
                };
                report.elapsed_secs = started.elapsed().as_secs_f64();
                return report;
            }
        };

        let interval = self.settings.interval;
        let start = horizon
            .start_override
            .or(descriptor.first_available)
            .unwrap_or(self.settings.default_start);
        let start = interval.truncate(start);
        let mut cursor = match resume {
            Some(r) if r > start => r,
            _ => start,
        };
        report.cursor = Some(cursor);

        if cursor >= horizon.end {
            tracing::debug!(symbol, %cursor, end = %horizon.end, "already up to date");
            report.elapsed_secs = started.elapsed().as_secs_f64();
            return report;
        }

        tracing::info!(
            symbol,
            from = %cursor,
            to = %horizon.end,
            bars = interval.bars_between(cursor, horizon.end),
            "backfilling"
        );
        report.from = Some(cursor);
        report.outcome = SymbolOutcome::Synced;

        let span = self.chunk_span();
        while cursor < horizon.end {
            let chunk_end = cursor
                .checked_add_signed(span)
                .map_or(horizon.end, |t| t.min(horizon.end));

            // ── Fetching / Persisting, with Retrying ──
            let chunk = loop {
                if is_cancelled(cancel) {
                    report.outcome = SymbolOutcome::Cancelled;
                    report.cursor = Some(cursor);
                    report.elapsed_secs = started.elapsed().as_secs_f64();
                    return report;
                }
                match self.fetch_and_persist(symbol, cursor, chunk_end) {
                    Ok(chunk) => break chunk,
                    Err(e) => {
                        report.retries += 1;
                        tracing::warn!(
                            symbol,
                            chunk_start = %cursor,
                            chunk_end = %chunk_end,
                            attempt = report.retries,
                            error = %e,
                            retry_in_secs = self.settings.retry_delay.as_secs_f64(),
                            "chunk failed, retrying"
                        );
                        sleep_unless_cancelled(self.settings.retry_delay, cancel);
                    }
                }
            };

            // ── Advancing ──
            report.chunks += 1;
            report.rows_fetched += chunk.fetched;
            report.rows_inserted += chunk.inserted;
            cursor = match chunk.last_open {
                Some(last) => last + interval.duration(),
                None => {
                    report.empty_chunks += 1;
                    tracing::info!(
                        symbol,
                        chunk_start = %cursor,
                        chunk_end = %chunk_end,
                        "no data in chunk, advancing"
                    );
                    chunk_end
                }
            };

            if let Err(e) = self.tracker.record(symbol, cursor) {
                // The store's own watermark still bounds the resume point.
                tracing::warn!(symbol, %cursor, error = %e, "checkpoint write failed");
            }

            tracing::debug!(
                symbol,
                rows = chunk.fetched,
                inserted = chunk.inserted,
                %cursor,
                "chunk persisted"
            );
        }

        report.cursor = Some(cursor);
        report.elapsed_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            symbol,
            chunks = report.chunks,
            inserted = report.rows_inserted,
            empty_chunks = report.empty_chunks,
            retries = report.retries,
            "caught up"
        );
        report
    }

    fn resume(
        &self,
        symbol: &str,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        self.store.ensure_table(symbol)?;
        let stored_max = self.store.max_timestamp(symbol)?;
        let cursor = resume_cursor(stored_max, checkpoint, self.settings.interval);
        tracing::debug!(
            symbol,
            stored_max = ?stored_max,
            checkpoint = ?checkpoint,
            resume = ?cursor,
            "resume point"
        );
        Ok(cursor)
    }

    fn fetch_and_persist(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ChunkResult, SyncError> {
        let mut candles = self
            .source
            .fetch(symbol, self.settings.interval, start, end)?;
        let fetched = candles.len();

        candles.retain(|c| keep_candle(symbol, c, start, end));
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        // A bad row fails the whole chunk so it is fetched again, not skipped
        if let Some(e) = candles.iter().find_map(|c| c.validate().err()) {
            return Err(FetchError::Payload(format!("invalid candle: {e}")).into());
        }

        if candles.is_empty() {
            return Ok(ChunkResult {
                fetched,
                inserted: 0,
                last_open: None,
            });
        }

        let inserted = self.store.upsert(symbol, &candles)?;
        Ok(ChunkResult {
            fetched,
            inserted,
            last_open: candles.last().map(|c| c.open_time),
        })
    }
}

/// Drop rows a misbehaving source returned outside the request or for
/// another symbol.
fn keep_candle(symbol: &str, c: &Candle, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    if c.symbol != symbol || c.open_time < start || c.open_time >= end {
        tracing::warn!(
            symbol,
            row_symbol = %c.symbol,
            open_time = %c.open_time,
            "dropping row outside the requested chunk"
        );
        return false;
    }
    true
}

pub(crate) fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|f| f.load(Ordering::Relaxed))
}

/// Sleep for `total`, waking early if `cancel` is set.
pub(crate) fn sleep_unless_cancelled(total: Duration, cancel: Option<&AtomicBool>) {
    const SLICE: Duration = Duration::from_millis(200);
    let deadline = Instant::now() + total;
    loop {
        if is_cancelled(cancel) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}
