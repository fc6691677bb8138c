//! Shared fixtures for engine tests: a scripted market and a flaky store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use barsync_core::data::{CandleSource, CandleStore, FetchError, MemoryStore, ProgressTracker, StoreError};
use barsync_core::domain::{Candle, Interval};
use barsync_runner::{EngineSettings, SyncEngine};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// `t0 + m` minutes.
pub fn at(m: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::minutes(m)
}

pub fn bar(symbol: &str, open_time: DateTime<Utc>) -> Candle {
    let base = Decimal::new(2_000_00, 2) + Decimal::from((open_time - t0()).num_minutes());
    Candle {
        symbol: symbol.to_string(),
        open_time,
        open: base,
        high: base + Decimal::ONE,
        low: base - Decimal::ONE,
        close: base + Decimal::new(5, 1),
        volume: Decimal::new(125, 1),
    }
}

/// One recorded `fetch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// In-process market: serves whatever bars it holds, honouring `[start, end)`
/// and the per-call cap, with an optional queue of scripted failures.
pub struct ScriptedSource {
    bars: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, Candle>>>,
    failures: Mutex<VecDeque<FetchError>>,
    calls: Mutex<Vec<Call>>,
    max_rows: usize,
}

impl ScriptedSource {
    pub fn new(max_rows: usize) -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            max_rows,
        }
    }

    /// Make minute bars available at the given offsets from `t0`.
    pub fn list(&self, symbol: &str, minutes: impl IntoIterator<Item = i64>) {
        let mut bars = self.bars.lock().unwrap();
        let series = bars.entry(symbol.to_string()).or_default();
        for m in minutes {
            series.insert(at(m), bar(symbol, at(m)));
        }
    }

    /// Fail the next `fetch` calls, in order, with these errors.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = FetchError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, symbol: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.symbol == symbol)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl CandleSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn max_rows_per_call(&self) -> usize {
        self.max_rows
    }

    fn fetch(
        &self,
        symbol: &str,
        _interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        self.calls.lock().unwrap().push(Call {
            symbol: symbol.to_string(),
            start,
            end,
        });
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .bars
            .lock()
            .unwrap()
            .get(symbol)
            .map(|s| {
                s.range(start..end)
                    .take(self.max_rows)
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Memory store whose operations can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    /// Symbols for which `ensure_table` always fails.
    pub unreachable: Mutex<Vec<String>>,
    /// Number of upcoming `upsert` calls that fail before touching data.
    pub upsert_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CandleStore for FlakyStore {
    fn ensure_table(&self, symbol: &str) -> Result<(), StoreError> {
        if self.unreachable.lock().unwrap().iter().any(|s| s == symbol) {
            return Err(StoreError::Io(format!("connection refused for {symbol}")));
        }
        self.inner.ensure_table(symbol)
    }

    fn upsert(&self, symbol: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        let pending = self.upsert_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.upsert_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Io("disk full".into()));
        }
        self.inner.upsert(symbol, candles)
    }

    fn max_timestamp(&self, symbol: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.max_timestamp(symbol)
    }

    fn query(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        self.inner.query(symbol, start, end)
    }
}

pub fn settings(chunk_bars: usize) -> EngineSettings {
    EngineSettings {
        interval: Interval::OneMinute,
        chunk_bars,
        retry_delay: Duration::from_millis(1),
        concurrency: 1,
        default_start: t0(),
    }
}

/// Engine wired to a scripted source, a flaky memory store and a tracker in
/// a fresh temp dir. The temp dir must outlive the engine.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub source: Arc<ScriptedSource>,
    pub store: Arc<FlakyStore>,
    pub tracker: Arc<ProgressTracker>,
    pub engine: SyncEngine,
}

impl Harness {
    pub fn new(max_rows: usize, settings: EngineSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(max_rows));
        let store = Arc::new(FlakyStore::new());
        let tracker = Arc::new(ProgressTracker::new(dir.path().join("last_fetch.json")));
        let engine = SyncEngine::new(source.clone(), store.clone(), tracker.clone(), settings);
        Self {
            dir,
            source,
            store,
            tracker,
            engine,
        }
    }

    /// Rebuild the engine with fresh settings, keeping source, store and
    /// checkpoint file. Models a process restart.
    pub fn restart(self, settings: EngineSettings) -> Self {
        let tracker = Arc::new(ProgressTracker::new(self.tracker.path()));
        let engine = SyncEngine::new(
            self.source.clone(),
            self.store.clone(),
            tracker.clone(),
            settings,
        );
        Self {
            dir: self.dir,
            source: self.source,
            store: self.store,
            tracker,
            engine,
        }
    }

    pub fn stored_minutes(&self, symbol: &str) -> Vec<i64> {
        self.store
            .inner
            .open_times(symbol)
            .into_iter()
            .map(|t| (t - t0()).num_minutes())
            .collect()
    }
}
