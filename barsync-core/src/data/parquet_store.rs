//! Parquet candle store with Hive-style partitioning.
//!
//! Layout: `{store_dir}/symbol={SYMBOL}/{YYYY-MM-DD}.parquet`, one file per
//! UTC day.
//!
//! Features:
//! - Insert-or-skip upserts (stored rows are never replaced)
//! - Atomic writes (write to .tmp, rename into place)
//! - Watermark lookup reads only the newest non-empty partition
//! - Quarantine for corrupt files ({filename}.quarantined); the watermark
//!   stays below the earliest quarantined day until it is refilled
//! - Metadata sidecar per symbol (time range, row count)

use super::schema::CandleSchema;
use super::store::{check_symbols, CandleStore, StoreError};
use crate::domain::Candle;
use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Metadata sidecar for a stored symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub symbol: String,
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub bar_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Store status for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatus {
    pub symbol: String,
    pub exists: bool,
    pub partitions: usize,
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub bar_count: Option<usize>,
}

/// The Parquet store.
pub struct ParquetStore {
    store_dir: PathBuf,
    /// One write lock per symbol; upserts to different symbols never contend.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ParquetStore {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of the store.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Directory for a specific symbol: `{store_dir}/symbol={SYMBOL}/`
    fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.store_dir.join(format!("symbol={symbol}"))
    }

    /// Path to the Parquet file for a symbol+day.
    fn day_path(&self, symbol: &str, day: NaiveDate) -> PathBuf {
        self.symbol_dir(symbol)
            .join(format!("{}.parquet", day.format("%Y-%m-%d")))
    }

    /// Path to the metadata sidecar for a symbol.
    fn meta_path(&self, symbol: &str) -> PathBuf {
        self.symbol_dir(symbol).join("meta.json")
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(symbol.to_string()).or_default().clone()
    }

    /// Day partitions present for a symbol, ascending by day.
    fn partitions(&self, symbol: &str) -> Result<Vec<(NaiveDate, PathBuf)>, StoreError> {
        let sym_dir = self.symbol_dir(symbol);
        if !sym_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&sym_dir)
            .map_err(|e| StoreError::Io(format!("read dir {}: {e}", sym_dir.display())))?;

        let mut days = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| StoreError::Io(format!("dir entry: {e}")))?
                .path();

            // Skip meta.json, .tmp leftovers and quarantined files
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            let day = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
            if let Some(day) = day {
                days.push((day, path));
            }
        }

        days.sort_by_key(|(day, _)| *day);
        Ok(days)
    }

    /// Load one partition. A corrupt file is quarantined and treated as
    /// absent; I/O errors go back to the caller untouched.
    fn load_partition(&self, symbol: &str, path: &Path) -> Result<Vec<Candle>, StoreError> {
        match load_and_validate_parquet(symbol, path) {
            Ok(candles) => Ok(candles),
            Err(e @ StoreError::Corrupt(_)) => {
                quarantine(path, &e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Days whose partition was quarantined and not yet refilled, ascending.
    fn quarantined_days(&self, symbol: &str) -> Result<Vec<NaiveDate>, StoreError> {
        let sym_dir = self.symbol_dir(symbol);
        if !sym_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&sym_dir)
            .map_err(|e| StoreError::Io(format!("read dir {}: {e}", sym_dir.display())))?;

        let mut days = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
            let day = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(QUARANTINE_SUFFIX))
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
            if let Some(day) = day {
                days.push(day);
            }
        }
        days.sort();
        days.dedup();
        Ok(days)
    }

    /// Drop the `pending` quarantine markers for days before `day`. Called
    /// once an upsert has reached `day`, which means the sync ran through the
    /// earlier days.
    fn clear_quarantine_before(
        &self,
        symbol: &str,
        pending: &[NaiveDate],
        day: NaiveDate,
    ) -> Result<(), StoreError> {
        for &q in pending {
            if q >= day {
                break;
            }
            let marker = self
                .symbol_dir(symbol)
                .join(format!("{}{QUARANTINE_SUFFIX}", q.format("%Y-%m-%d")));
            fs::remove_file(&marker)
                .map_err(|e| StoreError::Io(format!("remove {}: {e}", marker.display())))?;
            tracing::info!(symbol, day = %q, "quarantined partition refilled");
        }
        Ok(())
    }

    /// Load every partition, quarantining the corrupt ones. Returns the
    /// number of partitions that were quarantined by this call.
    pub fn verify(&self, symbol: &str) -> Result<usize, StoreError> {
        let mut quarantined = 0;
        for (_, path) in self.partitions(symbol)? {
            match load_and_validate_parquet(symbol, &path) {
                Ok(_) => {}
                Err(e @ StoreError::Corrupt(_)) => {
                    quarantine(&path, &e);
                    quarantined += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(quarantined)
    }

    /// Read the metadata sidecar, if present and readable.
    pub fn get_meta(&self, symbol: &str) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(symbol)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_meta(&self, meta: &StoreMeta) -> Result<(), StoreError> {
        let path = self.meta_path(&meta.symbol);
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| StoreError::Io(format!("meta serialization: {e}")))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| StoreError::Io(format!("meta write: {e}")))?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::Io(format!("meta rename: {e}"))
        })
    }

    /// Symbols that have a table directory in the store, sorted.
    pub fn list_symbols(&self) -> Result<Vec<String>, StoreError> {
        if !self.store_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.store_dir)
            .map_err(|e| StoreError::Io(format!("read dir {}: {e}", self.store_dir.display())))?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(sym) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("symbol="))
            {
                symbols.push(sym.to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }

    /// Which symbols have stored data, and their time ranges.
    pub fn status(&self, symbols: &[&str]) -> Vec<TableStatus> {
        symbols
            .iter()
            .map(|sym| {
                let meta = self.get_meta(sym);
                TableStatus {
                    symbol: sym.to_string(),
                    exists: self.symbol_dir(sym).exists(),
                    partitions: self.partitions(sym).map(|p| p.len()).unwrap_or(0),
                    first_time: meta.as_ref().and_then(|m| m.first_time),
                    last_time: meta.as_ref().and_then(|m| m.last_time),
                    bar_count: meta.as_ref().map(|m| m.bar_count),
                }
            })
            .collect()
    }
}

impl CandleStore for ParquetStore {
    fn ensure_table(&self, symbol: &str) -> Result<(), StoreError> {
        let sym_dir = self.symbol_dir(symbol);
        fs::create_dir_all(&sym_dir)
            .map_err(|e| StoreError::Io(format!("failed to create {}: {e}", sym_dir.display())))
    }

    /// Groups candles by UTC day and merges each group into its partition.
    fn upsert(&self, symbol: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        check_symbols(symbol, candles)?;
        if candles.is_empty() {
            return Ok(0);
        }

        let lock = self.symbol_lock(symbol);
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(|e| e.into_inner());

        self.ensure_table(symbol)?;
        // Markers set by this call stay until a later upsert passes them
        let pending_quarantine = self.quarantined_days(symbol)?;

        let mut by_day: BTreeMap<NaiveDate, Vec<&Candle>> = BTreeMap::new();
        for candle in candles {
            by_day
                .entry(candle.open_time.date_naive())
                .or_default()
                .push(candle);
        }

        let mut inserted = 0;
        for (day, day_candles) in &by_day {
            let path = self.day_path(symbol, *day);

            let mut merged: BTreeMap<DateTime<Utc>, Candle> = if path.exists() {
                self.load_partition(symbol, &path)?
                    .into_iter()
                    .map(|c| (c.open_time, c))
                    .collect()
            } else {
                BTreeMap::new()
            };

            let mut day_inserted = 0;
            for candle in day_candles {
                if !merged.contains_key(&candle.open_time) {
                    merged.insert(candle.open_time, (*candle).clone());
                    day_inserted += 1;
                }
            }
            if day_inserted == 0 {
                continue;
            }

            let rows: Vec<&Candle> = merged.values().collect();
            let df = candles_to_dataframe(&rows)?;
            let tmp_path = path.with_extension("parquet.tmp");
            write_parquet(&df, &tmp_path)?;

            // Atomic rename
            fs::rename(&tmp_path, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                StoreError::Io(format!("atomic rename failed: {e}"))
            })?;

            inserted += day_inserted;
        }

        if let Some(last_day) = by_day.keys().next_back() {
            self.clear_quarantine_before(symbol, &pending_quarantine, *last_day)?;
        }

        if inserted > 0 {
            let first = candles.iter().map(|c| c.open_time).min();
            let last = candles.iter().map(|c| c.open_time).max();
            let previous = self.get_meta(symbol);
            let meta = StoreMeta {
                symbol: symbol.to_string(),
                first_time: min_opt(previous.as_ref().and_then(|m| m.first_time), first),
                last_time: max_opt(previous.as_ref().and_then(|m| m.last_time), last),
                bar_count: previous.as_ref().map_or(0, |m| m.bar_count) + inserted,
                updated_at: Utc::now(),
            };
            self.write_meta(&meta)?;
        }

        tracing::debug!(symbol, received = candles.len(), inserted, "upserted candles");
        Ok(inserted)
    }

    /// Newest stored open time below the earliest quarantined day, so a
    /// lost day is fetched again before anything after it counts.
    fn max_timestamp(&self, symbol: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let cap = self.quarantined_days(symbol)?.first().copied();
        for (day, path) in self.partitions(symbol)?.iter().rev() {
            if cap.is_some_and(|q| *day >= q) {
                continue;
            }
            let candles = self.load_partition(symbol, path)?;
            if let Some(last) = candles.iter().map(|c| c.open_time).max() {
                return Ok(Some(last));
            }
        }
        Ok(None)
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
        let (first_day, last_day) = (start.date_naive(), end.date_naive());

        let mut out = Vec::new();
        for (day, path) in self.partitions(symbol)? {
            if day < first_day || day > last_day {
                continue;
            }
            out.extend(
                self.load_partition(symbol, &path)?
                    .into_iter()
                    .filter(|c| c.open_time >= start && c.open_time <= end),
            );
        }

        out.sort_by_key(|c| c.open_time);
        Ok(out)
    }
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

const QUARANTINE_SUFFIX: &str = ".parquet.quarantined";

fn quarantine(path: &Path, err: &StoreError) {
    let target = path.with_extension("parquet.quarantined");
    tracing::warn!(
        file = %path.display(),
        error = %err,
        "quarantining corrupt store partition"
    );
    if let Err(e) = fs::rename(path, &target) {
        tracing::warn!(file = %path.display(), error = %e, "quarantine rename failed");
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

/// Convert candles to a Polars DataFrame.
fn candles_to_dataframe(candles: &[&Candle]) -> Result<DataFrame, StoreError> {
    let times: Vec<i64> = candles.iter().map(|c| c.open_time.timestamp_millis()).collect();
    let decimals = |f: fn(&Candle) -> Decimal| -> Vec<String> {
        candles.iter().map(|c| f(c).to_string()).collect()
    };

    DataFrame::new(vec![
        Column::new("time".into(), times)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| StoreError::Parquet(format!("time cast: {e}")))?,
        Column::new("open".into(), decimals(|c| c.open)),
        Column::new("high".into(), decimals(|c| c.high)),
        Column::new("low".into(), decimals(|c| c.low)),
        Column::new("close".into(), decimals(|c| c.close)),
        Column::new("volume".into(), decimals(|c| c.volume)),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}

/// Write a DataFrame to a Parquet file.
fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), StoreError> {
    let file =
        fs::File::create(path).map_err(|e| StoreError::Io(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

/// Load a Parquet partition and validate its integrity.
fn load_and_validate_parquet(symbol: &str, path: &Path) -> Result<Vec<Candle>, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::Io(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Corrupt(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(StoreError::Corrupt("empty parquet file".into()));
    }
    CandleSchema::validate(&df).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    dataframe_to_candles(symbol, &df)
}

/// Convert a DataFrame back to candles.
fn dataframe_to_candles(symbol: &str, df: &DataFrame) -> Result<Vec<Candle>, StoreError> {
    let corrupt = |e: PolarsError| StoreError::Corrupt(format!("column read: {e}"));

    let time_ca = df.column("time").map_err(corrupt)?.datetime().map_err(corrupt)?;
    let open_ca = df.column("open").map_err(corrupt)?.str().map_err(corrupt)?;
    let high_ca = df.column("high").map_err(corrupt)?.str().map_err(corrupt)?;
    let low_ca = df.column("low").map_err(corrupt)?.str().map_err(corrupt)?;
    let close_ca = df.column("close").map_err(corrupt)?.str().map_err(corrupt)?;
    let vol_ca = df.column("volume").map_err(corrupt)?.str().map_err(corrupt)?;

    let decimal_at = |ca: &StringChunked, name: &str, i: usize| -> Result<Decimal, StoreError> {
        let raw = ca
            .get(i)
            .ok_or_else(|| StoreError::Corrupt(format!("null {name} at row {i}")))?;
        Decimal::from_str(raw)
            .map_err(|e| StoreError::Corrupt(format!("bad {name} '{raw}' at row {i}: {e}")))
    };

    let n = df.height();
    let mut candles = Vec::with_capacity(n);
    for i in 0..n {
        let ms = time_ca
            .get(i)
            .ok_or_else(|| StoreError::Corrupt(format!("null time at row {i}")))?;
        let open_time = DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| StoreError::Corrupt(format!("time out of range at row {i}")))?;

        candles.push(Candle {
            symbol: symbol.to_string(),
            open_time,
            open: decimal_at(open_ca, "open", i)?,
            high: decimal_at(high_ca, "high", i)?,
            low: decimal_at(low_ca, "low", i)?,
            close: decimal_at(close_ca, "close", i)?,
            volume: decimal_at(vol_ca, "volume", i)?,
        });
    }

    Ok(candles)
}
