//! One synchronization pass over the whole universe.
//!
//! The horizon and the checkpoint map are fixed at pass start. Symbols run
//! sequentially when `concurrency` is 1, otherwise on a bounded Rayon pool;
//! either way a failing symbol never affects the others.

use std::sync::atomic::AtomicBool;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use barsync_core::domain::SymbolDescriptor;

use crate::engine::{SymbolOutcome, SymbolReport, SyncEngine, SyncError};

/// Explicit range overrides for a pass (CLI `--start` / `--end`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    /// Exclusive end every symbol was synced towards.
    pub horizon_end: DateTime<Utc>,
    pub reports: Vec<SymbolReport>,
    pub elapsed_secs: f64,
}

impl PassSummary {
    pub fn failed(&self) -> Vec<&SymbolReport> {
        self.reports.iter().filter(|r| r.is_failed()).collect()
    }

    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(|r| r.is_failed())
    }

    pub fn rows_inserted(&self) -> usize {
        self.reports.iter().map(|r| r.rows_inserted).sum()
    }

    pub fn count(&self, pred: impl Fn(&SymbolOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn report(&self, symbol: &str) -> Option<&SymbolReport> {
        self.reports.iter().find(|r| r.symbol == symbol)
    }
}

/// Run one pass over `descriptors`, in universe order.
///
/// Only setup problems (the thread pool) are errors; per-symbol failures are
/// reported in the summary.
pub fn run_pass(
    engine: &SyncEngine,
    descriptors: &[SymbolDescriptor],
    options: &PassOptions,
    cancel: Option<&AtomicBool>,
) -> Result<PassSummary, SyncError> {
    let started = Instant::now();
    let started_at = Utc::now();
    let horizon = engine.horizon(options.start, options.end, started_at);
    let checkpoints = engine.tracker().load();
    let concurrency = engine.settings().concurrency;

    tracing::info!(
        symbols = descriptors.len(),
        end = %horizon.end,
        concurrency,
        "starting sync pass"
    );

    let sync_one = |d: &SymbolDescriptor| {
        engine.sync_symbol(d, checkpoints.get(&d.symbol).copied(), &horizon, cancel)
    };

    let reports: Vec<SymbolReport> = if concurrency > 1 && descriptors.len() > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.min(descriptors.len()))
            .thread_name(|i| format!("barsync-sync-{i}"))
            .build()
            .map_err(|e| SyncError::ThreadPool(e.to_string()))?;
        pool.install(|| descriptors.par_iter().map(sync_one).collect())
    } else {
        descriptors.iter().map(sync_one).collect()
    };

    let summary = PassSummary {
        started_at,
        horizon_end: horizon.end,
        reports,
        elapsed_secs: started.elapsed().as_secs_f64(),
    };

    tracing::info!(
        synced = summary.count(|o| matches!(o, SymbolOutcome::Synced)),
        up_to_date = summary.count(|o| matches!(o, SymbolOutcome::UpToDate)),
        failed = summary.count(|o| matches!(o, SymbolOutcome::Failed { .. })),
        cancelled = summary.count(|o| matches!(o, SymbolOutcome::Cancelled)),
        rows_inserted = summary.rows_inserted(),
        elapsed_secs = summary.elapsed_secs,
        "sync pass finished"
    );

    Ok(summary)
}
