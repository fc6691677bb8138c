//! Integration tests for the synchronization engine.
//!
//! Drives passes against an in-process scripted market and checks stored
//! rows, fetch calls and checkpoints: fresh backfill, incremental catch-up,
//! retry after transient failures, empty chunks, per-symbol isolation,
//! crash recovery and forever mode.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use barsync_core::data::{
    CandleSource, CandleStore, FetchError, MemoryStore, ParquetStore, ProgressTracker,
};
use barsync_core::domain::{Candle, Interval, SymbolDescriptor};
use barsync_runner::{
    run_forever, run_once, run_pass, ForeverSettings, PassOptions, SymbolOutcome, SyncEngine,
    SyncError,
};
use common::{at, settings, Call, Harness, ScriptedSource};

fn eth() -> Vec<SymbolDescriptor> {
    vec![SymbolDescriptor::new("ETHUSDT")]
}

fn until(m: i64) -> PassOptions {
    PassOptions {
        start: None,
        end: Some(at(m)),
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn fresh_symbol_is_backfilled_in_one_chunk() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);

    let summary = run_pass(&h.engine, &eth(), &until(5), None).unwrap();
    let report = summary.report("ETHUSDT").unwrap();

    assert_eq!(report.outcome, SymbolOutcome::Synced);
    assert_eq!(report.rows_inserted, 5);
    assert_eq!(report.chunks, 1);
    assert_eq!(h.stored_minutes("ETHUSDT"), vec![0, 1, 2, 3, 4]);
    assert_eq!(h.tracker.get("ETHUSDT"), Some(at(5)));
    assert_eq!(
        h.source.calls(),
        vec![Call {
            symbol: "ETHUSDT".into(),
            start: at(0),
            end: at(5)
        }]
    );
}

#[test]
fn second_run_fetches_only_new_bars() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);
    run_pass(&h.engine, &eth(), &until(5), None).unwrap();

    h.source.list("ETHUSDT", 5..10);
    h.source.clear_calls();
    let h = h.restart(settings(1000));
    let summary = run_pass(&h.engine, &eth(), &until(10), None).unwrap();

    let report = summary.report("ETHUSDT").unwrap();
    assert_eq!(report.rows_inserted, 5);
    assert_eq!(h.source.calls()[0].start, at(5));
    assert_eq!(h.stored_minutes("ETHUSDT"), (0..10).collect::<Vec<_>>());
    assert_eq!(h.tracker.get("ETHUSDT"), Some(at(10)));
}

#[test]
fn transient_fetch_error_is_retried_without_moving_the_cursor() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);
    h.source
        .fail_next([FetchError::Network("connection reset".into())]);

    let summary = run_pass(&h.engine, &eth(), &until(5), None).unwrap();
    let report = summary.report("ETHUSDT").unwrap();

    assert_eq!(report.outcome, SymbolOutcome::Synced);
    assert_eq!(report.retries, 1);
    assert_eq!(report.rows_inserted, 5);

    let calls = h.source.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
    assert_eq!(h.stored_minutes("ETHUSDT"), vec![0, 1, 2, 3, 4]);
}

#[test]
fn empty_chunk_advances_to_chunk_end() {
    let h = Harness::new(1000, settings(2));
    h.source.list("ETHUSDT", [0, 1, 4, 5]);

    let summary = run_pass(&h.engine, &eth(), &until(6), None).unwrap();
    let report = summary.report("ETHUSDT").unwrap();

    let spans: Vec<_> = h.source.calls().iter().map(|c| (c.start, c.end)).collect();
    assert_eq!(
        spans,
        vec![(at(0), at(2)), (at(2), at(4)), (at(4), at(6))]
    );
    assert_eq!(report.empty_chunks, 1);
    assert_eq!(report.rows_inserted, 4);
    assert_eq!(h.stored_minutes("ETHUSDT"), vec![0, 1, 4, 5]);
    assert_eq!(h.tracker.get("ETHUSDT"), Some(at(6)));
}

// ── Resume & checkpoints ─────────────────────────────────────────────

#[test]
fn caught_up_symbol_makes_no_request() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);
    run_pass(&h.engine, &eth(), &until(5), None).unwrap();
    h.source.clear_calls();

    let summary = run_pass(&h.engine, &eth(), &until(5), None).unwrap();
    assert_eq!(
        summary.report("ETHUSDT").unwrap().outcome,
        SymbolOutcome::UpToDate
    );
    assert!(h.source.calls().is_empty());
}

#[test]
fn short_chunk_advances_past_last_returned_bar() {
    let h = Harness::new(1000, settings(10));
    h.source.list("ETHUSDT", 0..5);

    let summary = run_pass(&h.engine, &eth(), &until(10), None).unwrap();
    let spans: Vec<_> = h.source.calls().iter().map(|c| (c.start, c.end)).collect();

    // [0,10) returns bars 0..=4, so the next chunk starts at 5, not 10
    assert_eq!(spans, vec![(at(0), at(10)), (at(5), at(10))]);
    assert_eq!(summary.report("ETHUSDT").unwrap().empty_chunks, 1);
    assert_eq!(h.tracker.get("ETHUSDT"), Some(at(10)));
}

#[test]
fn crash_before_checkpoint_resumes_from_store() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..6);

    // Rows 0..3 were persisted but the process died before checkpointing
    let persisted: Vec<_> = (0..3).map(|m| common::bar("ETHUSDT", at(m))).collect();
    h.store.inner.upsert("ETHUSDT", &persisted).unwrap();
    assert_eq!(h.tracker.get("ETHUSDT"), None);

    let summary = run_pass(&h.engine, &eth(), &until(6), None).unwrap();
    assert_eq!(h.source.calls()[0].start, at(3));
    assert_eq!(summary.report("ETHUSDT").unwrap().rows_inserted, 3);
    assert_eq!(h.stored_minutes("ETHUSDT"), (0..6).collect::<Vec<_>>());
}

#[test]
fn lagging_checkpoint_refetches_without_duplicates() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..8);
    let persisted: Vec<_> = (0..5).map(|m| common::bar("ETHUSDT", at(m))).collect();
    h.store.inner.upsert("ETHUSDT", &persisted).unwrap();
    h.tracker.record("ETHUSDT", at(1)).unwrap();

    let summary = run_pass(&h.engine, &eth(), &until(8), None).unwrap();
    let report = summary.report("ETHUSDT").unwrap();

    assert_eq!(h.source.calls()[0].start, at(1));
    assert_eq!(report.rows_fetched, 7);
    assert_eq!(report.rows_inserted, 3);
    assert_eq!(h.stored_minutes("ETHUSDT"), (0..8).collect::<Vec<_>>());
}

#[test]
fn checkpoint_ahead_of_store_is_not_trusted() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..8);
    let persisted: Vec<_> = (0..3).map(|m| common::bar("ETHUSDT", at(m))).collect();
    h.store.inner.upsert("ETHUSDT", &persisted).unwrap();
    h.tracker.record("ETHUSDT", at(8)).unwrap();

    run_pass(&h.engine, &eth(), &until(8), None).unwrap();
    assert_eq!(h.source.calls()[0].start, at(3));
    assert_eq!(h.stored_minutes("ETHUSDT"), (0..8).collect::<Vec<_>>());
    // Never moved backwards
    assert_eq!(h.tracker.get("ETHUSDT"), Some(at(8)));
}

/// Records the checkpoint visible at the moment each fetch starts, and fails
/// the calls whose index is listed in `fail_on`.
struct CheckpointProbe {
    inner: Arc<ScriptedSource>,
    tracker: Arc<ProgressTracker>,
    seen: Mutex<Vec<Option<chrono::DateTime<chrono::Utc>>>>,
    fail_on: Vec<usize>,
}

impl CheckpointProbe {
    fn new(inner: Arc<ScriptedSource>, tracker: Arc<ProgressTracker>, fail_on: Vec<usize>) -> Self {
        Self {
            inner,
            tracker,
            seen: Mutex::new(Vec::new()),
            fail_on,
        }
    }
}

impl CandleSource for CheckpointProbe {
    fn name(&self) -> &str {
        "checkpoint_probe"
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        let call = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(self.tracker.get(symbol));
            seen.len() - 1
        };
        if self.fail_on.contains(&call) {
            return Err(FetchError::Network("connection reset".into()));
        }
        self.inner.fetch(symbol, interval, start, end)
    }
}

#[test]
fn checkpoint_is_written_before_the_next_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(ScriptedSource::new(1000));
    market.list("ETHUSDT", 0..6);
    let tracker = Arc::new(ProgressTracker::new(dir.path().join("last_fetch.json")));
    let probe = Arc::new(CheckpointProbe::new(market, tracker.clone(), Vec::new()));
    let engine = SyncEngine::new(
        probe.clone(),
        Arc::new(MemoryStore::new()),
        tracker.clone(),
        settings(2),
    );

    run_pass(&engine, &eth(), &until(6), None).unwrap();

    assert_eq!(
        *probe.seen.lock().unwrap(),
        vec![None, Some(at(2)), Some(at(4))]
    );
    assert_eq!(tracker.get("ETHUSDT"), Some(at(6)));
}

#[test]
fn failed_attempt_leaves_the_checkpoint_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(ScriptedSource::new(1000));
    market.list("ETHUSDT", 0..6);
    let tracker = Arc::new(ProgressTracker::new(dir.path().join("last_fetch.json")));
    let probe = Arc::new(CheckpointProbe::new(market, tracker.clone(), vec![1]));
    let engine = SyncEngine::new(
        probe.clone(),
        Arc::new(MemoryStore::new()),
        tracker.clone(),
        settings(2),
    );

    let summary = run_pass(&engine, &eth(), &until(6), None).unwrap();

    // The retry of the second chunk sees the same checkpoint as the failed try
    assert_eq!(
        *probe.seen.lock().unwrap(),
        vec![None, Some(at(2)), Some(at(2)), Some(at(4))]
    );
    assert_eq!(summary.report("ETHUSDT").unwrap().retries, 1);
    assert_eq!(tracker.get("ETHUSDT"), Some(at(6)));
}

#[test]
fn first_available_and_start_override_bound_the_range() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..6);
    h.source.list("BTCUSDT", 0..6);

    let descriptors = vec![
        SymbolDescriptor::new("ETHUSDT").with_first_available(at(3)),
        SymbolDescriptor::new("BTCUSDT"),
    ];
    run_pass(&h.engine, &descriptors, &until(6), None).unwrap();
    assert_eq!(h.stored_minutes("ETHUSDT"), vec![3, 4, 5]);
    assert_eq!(h.stored_minutes("BTCUSDT"), (0..6).collect::<Vec<_>>());

    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..6);
    let options = PassOptions {
        start: Some(at(4)),
        end: Some(at(6)),
    };
    run_pass(&h.engine, &descriptors[..1], &options, None).unwrap();
    assert_eq!(h.stored_minutes("ETHUSDT"), vec![4, 5]);
}

// ── Failure handling ─────────────────────────────────────────────────

#[test]
fn store_failure_during_upsert_is_retried() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);
    h.store.upsert_failures.store(2, Ordering::SeqCst);

    let summary = run_pass(&h.engine, &eth(), &until(5), None).unwrap();
    let report = summary.report("ETHUSDT").unwrap();

    assert_eq!(report.retries, 2);
    assert_eq!(h.source.calls().len(), 3);
    assert_eq!(h.stored_minutes("ETHUSDT"), vec![0, 1, 2, 3, 4]);
}

#[test]
fn rate_limit_and_payload_errors_are_retried() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..3);
    h.source.fail_next([
        FetchError::RateLimited {
            status: 429,
            retry_after_secs: Some(1),
        },
        FetchError::Timeout { timeout_secs: 10 },
        FetchError::Payload("truncated body".into()),
    ]);

    let summary = run_pass(&h.engine, &eth(), &until(3), None).unwrap();
    assert_eq!(summary.report("ETHUSDT").unwrap().retries, 3);
    assert_eq!(h.stored_minutes("ETHUSDT"), vec![0, 1, 2]);
}

/// Serves rows with `high` zeroed at the given minutes for the first
/// `bad_calls` fetches, then the clean rows.
struct TamperedRows {
    inner: Arc<ScriptedSource>,
    bad_calls: AtomicUsize,
    bad_minutes: Vec<i64>,
}

impl CandleSource for TamperedRows {
    fn name(&self) -> &str {
        "tampered"
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut rows = self.inner.fetch(symbol, interval, start, end)?;
        let pending = self.bad_calls.load(Ordering::SeqCst);
        if pending > 0 {
            self.bad_calls.store(pending - 1, Ordering::SeqCst);
            for row in &mut rows {
                if self.bad_minutes.iter().any(|&m| row.open_time == at(m)) {
                    row.high = rust_decimal::Decimal::ZERO;
                }
            }
        }
        Ok(rows)
    }
}

#[test]
fn invalid_rows_fail_the_chunk_instead_of_leaving_a_gap() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(ScriptedSource::new(1000));
    market.list("ETHUSDT", 0..5);
    let source = Arc::new(TamperedRows {
        inner: market.clone(),
        bad_calls: AtomicUsize::new(2),
        bad_minutes: vec![2, 4],
    });
    let store = Arc::new(MemoryStore::new());
    let tracker = Arc::new(ProgressTracker::new(dir.path().join("last_fetch.json")));
    let engine = SyncEngine::new(source, store.clone(), tracker.clone(), settings(1000));

    let summary = run_pass(&engine, &eth(), &until(5), None).unwrap();
    let report = summary.report("ETHUSDT").unwrap();

    assert_eq!(report.outcome, SymbolOutcome::Synced);
    assert_eq!(report.retries, 2);
    assert_eq!(report.rows_inserted, 5);
    let calls = market.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.start == at(0) && c.end == at(5)));
    assert_eq!(store.row_count("ETHUSDT"), 5);
    assert_eq!(tracker.get("ETHUSDT"), Some(at(5)));
}

#[test]
fn unreachable_store_skips_only_that_symbol() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);
    h.source.list("BTCUSDT", 0..5);
    h.store
        .unreachable
        .lock()
        .unwrap()
        .push("BTCUSDT".into());

    let descriptors = vec![
        SymbolDescriptor::new("BTCUSDT"),
        SymbolDescriptor::new("ETHUSDT"),
    ];
    let summary = run_pass(&h.engine, &descriptors, &until(5), None).unwrap();

    assert!(summary.has_failures());
    assert_eq!(summary.failed().len(), 1);
    assert!(summary.report("BTCUSDT").unwrap().is_failed());
    assert_eq!(
        summary.report("ETHUSDT").unwrap().outcome,
        SymbolOutcome::Synced
    );
    assert!(h.source.calls_for("BTCUSDT").is_empty());
    assert_eq!(h.tracker.get("BTCUSDT"), None);
    assert_eq!(h.stored_minutes("ETHUSDT").len(), 5);
}

#[test]
fn cancel_stops_before_the_next_fetch() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);
    let cancel = AtomicBool::new(true);

    let summary = run_pass(&h.engine, &eth(), &until(5), Some(&cancel)).unwrap();
    assert_eq!(
        summary.report("ETHUSDT").unwrap().outcome,
        SymbolOutcome::Cancelled
    );
    assert!(h.source.calls().is_empty());
}

// ── Concurrency ──────────────────────────────────────────────────────

#[test]
fn bounded_pool_syncs_every_symbol() {
    let mut s = settings(3);
    s.concurrency = 3;
    let h = Harness::new(1000, s);
    let names = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT"];
    for n in names {
        h.source.list(n, 0..10);
    }
    let descriptors: Vec<_> = names.iter().map(|n| SymbolDescriptor::new(*n)).collect();

    let summary = run_pass(&h.engine, &descriptors, &until(10), None).unwrap();

    // Reports come back in universe order
    let order: Vec<_> = summary.reports.iter().map(|r| r.symbol.as_str()).collect();
    assert_eq!(order, names);
    for n in names {
        assert_eq!(h.stored_minutes(n), (0..10).collect::<Vec<_>>());
        assert_eq!(h.tracker.get(n), Some(at(10)));
    }
    assert_eq!(h.tracker.load().len(), names.len());
}

#[test]
fn chunk_bars_are_clamped_to_the_source_cap() {
    let h = Harness::new(4, settings(1000));
    assert_eq!(h.engine.settings().chunk_bars, 4);
    assert_eq!(h.engine.chunk_span(), chrono::Duration::minutes(4));
}

#[test]
fn oversized_chunk_saturates_to_the_horizon() {
    let h = Harness::new(usize::MAX, settings(usize::MAX));
    h.source.list("ETHUSDT", 0..5);
    assert_eq!(h.engine.chunk_span(), chrono::Duration::MAX);

    run_pass(&h.engine, &eth(), &until(5), None).unwrap();
    assert_eq!(
        h.source.calls(),
        vec![Call {
            symbol: "ETHUSDT".into(),
            start: at(0),
            end: at(5)
        }]
    );
}

// ── Service loops ────────────────────────────────────────────────────

#[test]
fn run_once_over_parquet_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ScriptedSource::new(1000));
    source.list("ETHUSDT", 0..5);

    let build = |source: Arc<ScriptedSource>| {
        SyncEngine::new(
            source,
            Arc::new(ParquetStore::new(dir.path().join("store"))),
            Arc::new(ProgressTracker::new(dir.path().join("last_fetch.json"))),
            settings(1000),
        )
    };

    let engine = build(source.clone());
    run_once(&engine, &eth(), &until(5), None).unwrap();
    drop(engine);

    source.list("ETHUSDT", 5..10);
    source.clear_calls();
    let engine = build(source.clone());
    let summary = run_once(&engine, &eth(), &until(10), None).unwrap();

    assert_eq!(source.calls()[0].start, at(5));
    assert_eq!(summary.rows_inserted(), 5);
    let rows = engine.store().query("ETHUSDT", at(0), at(9)).unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows.windows(2).all(|w| w[0].open_time < w[1].open_time));
}

#[test]
fn corrupt_middle_day_is_fetched_again_next_pass() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ScriptedSource::new(1000));
    // Two bars on each of Jan 1, 2 and 3
    let minutes = [0, 1, 1440, 1441, 2880, 2881];
    source.list("ETHUSDT", minutes);
    let store_dir = dir.path().join("store");
    let engine = SyncEngine::new(
        source.clone(),
        Arc::new(ParquetStore::new(&store_dir)),
        Arc::new(ProgressTracker::new(dir.path().join("last_fetch.json"))),
        settings(1000),
    );

    run_once(&engine, &eth(), &until(2882), None).unwrap();
    std::fs::write(
        store_dir.join("symbol=ETHUSDT").join("2024-01-02.parquet"),
        b"junk",
    )
    .unwrap();

    // A read notices the damage and sets the day aside
    let rows = engine.store().query("ETHUSDT", at(0), at(2881)).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(engine.store().max_timestamp("ETHUSDT").unwrap(), Some(at(1)));

    source.clear_calls();
    let summary = run_once(&engine, &eth(), &until(2882), None).unwrap();

    assert_eq!(source.calls()[0].start, at(2));
    assert_eq!(summary.rows_inserted(), 2);
    let times: Vec<i64> = engine
        .store()
        .query("ETHUSDT", at(0), at(2881))
        .unwrap()
        .iter()
        .map(|c| (c.open_time - at(0)).num_minutes())
        .collect();
    assert_eq!(times, minutes);
    assert_eq!(
        engine.store().max_timestamp("ETHUSDT").unwrap(),
        Some(at(2881))
    );
}

#[test]
fn forever_mode_repeats_passes_and_survives_setup_errors() {
    let h = Harness::new(1000, settings(1000));
    h.source.list("ETHUSDT", 0..5);

    let loads = AtomicUsize::new(0);
    let load = || {
        if loads.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(SyncError::ThreadPool("simulated".into()))
        } else {
            Ok(eth())
        }
    };
    let forever = ForeverSettings {
        pass_interval: Duration::ZERO,
        retry_delay: Duration::from_millis(1),
        max_passes: Some(3),
    };

    let totals = run_forever(&h.engine, load, &until(5), &forever, None);

    assert_eq!(totals.passes, 3);
    assert_eq!(totals.failed_passes, 1);
    assert_eq!(totals.rows_inserted, 5);
    // Third pass found nothing to do
    assert_eq!(h.source.calls().len(), 1);
}

#[test]
fn forever_mode_stops_when_cancelled() {
    let h = Harness::new(1000, settings(1000));
    let cancel = AtomicBool::new(true);
    let forever = ForeverSettings {
        pass_interval: Duration::from_secs(3600),
        retry_delay: Duration::from_secs(3600),
        max_passes: None,
    };
    let totals = run_forever(&h.engine, || Ok(eth()), &until(5), &forever, Some(&cancel));
    assert_eq!(totals.passes, 0);
}
