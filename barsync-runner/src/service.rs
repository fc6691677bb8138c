//! Service entry points: build an engine from config, run once or forever.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use barsync_core::data::{BinanceSource, ParquetStore, ProgressTracker, Universe};
use barsync_core::domain::SymbolDescriptor;

use crate::config::SyncConfig;
use crate::engine::{is_cancelled, sleep_unless_cancelled, EngineSettings, SyncEngine, SyncError};
use crate::pass::{run_pass, PassOptions, PassSummary};

/// Build the production engine: Binance source, Parquet store, JSON tracker.
pub fn build_engine(config: &SyncConfig) -> Result<SyncEngine, SyncError> {
    config.validate()?;
    let source = BinanceSource::new(&config.source)?;
    let store = ParquetStore::new(&config.store.dir);
    let tracker = ProgressTracker::new(&config.progress.path);

    tracing::info!(
        source = %config.source.base_url,
        interval = %config.source.interval,
        store = %config.store.dir.display(),
        progress = %config.progress.path.display(),
        "engine ready"
    );

    Ok(SyncEngine::new(
        Arc::new(source),
        Arc::new(store),
        Arc::new(tracker),
        EngineSettings::from_config(config),
    ))
}

/// Load the universe file and turn it into descriptors.
pub fn load_descriptors(path: &Path) -> Result<Vec<SymbolDescriptor>, SyncError> {
    let universe = Universe::from_file(path)?;
    tracing::debug!(path = %path.display(), symbols = universe.len(), "universe loaded");
    Ok(universe.descriptors())
}

/// Run a single pass and return its summary.
pub fn run_once(
    engine: &SyncEngine,
    descriptors: &[SymbolDescriptor],
    options: &PassOptions,
    cancel: Option<&AtomicBool>,
) -> Result<PassSummary, SyncError> {
    run_pass(engine, descriptors, options, cancel)
}

/// Pacing for forever mode.
#[derive(Debug, Clone)]
pub struct ForeverSettings {
    /// Pause after a successful pass.
    pub pass_interval: Duration,
    /// Pause after a pass that could not run.
    pub retry_delay: Duration,
    /// Stop after this many passes (`None` = run until cancelled).
    pub max_passes: Option<usize>,
}

impl ForeverSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            pass_interval: config.pass_interval(),
            retry_delay: config.retry_delay(),
            max_passes: None,
        }
    }
}

/// Totals across forever-mode passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeverSummary {
    pub passes: usize,
    pub failed_passes: usize,
    pub rows_inserted: usize,
}

/// Repeat passes until cancelled or `max_passes` is reached.
///
/// `load` runs before every pass, so symbols added to the universe file are
/// picked up without a restart. A pass that cannot start (unreadable
/// universe, thread pool failure) is logged and retried after `retry_delay`.
pub fn run_forever<L>(
    engine: &SyncEngine,
    load: L,
    options: &PassOptions,
    settings: &ForeverSettings,
    cancel: Option<&AtomicBool>,
) -> ForeverSummary
where
    L: Fn() -> Result<Vec<SymbolDescriptor>, SyncError>,
{
    let mut totals = ForeverSummary::default();

    loop {
        if is_cancelled(cancel) {
            break;
        }
        if settings.max_passes.is_some_and(|max| totals.passes >= max) {
            break;
        }

        let result = load().and_then(|descriptors| run_pass(engine, &descriptors, options, cancel));
        totals.passes += 1;

        let pause = match result {
            Ok(summary) => {
                totals.rows_inserted += summary.rows_inserted();
                if summary.has_failures() {
                    tracing::warn!(
                        pass = totals.passes,
                        failed = summary.failed().len(),
                        "pass finished with failed symbols, they are retried next pass"
                    );
                }
                settings.pass_interval
            }
            Err(e) => {
                totals.failed_passes += 1;
                tracing::error!(pass = totals.passes, error = %e, "sync pass failed");
                settings.retry_delay
            }
        };

        if settings.max_passes.is_some_and(|max| totals.passes >= max) {
            break;
        }
        sleep_unless_cancelled(pause, cancel);
    }

    tracing::info!(
        passes = totals.passes,
        failed_passes = totals.failed_passes,
        rows_inserted = totals.rows_inserted,
        "sync service stopped"
    );
    totals
}
