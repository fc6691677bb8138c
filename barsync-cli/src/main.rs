//! BarSync CLI: sync, discovery, query and store commands.
//!
//! Commands:
//! - `sync`: backfill every universe symbol up to now (or `--end`), once or forever
//! - `discover`: find first-available dates and write them to the universe file
//! - `query`: print or export stored candles, optionally resampled
//! - `store status`: report stored symbols, time ranges and checkpoints
//! - `store verify`: quarantine corrupt partitions so the next sync refills them

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use barsync_core::data::{
    find_first_available, resample, BinanceSource, CandleStore, DiscoveryOptions, ParquetStore,
    ProgressTracker, Universe,
};
use barsync_core::domain::{canonical_symbol, parse_utc, Candle, Interval};
use barsync_runner::{
    build_engine, load_descriptors, run_forever, run_once, ForeverSettings, PassOptions,
    PassSummary, SymbolOutcome, SyncConfig,
};

const DEFAULT_CONFIG: &str = "config/barsync.toml";

#[derive(Parser)]
#[command(
    name = "barsync",
    version,
    about = "BarSync CLI: incremental OHLCV candle backfill"
)]
struct Cli {
    /// Path to the TOML config file. Defaults to ./config/barsync.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill every symbol in the universe.
    Sync {
        /// Start for every symbol (RFC 3339 or YYYY-MM-DD), overriding first-available dates.
        #[arg(long)]
        start: Option<String>,

        /// Exclusive end (RFC 3339 or YYYY-MM-DD). Defaults to now.
        #[arg(long, conflicts_with = "forever")]
        end: Option<String>,

        /// Keep running passes until the process is stopped.
        #[arg(long, default_value_t = false)]
        forever: bool,
    },
    /// Find the first day each symbol has data and record it in the universe file.
    Discover {
        /// First day to probe (YYYY-MM-DD). Defaults to 2017-01-01.
        #[arg(long)]
        since: Option<String>,

        /// Re-discover symbols that already have a date.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Print or export stored candles.
    Query {
        /// Symbol, base (btc) or full (BTCUSDT).
        symbol: String,

        /// First open time (inclusive).
        #[arg(long)]
        start: String,

        /// Last open time (inclusive).
        #[arg(long)]
        end: String,

        /// Aggregate into a coarser interval (e.g. 1h).
        #[arg(long)]
        resample: Option<Interval>,

        /// Write CSV to this path instead of printing a table.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Store management commands.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Report stored symbols, time ranges, row counts and checkpoints.
    Status {
        /// Print one JSON object per symbol instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Read every partition and quarantine corrupt ones, so the next sync
    /// fetches the lost days again.
    Verify,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync {
            start,
            end,
            forever,
        } => run_sync(&config, start, end, forever),
        Commands::Discover { since, all } => run_discover(&config, since, all),
        Commands::Query {
            symbol,
            start,
            end,
            resample,
            csv,
        } => run_query(&config, &symbol, &start, &end, resample, csv),
        Commands::Store { action } => match action {
            StoreAction::Status { json } => run_store_status(&config, json),
            StoreAction::Verify => run_store_verify(&config),
        },
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(p) => SyncConfig::from_file(p).with_context(|| format!("loading {}", p.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => SyncConfig::from_file(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("loading {DEFAULT_CONFIG}")),
        None => {
            tracing::info!("no config file, using defaults");
            Ok(SyncConfig::default())
        }
    }
}

fn parse_opt_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    Ok(value.map(parse_utc).transpose()?)
}

fn run_sync(
    config: &SyncConfig,
    start: Option<String>,
    end: Option<String>,
    forever: bool,
) -> Result<()> {
    let options = PassOptions {
        start: parse_opt_time(start.as_deref())?,
        end: parse_opt_time(end.as_deref())?,
    };
    if let (Some(s), Some(e)) = (options.start, options.end) {
        if s >= e {
            bail!("--start ({s}) must be before --end ({e})");
        }
    }

    let engine = build_engine(config)?;
    let universe_path = config.universe.path.clone();

    if forever {
        // A broken universe file is a setup error, not a retried pass
        load_descriptors(&universe_path)?;
        let settings = ForeverSettings::from_config(config);
        run_forever(
            &engine,
            || load_descriptors(&universe_path),
            &options,
            &settings,
            None,
        );
        return Ok(());
    }

    let descriptors = load_descriptors(&universe_path)?;
    let summary = run_once(&engine, &descriptors, &options, None)?;
    print_pass_summary(&summary);

    if summary.has_failures() {
        for report in summary.failed() {
            if let SymbolOutcome::Failed { error } = &report.outcome {
                eprintln!("Error for {}: {error}", report.symbol);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

fn print_pass_summary(summary: &PassSummary) {
    println!("Synced up to {}", summary.horizon_end);
    println!();
    println!(
        "{:<12} {:<11} {:>8} {:>7} {:>7} {:>8}  {}",
        "Symbol", "Outcome", "Inserted", "Chunks", "Empty", "Retries", "Cursor"
    );
    println!("{}", "-".repeat(80));
    for r in &summary.reports {
        let outcome = match &r.outcome {
            SymbolOutcome::UpToDate => "up-to-date",
            SymbolOutcome::Synced => "synced",
            SymbolOutcome::Failed { .. } => "FAILED",
            SymbolOutcome::Cancelled => "cancelled",
        };
        let cursor = r.cursor.map(|c| c.to_rfc3339()).unwrap_or_else(|| "-".into());
        println!(
            "{:<12} {:<11} {:>8} {:>7} {:>7} {:>8}  {}",
            r.symbol, outcome, r.rows_inserted, r.chunks, r.empty_chunks, r.retries, cursor
        );
    }
    println!();
    println!(
        "{} rows inserted in {:.1}s",
        summary.rows_inserted(),
        summary.elapsed_secs
    );
}

fn run_discover(config: &SyncConfig, since: Option<String>, all: bool) -> Result<()> {
    let path = &config.universe.path;
    let mut universe = Universe::from_file(path)?;
    let source = BinanceSource::new(&config.source)?;

    let mut options = DiscoveryOptions::default();
    if let Some(s) = since {
        options.since = NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .with_context(|| format!("invalid --since date '{s}'"))?;
    }

    let targets: Vec<String> = if all {
        universe.symbols().to_vec()
    } else {
        universe
            .missing_first_available()
            .into_iter()
            .map(String::from)
            .collect()
    };
    if targets.is_empty() {
        println!("Every symbol already has a first-available date.");
        return Ok(());
    }

    let mut errors = Vec::new();
    for symbol in &targets {
        match find_first_available(&source, symbol, &options) {
            Ok(Some(first)) => {
                println!("{symbol}: {}", first.date_naive());
                universe.set_first_available(symbol, first)?;
                universe.save(path)?;
            }
            Ok(None) => println!("{symbol}: no data between {} and {}", options.since, options.until),
            Err(e) => errors.push((symbol.clone(), e)),
        }
    }

    if !errors.is_empty() {
        for (sym, err) in &errors {
            eprintln!("Error for {sym}: {err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn run_query(
    config: &SyncConfig,
    symbol: &str,
    start: &str,
    end: &str,
    target: Option<Interval>,
    csv_path: Option<PathBuf>,
) -> Result<()> {
    let quote = Universe::from_file(&config.universe.path)
        .map(|u| u.quote().to_string())
        .unwrap_or_else(|_| barsync_core::domain::DEFAULT_QUOTE.to_string());
    let symbol = canonical_symbol(symbol, &quote)?;
    let (start, end) = (parse_utc(start)?, parse_utc(end)?);

    let store = ParquetStore::new(&config.store.dir);
    let mut candles = store.query(&symbol, start, end)?;
    if let Some(target) = target {
        let base = config.source.interval;
        if target < base || target.minutes() % base.minutes() != 0 {
            bail!("cannot resample {base} bars into {target} bars");
        }
        candles = resample(&candles, target);
    }

    match csv_path {
        Some(path) => {
            write_csv(&path, &candles)?;
            println!("Wrote {} rows to {}", candles.len(), path.display());
        }
        None => print_candles(&symbol, &candles),
    }
    Ok(())
}

fn write_csv(path: &Path, candles: &[Candle]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for candle in candles {
        writer.serialize(candle)?;
    }
    writer.flush()?;
    Ok(())
}

fn print_candles(symbol: &str, candles: &[Candle]) {
    if candles.is_empty() {
        println!("No stored candles for {symbol} in range.");
        return;
    }
    println!(
        "{:<22} {:>14} {:>14} {:>14} {:>14} {:>16}",
        "Open time", "Open", "High", "Low", "Close", "Volume"
    );
    println!("{}", "-".repeat(99));
    for c in candles {
        println!(
            "{:<22} {:>14} {:>14} {:>14} {:>14} {:>16}",
            c.open_time.format("%Y-%m-%d %H:%M:%S"),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        );
    }
    println!();
    println!("{} rows", candles.len());
}

fn run_store_status(config: &SyncConfig, json: bool) -> Result<()> {
    let store_dir = &config.store.dir;
    if !store_dir.exists() {
        println!("Store directory does not exist: {}", store_dir.display());
        return Ok(());
    }

    let store = ParquetStore::new(store_dir);
    let symbols = store.list_symbols()?;
    if symbols.is_empty() {
        println!("Store is empty: {}", store_dir.display());
        return Ok(());
    }

    let checkpoints = ProgressTracker::new(&config.progress.path).load();
    let sym_refs: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();

    if json {
        for status in store.status(&sym_refs) {
            let mut value = serde_json::to_value(&status)?;
            value["checkpoint"] = serde_json::to_value(checkpoints.get(&status.symbol))?;
            println!("{value}");
        }
        return Ok(());
    }

    println!("Store: {}", store_dir.display());
    println!("Symbols: {}", symbols.len());
    println!();
    println!(
        "{:<12} {:<41} {:>10} {:>6}  {}",
        "Symbol", "Range", "Bars", "Days", "Checkpoint"
    );
    println!("{}", "-".repeat(96));
    for status in store.status(&sym_refs) {
        let range = match (status.first_time, status.last_time) {
            (Some(f), Some(l)) => format!(
                "{} to {}",
                f.format("%Y-%m-%d %H:%M"),
                l.format("%Y-%m-%d %H:%M")
            ),
            _ => "(no meta)".into(),
        };
        let bars = status
            .bar_count
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".into());
        let checkpoint = checkpoints
            .get(&status.symbol)
            .map(|c| c.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<12} {:<41} {:>10} {:>6}  {}",
            status.symbol, range, bars, status.partitions, checkpoint
        );
    }

    Ok(())
}

fn run_store_verify(config: &SyncConfig) -> Result<()> {
    let store = ParquetStore::new(&config.store.dir);
    let mut total = 0;
    for symbol in store.list_symbols()? {
        let quarantined = store
            .verify(&symbol)
            .with_context(|| format!("verifying {symbol}"))?;
        if quarantined > 0 {
            println!("{symbol}: quarantined {quarantined} partition(s)");
        }
        total += quarantined;
    }
    println!("Quarantined {total} partition(s)");
    Ok(())
}
