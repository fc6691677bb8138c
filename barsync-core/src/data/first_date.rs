//! First-available date discovery.
//!
//! Binary search over UTC days for the earliest day on which the source has
//! at least one bar for a symbol. Each probe asks for the single `1d` bar of
//! the probed day, so a search over ten years costs about a dozen requests.
//!
//! Assumes the symbol trades continuously once listed: a day with data implies
//! every later day has data too.

use super::provider::{CandleSource, FetchError};
use crate::domain::Interval;
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Earliest day the search considers when none is given.
pub fn default_search_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2017, 1, 1).unwrap_or_default()
}

/// Bounds and pacing for one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// First day probed (inclusive).
    pub since: NaiveDate,
    /// Last day probed (inclusive).
    pub until: NaiveDate,
    /// Pause between probes.
    pub pause: std::time::Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            since: default_search_start(),
            until: Utc::now().date_naive(),
            pause: std::time::Duration::from_millis(100),
        }
    }
}

/// Whether the source has any bar for `symbol` on `day`.
fn has_data_on(source: &dyn CandleSource, symbol: &str, day: NaiveDate) -> Result<bool, FetchError> {
    let start = day_start(day);
    let bars = source.fetch(symbol, Interval::OneDay, start, start + Duration::days(1))?;
    Ok(!bars.is_empty())
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// Find midnight UTC of the first day in `[since, until]` with data.
///
/// Returns `None` when even `until` has no data (unknown or delisted symbol).
/// Fetch errors abort the search; the caller decides whether to retry.
pub fn find_first_available(
    source: &dyn CandleSource,
    symbol: &str,
    options: &DiscoveryOptions,
) -> Result<Option<DateTime<Utc>>, FetchError> {
    if options.until < options.since {
        return Ok(None);
    }

    let mut low = 0i64;
    let mut high = (options.until - options.since).num_days();
    let mut probes = 0u32;

    if !has_data_on(source, symbol, options.until)? {
        tracing::info!(symbol, until = %options.until, "no data on the last probed day");
        return Ok(None);
    }

    while low < high {
        let mid = low + (high - low) / 2;
        let day = options.since + Duration::days(mid);
        tracing::debug!(symbol, %day, "probing");

        if has_data_on(source, symbol, day)? {
            high = mid;
        } else {
            low = mid + 1;
        }
        probes += 1;

        if !options.pause.is_zero() {
            std::thread::sleep(options.pause);
        }
    }

    let first = options.since + Duration::days(low);
    tracing::info!(symbol, first_day = %first, probes, "first available day found");
    Ok(Some(day_start(first)))
}
