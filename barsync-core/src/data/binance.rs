//! Binance klines candle source.
//!
//! Issues one `GET /api/v3/klines` per call and maps the positional row
//! format `[openTimeMs, "open", "high", "low", "close", "volume", ...]` into
//! candles. Only the first six fields of a row are read.
//!
//! The source never retries: retry policy and backoff belong to the
//! synchronization engine, which interleaves them with checkpointing.

use super::provider::{CandleSource, FetchError, DEFAULT_MAX_ROWS_PER_CALL};
use crate::domain::{Candle, Interval};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_KLINES_URL: &str = "https://api.binance.com/api/v3/klines";

/// Settings for the klines source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub base_url: String,
    pub interval: Interval,
    pub max_rows_per_call: usize,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_KLINES_URL.to_string(),
            interval: Interval::OneMinute,
            max_rows_per_call: DEFAULT_MAX_ROWS_PER_CALL,
            timeout_secs: 10,
            user_agent: concat!("barsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Binance klines source.
pub struct BinanceSource {
    client: reqwest::blocking::Client,
    base_url: String,
    max_rows_per_call: usize,
    timeout: Duration,
}

impl BinanceSource {
    pub fn new(settings: &SourceSettings) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            max_rows_per_call: settings.max_rows_per_call,
            timeout,
        })
    }

    /// Query parameters for a half-open `[start, end)` request.
    ///
    /// `endTime` is inclusive on the API side, so it is sent as `end - 1ms`.
    fn query_params(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("startTime", start.timestamp_millis().to_string()),
            ("endTime", (end.timestamp_millis() - 1).to_string()),
            ("limit", self.max_rows_per_call.to_string()),
        ]
    }

    fn map_request_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

impl CandleSource for BinanceSource {
    fn name(&self) -> &str {
        "binance_klines"
    }

    fn max_rows_per_call(&self) -> usize {
        self.max_rows_per_call
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        let params = self.query_params(symbol, interval, start, end);
        let resp = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .map_err(|e| self.map_request_error(e))?;

        let status = resp.status();

        // 429 = over the request weight, 418 = IP auto-banned after ignoring 429s
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(FetchError::RateLimited {
                status: status.as_u16(),
                retry_after_secs,
            });
        }

        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let body = resp.text().map_err(|e| self.map_request_error(e))?;
        parse_klines(symbol, &body, start, end)
    }
}

/// Parse a klines response body into candles within `[start, end)`.
pub fn parse_klines(
    symbol: &str,
    body: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Candle>, FetchError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)
        .map_err(|e| FetchError::Payload(format!("expected an array of rows: {e}")))?;

    let mut candles = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.len() < 6 {
            return Err(FetchError::Payload(format!(
                "row {i} has {} fields, expected at least 6",
                row.len()
            )));
        }

        let open_ms = row[0]
            .as_i64()
            .ok_or_else(|| FetchError::Payload(format!("row {i}: open time is not an integer")))?;
        let open_time = DateTime::from_timestamp_millis(open_ms)
            .ok_or_else(|| FetchError::Payload(format!("row {i}: invalid open time {open_ms}")))?;

        if open_time < start || open_time >= end {
            continue;
        }

        candles.push(Candle {
            symbol: symbol.to_string(),
            open_time,
            open: decimal_field(&row[1], i, "open")?,
            high: decimal_field(&row[2], i, "high")?,
            low: decimal_field(&row[3], i, "low")?,
            close: decimal_field(&row[4], i, "close")?,
            volume: decimal_field(&row[5], i, "volume")?,
        });
    }

    candles.sort_by_key(|c| c.open_time);
    candles.dedup_by_key(|c| c.open_time);
    Ok(candles)
}

/// Prices arrive as decimal strings; plain JSON numbers are accepted too.
fn decimal_field(value: &Value, row: usize, name: &str) -> Result<Decimal, FetchError> {
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    };
    parsed.ok_or_else(|| FetchError::Payload(format!("row {row}: {name} is not a decimal: {value}")))
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut cut = MAX;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &body[..cut])
}
