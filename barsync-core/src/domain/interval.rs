//! Bar interval: the fixed-width kline intervals the API serves.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed-width bar interval.
///
/// Calendar intervals (`1w`, `1M`) are not supported: they are not a fixed
/// number of milliseconds and cannot be chunked by bar count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Interval {
    pub const ALL: [Interval; 12] = [
        Interval::OneMinute,
        Interval::ThreeMinutes,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::TwoHours,
        Interval::FourHours,
        Interval::SixHours,
        Interval::EightHours,
        Interval::TwelveHours,
        Interval::OneDay,
    ];

    /// Code used in the `interval` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::EightHours => "8h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Interval::OneMinute => 1,
            Interval::ThreeMinutes => 3,
            Interval::FiveMinutes => 5,
            Interval::FifteenMinutes => 15,
            Interval::ThirtyMinutes => 30,
            Interval::OneHour => 60,
            Interval::TwoHours => 120,
            Interval::FourHours => 240,
            Interval::SixHours => 360,
            Interval::EightHours => 480,
            Interval::TwelveHours => 720,
            Interval::OneDay => 1440,
        }
    }

    /// Width of one bar.
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Floor a timestamp to the start of the bar that contains it.
    ///
    /// Bars are aligned to the Unix epoch, which is how the exchange aligns
    /// every fixed-width interval including `1d` (00:00 UTC).
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width_ms = self.minutes() * 60_000;
        let ms = ts.timestamp_millis();
        let floored = ms - ms.rem_euclid(width_ms);
        DateTime::from_timestamp_millis(floored).unwrap_or(ts)
    }

    /// Whether `ts` falls exactly on a bar boundary.
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        self.truncate(ts) == ts
    }

    /// Number of whole bars in `[start, end)`.
    pub fn bars_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        if end <= start {
            return 0;
        }
        (end - start).num_minutes() / self.minutes()
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::OneMinute
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s.trim())
            .ok_or_else(|| {
                let valid: Vec<&str> = Interval::ALL.iter().map(|i| i.as_str()).collect();
                format!("unknown interval '{s}'. Valid: {}", valid.join(", "))
            })
    }
}
