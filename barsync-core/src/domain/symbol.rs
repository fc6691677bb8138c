//! Symbols: canonical identifiers and per-symbol descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quote asset appended to base symbols when none is configured.
pub const DEFAULT_QUOTE: &str = "USDT";

/// A symbol in the universe plus what is known about its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDescriptor {
    /// Canonical symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Earliest UTC instant the API is known to serve bars for this symbol.
    pub first_available: Option<DateTime<Utc>>,
}

impl SymbolDescriptor {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            first_available: None,
        }
    }

    pub fn with_first_available(mut self, first: DateTime<Utc>) -> Self {
        self.first_available = Some(first);
        self
    }
}

/// Configuration or universe content that cannot be used. Never retried.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid symbol '{0}': only ASCII letters and digits are allowed")]
    InvalidSymbol(String),

    #[error("empty symbol in universe")]
    EmptySymbol,

    #[error("invalid quote asset '{0}'")]
    InvalidQuote(String),

    #[error("universe lists no symbols")]
    EmptyUniverse,

    #[error("duplicate symbol '{0}' in universe")]
    DuplicateSymbol(String),

    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("cannot read universe: {0}")]
    Unreadable(String),

    #[error("cannot parse universe: {0}")]
    Unparseable(String),

    #[error("cannot write universe: {0}")]
    Unwritable(String),
}

/// Canonicalize a base or full symbol: trim, uppercase, append `quote` unless
/// the symbol already ends with it.
///
/// `"btc"` → `"BTCUSDT"`, `"ethusdt"` → `"ETHUSDT"`.
pub fn canonical_symbol(raw: &str, quote: &str) -> Result<String, ValidationError> {
    let quote = quote.trim().to_ascii_uppercase();
    if quote.is_empty() || !quote.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidQuote(quote));
    }

    let base = raw.trim().to_ascii_uppercase();
    if base.is_empty() {
        return Err(ValidationError::EmptySymbol);
    }
    if !base.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidSymbol(raw.to_string()));
    }

    if base.ends_with(&quote) && base.len() > quote.len() {
        Ok(base)
    } else {
        Ok(format!("{base}{quote}"))
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_utc(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|e| ValidationError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
        .and_then(|d| {
            d.and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
                .ok_or_else(|| ValidationError::InvalidTimestamp {
                    value: value.to_string(),
                    reason: "not a valid midnight".into(),
                })
        })
}
