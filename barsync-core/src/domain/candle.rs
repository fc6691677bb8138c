//! Candle: one fixed-width OHLCV bar for one symbol.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OHLCV candle for a single symbol and a single interval slot.
///
/// Prices and volume are exact decimals; the remote API encodes them as text
/// and they are never routed through binary floating point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Basic OHLCV sanity check.
    pub fn validate(&self) -> Result<(), CandleError> {
        if self.high < self.open.max(self.close) {
            return Err(CandleError::HighBelowBody {
                open_time: self.open_time,
            });
        }
        if self.low > self.open.min(self.close) {
            return Err(CandleError::LowAboveBody {
                open_time: self.open_time,
            });
        }
        if self.volume < Decimal::ZERO {
            return Err(CandleError::NegativeVolume {
                open_time: self.open_time,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CandleError {
    #[error("high below max(open, close) at {open_time}")]
    HighBelowBody { open_time: DateTime<Utc> },

    #[error("low above min(open, close) at {open_time}")]
    LowAboveBody { open_time: DateTime<Utc> },

    #[error("negative volume at {open_time}")]
    NegativeVolume { open_time: DateTime<Utc> },
}
