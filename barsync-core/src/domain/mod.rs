//! Domain types for BarSync

pub mod candle;
pub mod interval;
pub mod symbol;

pub use candle::{Candle, CandleError};
pub use interval::Interval;
pub use symbol::{canonical_symbol, parse_utc, SymbolDescriptor, ValidationError, DEFAULT_QUOTE};
