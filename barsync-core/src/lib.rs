//! BarSync Core: candle types, candle sources, stores and checkpoints.
//!
//! This crate contains everything the synchronization engine talks to:
//! - Domain types (candles, intervals, canonical symbols)
//! - The `CandleSource` trait and the Binance klines client
//! - The `CandleStore` trait with Parquet and in-memory stores
//! - The progress tracker (durable per-symbol resume cursors)
//! - The symbol universe, first-date discovery and resampling

pub mod data;
pub mod domain;
