//! Data layer: candle sources, stores, checkpoints and the symbol universe.

pub mod binance;
pub mod first_date;
pub mod memory_store;
pub mod parquet_store;
pub mod progress;
pub mod provider;
pub mod resample;
pub mod schema;
pub mod store;
pub mod universe;

pub use binance::{parse_klines, BinanceSource, SourceSettings, DEFAULT_KLINES_URL};
pub use first_date::{find_first_available, DiscoveryOptions};
pub use memory_store::MemoryStore;
pub use parquet_store::{ParquetStore, StoreMeta, TableStatus};
pub use progress::{ProgressError, ProgressMap, ProgressTracker};
pub use provider::{CandleSource, FetchError, DEFAULT_MAX_ROWS_PER_CALL};
pub use resample::resample;
pub use schema::{CandleSchema, SchemaError};
pub use store::{CandleStore, StoreError};
pub use universe::Universe;
