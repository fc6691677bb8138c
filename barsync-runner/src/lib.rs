//! BarSync Runner: the backfill synchronization engine.
//!
//! This crate builds on `barsync-core` to provide:
//! - Sync configuration (TOML, validated)
//! - The per-symbol state machine: resume, chunked fetch, upsert, checkpoint
//! - Passes over the universe, sequential or on a bounded thread pool
//! - Run-once and run-forever service loops

pub mod config;
pub mod engine;
pub mod pass;
pub mod service;

pub use config::{ConfigError, SyncConfig, MAX_ROWS_PER_CALL_LIMIT};
pub use engine::{
    resume_cursor, EngineSettings, PassHorizon, SymbolOutcome, SymbolReport, SyncEngine,
    SyncError,
};
pub use pass::{run_pass, PassOptions, PassSummary};
pub use service::{
    build_engine, load_descriptors, run_forever, run_once, ForeverSettings, ForeverSummary,
};
