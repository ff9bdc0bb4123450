//! idbkit Core
//!
//! Promise-style facade over a versioned key-value engine. Writing to an
//! unknown table creates it (bumping the database version); batches of
//! reads, writes and deletes run as one transaction each.

mod config;
mod connection;
mod error;
mod facade;
pub mod migrator;
pub mod runner;

pub use config::{connect_with_config, Config, EngineConfig};
pub use connection::{ConnectionHandle, ConnectionState};
pub use error::StoreError;
pub use facade::{
    connect, is_supported, ClearRequest, GetRequest, GetResult, Model, PassType, ReturnType,
    SetRequest,
};
pub use runner::{BatchOutcome, BatchRequest, BatchSummary, ItemFailure};

// Re-export engine types callers need
pub use idbkit_engine::{
    EngineError, Faults, IndexSchema, Key, MemoryEngine, Operation, Record, StorageEngine,
    TableSchema,
};
pub use idbkit_sqlite::SqliteEngine;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Install the global tracing subscriber. `IDBKIT_LOG` wins over `RUST_LOG`;
/// calling it twice is a no-op.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("IDBKIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn,idbkit_core=info,idbkit_sqlite=info"));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
