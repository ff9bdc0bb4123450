//! Core error types

use idbkit_engine::EngineError;
use thiserror::Error;

use crate::connection::ConnectionState;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage engine is not supported in this environment")]
    UnsupportedEnvironment,

    #[error("Failed to open database '{name}': {source}")]
    Connection { name: String, source: EngineError },

    #[error("Failed to create table '{table}': {source}")]
    Schema { table: String, source: EngineError },

    #[error("Transaction on '{table}' failed: {source}")]
    Transaction { table: String, source: EngineError },

    #[error("Request on '{table}' failed: {source}")]
    Request { table: String, source: EngineError },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Connection is {0}")]
    InvalidState(ConnectionState),

    #[error("Storage error: {0}")]
    Storage(#[from] idbkit_sqlite::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
