//! Storage error types

use idbkit_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt storage: {0}")]
    Corrupt(String),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Backend(err.to_string())
    }
}

pub(crate) fn backend(err: impl Into<StorageError>) -> EngineError {
    let err: StorageError = err.into();
    err.into()
}
