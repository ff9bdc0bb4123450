//! idbkit SQLite Engine
//!
//! Keeps every versioned database of an engine in a single SQLite file.
//! Each engine transaction commits as one SQLite transaction.

mod database;
mod engine;
mod error;
mod migrations;

pub use database::Database;
pub use engine::SqliteEngine;
pub use error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;
