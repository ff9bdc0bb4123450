//! Engine error types
//!
//! Variants follow the failure kinds a browser key-value engine reports.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Storage engine is not supported in this environment")]
    Unsupported,

    #[error("Open rejected: {0}")]
    Rejected(String),

    #[error("Requested version {requested} is lower than stored version {current}")]
    Version { requested: u32, current: u32 },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid data: {0}")]
    Data(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Write issued in a read-only transaction on '{0}'")]
    ReadOnly(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
