//! idbkit Storage Engine
//!
//! Event-driven contract for a versioned, on-device key-value engine.
//! Opening a database, issuing a request and finishing a transaction each
//! fire single-shot events over `tokio::sync` channels.

mod engine;
mod error;
mod events;
pub mod exec;
mod fault;
mod key;
mod memory;
mod queue;
mod schema;
mod upgrade;

pub use engine::{plan_open, EngineDatabase, EngineTransaction, OpenPlan, StorageEngine};
pub use error::EngineError;
pub use events::{
    OpenEvent, OpenRequest, Operation, RequestEvent, RequestOutput, TransactionEvent,
    TransactionMode,
};
pub use fault::Faults;
pub use key::{Key, Record};
pub use memory::MemoryEngine;
pub use queue::{BatchExecutor, QueuedTransaction};
pub use schema::{IndexSchema, TableSchema};
pub use upgrade::{UpgradeTarget, VersionChange};

pub type Result<T> = std::result::Result<T, EngineError>;
