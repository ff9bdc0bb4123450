//! Single-shot engine events
//!
//! Every open attempt, request and transaction reports its result exactly
//! once. The receiving halves are what callers turn into futures.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::engine::EngineDatabase;
use crate::error::EngineError;
use crate::key::{Key, Record};
use crate::upgrade::VersionChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl TransactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
        }
    }
}

/// One request issued against a table inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert or overwrite
    Put(Record),
    /// Insert only; fails if the key is taken
    Add(Record),
    Get(Key),
    GetAll,
    Delete(Key),
    Clear,
}

impl Operation {
    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Get(_) | Operation::GetAll)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put(_) => "put",
            Operation::Add(_) => "add",
            Operation::Get(_) => "get",
            Operation::GetAll => "getAll",
            Operation::Delete(_) => "delete",
            Operation::Clear => "clear",
        }
    }
}

/// Payload of a request's success event.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutput {
    /// Key the record was stored under
    Key(Key),
    Record(Option<Record>),
    /// Every record of a table in key order
    Records(Vec<(Key, Record)>),
    Done,
}

/// Success or error event of one request.
pub type RequestEvent = std::result::Result<RequestOutput, EngineError>;

/// Terminal event of a transaction, fired after all its requests settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    Complete,
    Abort(EngineError),
}

/// Events fired by an open attempt. An upgrade fires `UpgradeNeeded`
/// and, once the version change commits, `Success`.
pub enum OpenEvent {
    Success(Arc<dyn EngineDatabase>),
    UpgradeNeeded(VersionChange),
    Error(EngineError),
}

impl std::fmt::Debug for OpenEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenEvent::Success(db) => f
                .debug_struct("Success")
                .field("name", &db.name())
                .field("version", &db.version())
                .finish(),
            OpenEvent::UpgradeNeeded(change) => f
                .debug_struct("UpgradeNeeded")
                .field("old_version", &change.old_version())
                .field("new_version", &change.new_version())
                .finish(),
            OpenEvent::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// Receiving end of an open attempt.
pub struct OpenRequest {
    events: mpsc::UnboundedReceiver<OpenEvent>,
}

impl OpenRequest {
    pub fn channel() -> (mpsc::UnboundedSender<OpenEvent>, OpenRequest) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, OpenRequest { events: rx })
    }

    /// Wait for the next event. `None` once every sender is gone.
    pub async fn next_event(&mut self) -> Option<OpenEvent> {
        self.events.recv().await
    }
}
