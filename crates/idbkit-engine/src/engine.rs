//! Engine traits

use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::events::{OpenRequest, Operation, RequestEvent, TransactionEvent, TransactionMode};
use crate::schema::TableSchema;
use crate::Result;

/// A provider of named, versioned databases.
pub trait StorageEngine: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Start opening `name`. `None` opens the stored version, or version 1
    /// when the database does not exist yet.
    fn open(&self, name: &str, version: Option<u32>) -> OpenRequest;
}

/// One open connection. Its schema is fixed for the connection's lifetime;
/// only a version change produces a connection with different tables.
pub trait EngineDatabase: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> u32;
    fn table_names(&self) -> Vec<String>;
    fn schema(&self, table: &str) -> Option<TableSchema>;

    fn transaction(
        &self,
        tables: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn EngineTransaction>>;

    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A shared transaction scope.
///
/// Requests settle no earlier than `commit`. The completion event fires
/// only after every issued request has fired its own event.
pub trait EngineTransaction: Send {
    fn issue(&mut self, table: &str, operation: Operation) -> oneshot::Receiver<RequestEvent>;

    /// Run everything issued so far and report completion.
    ///
    /// Blocking: the built-in engines execute the whole batch on the
    /// calling thread before returning, so every receiver is already
    /// settled when this returns. Callers on a busy runtime should move
    /// large batches to `tokio::task::spawn_blocking`.
    fn commit(self: Box<Self>) -> oneshot::Receiver<TransactionEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPlan {
    Open(u32),
    Upgrade { from: u32, to: u32 },
}

/// Decide what an open attempt does given the stored version (0 when the
/// database does not exist).
pub fn plan_open(current: u32, requested: Option<u32>) -> Result<OpenPlan> {
    let target = match requested {
        Some(0) => return Err(EngineError::Data("version must be at least 1".to_string())),
        Some(version) => version,
        None => current.max(1),
    };

    if target < current {
        Err(EngineError::Version {
            requested: target,
            current,
        })
    } else if target == current {
        Ok(OpenPlan::Open(target))
    } else {
        Ok(OpenPlan::Upgrade {
            from: current,
            to: target,
        })
    }
}
