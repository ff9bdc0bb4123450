//! Transaction runner
//!
//! Issues every item of a batch against one shared transaction and resolves
//! once the transaction itself reports completion. Item failures are
//! collected into the outcome; only a transaction-level abort is an error.

use futures_util::future::join_all;
use tokio::sync::oneshot;

use idbkit_engine::{
    EngineDatabase, EngineError, Key, Operation, Record, RequestEvent, RequestOutput,
    TransactionEvent, TransactionMode,
};

use crate::error::StoreError;
use crate::Result;

/// Operations against a single table, run as one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub table: String,
    pub operations: Vec<Operation>,
}

impl BatchRequest {
    pub fn new(table: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            table: table.into(),
            operations,
        }
    }

    pub fn put(table: impl Into<String>, records: Vec<Record>) -> Self {
        Self::new(table, records.into_iter().map(Operation::Put).collect())
    }

    pub fn add(table: impl Into<String>, records: Vec<Record>) -> Self {
        Self::new(table, records.into_iter().map(Operation::Add).collect())
    }

    pub fn get(table: impl Into<String>, key: Key) -> Self {
        Self::new(table, vec![Operation::Get(key)])
    }

    pub fn get_all(table: impl Into<String>) -> Self {
        Self::new(table, vec![Operation::GetAll])
    }

    pub fn delete(table: impl Into<String>, keys: Vec<Key>) -> Self {
        Self::new(table, keys.into_iter().map(Operation::Delete).collect())
    }

    pub fn clear(table: impl Into<String>) -> Self {
        Self::new(table, vec![Operation::Clear])
    }

    pub fn mode(&self) -> TransactionMode {
        if self.operations.iter().any(Operation::is_write) {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadOnly
        }
    }
}

/// An item that failed on its own inside a completed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    /// Position of the item in the batch
    pub index: usize,
    pub operation: Operation,
    pub error: EngineError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Set once the transaction reported completion
    pub completed: bool,
    /// One slot per item; `None` where the item failed
    pub outputs: Vec<Option<RequestOutput>>,
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    /// Outcome of a batch with nothing to run
    pub fn empty() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.completed && self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outputs.iter().filter(|output| output.is_some()).count()
    }

    /// Keys of the records a put/add batch stored
    pub fn written_keys(&self) -> Vec<Key> {
        self.outputs
            .iter()
            .filter_map(|output| match output {
                Some(RequestOutput::Key(key)) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            completed: self.completed,
            succeeded: self.succeeded(),
            failed: self.failures.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: bool,
    pub succeeded: usize,
    pub failed: usize,
}

/// Resolve one request's success or error event.
pub async fn settle(events: oneshot::Receiver<RequestEvent>) -> RequestEvent {
    events
        .await
        .unwrap_or_else(|_| Err(EngineError::Aborted("request ended without an event".to_string())))
}

pub async fn run_batch(database: &dyn EngineDatabase, request: BatchRequest) -> Result<BatchOutcome> {
    let mode = request.mode();
    let BatchRequest { table, operations } = request;

    if operations.is_empty() {
        return Ok(BatchOutcome::empty());
    }

    let mut transaction = database
        .transaction(&[table.as_str()], mode)
        .map_err(|source| StoreError::Transaction {
            table: table.clone(),
            source,
        })?;

    let pending: Vec<_> = operations
        .into_iter()
        .map(|operation| {
            let events = transaction.issue(&table, operation.clone());
            (operation, events)
        })
        .collect();
    let completion = transaction.commit();

    let settled = join_all(
        pending
            .into_iter()
            .map(|(operation, events)| async move { (operation, settle(events).await) }),
    )
    .await;

    let mut outcome = BatchOutcome::default();
    for (index, (operation, event)) in settled.into_iter().enumerate() {
        match event {
            Ok(output) => outcome.outputs.push(Some(output)),
            Err(error) => {
                tracing::warn!(
                    table = %table,
                    index,
                    operation = operation.as_str(),
                    error = %error,
                    "Batch item failed"
                );
                outcome.outputs.push(None);
                outcome.failures.push(ItemFailure {
                    index,
                    operation,
                    error,
                });
            }
        }
    }

    match completion.await {
        Ok(TransactionEvent::Complete) => {
            outcome.completed = true;
            if !outcome.failures.is_empty() {
                tracing::warn!(
                    table = %table,
                    failed = outcome.failures.len(),
                    total = outcome.outputs.len(),
                    "Batch completed with failed items"
                );
            }
            Ok(outcome)
        }
        Ok(TransactionEvent::Abort(source)) => Err(StoreError::Transaction { table, source }),
        Err(_) => Err(StoreError::Transaction {
            table,
            source: EngineError::Aborted("transaction ended without a completion event".to_string()),
        }),
    }
}
