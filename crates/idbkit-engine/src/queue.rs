//! Deferred transaction
//!
//! Requests are queued as they are issued and run in one pass when the
//! transaction commits. Item events go out first, the completion event last.

use tokio::sync::oneshot;

use crate::engine::EngineTransaction;
use crate::error::EngineError;
use crate::events::{Operation, RequestEvent, TransactionEvent, TransactionMode};
use crate::Result;

/// Runs the queued requests of one transaction against a backend.
pub trait BatchExecutor: Send {
    /// One event per request, in order. An `Err` aborts the whole
    /// transaction and none of its writes may be visible.
    fn execute(
        self: Box<Self>,
        mode: TransactionMode,
        requests: Vec<(String, Operation)>,
    ) -> Result<Vec<RequestEvent>>;
}

pub struct QueuedTransaction {
    mode: TransactionMode,
    scope: Vec<String>,
    queued: Vec<(String, Operation, oneshot::Sender<RequestEvent>)>,
    rejected: Vec<(oneshot::Sender<RequestEvent>, EngineError)>,
    executor: Box<dyn BatchExecutor>,
}

impl QueuedTransaction {
    pub fn new(mode: TransactionMode, scope: &[&str], executor: Box<dyn BatchExecutor>) -> Self {
        Self {
            mode,
            scope: scope.iter().map(|t| t.to_string()).collect(),
            queued: Vec::new(),
            rejected: Vec::new(),
            executor,
        }
    }
}

impl EngineTransaction for QueuedTransaction {
    fn issue(&mut self, table: &str, operation: Operation) -> oneshot::Receiver<RequestEvent> {
        let (tx, rx) = oneshot::channel();

        if !self.scope.iter().any(|t| t == table) {
            self.rejected.push((
                tx,
                EngineError::NotFound(format!("table '{}' is outside the transaction scope", table)),
            ));
        } else if self.mode == TransactionMode::ReadOnly && operation.is_write() {
            self.rejected
                .push((tx, EngineError::ReadOnly(table.to_string())));
        } else {
            self.queued.push((table.to_string(), operation, tx));
        }

        rx
    }

    fn commit(self: Box<Self>) -> oneshot::Receiver<TransactionEvent> {
        let Self {
            mode,
            queued,
            rejected,
            executor,
            ..
        } = *self;
        let (done_tx, done_rx) = oneshot::channel();

        for (reply, err) in rejected {
            let _ = reply.send(Err(err));
        }

        let (requests, replies): (Vec<_>, Vec<_>) = queued
            .into_iter()
            .map(|(table, operation, reply)| ((table, operation), reply))
            .unzip();

        match executor.execute(mode, requests) {
            Ok(events) => {
                for (reply, event) in replies.into_iter().zip(events) {
                    let _ = reply.send(event);
                }
                let _ = done_tx.send(TransactionEvent::Complete);
            }
            Err(err) => {
                tracing::debug!(error = %err, mode = mode.as_str(), "Transaction aborted");
                for reply in replies {
                    let _ = reply.send(Err(EngineError::Aborted(err.to_string())));
                }
                let _ = done_tx.send(TransactionEvent::Abort(err));
            }
        }

        done_rx
    }
}
