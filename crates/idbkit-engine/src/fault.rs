//! Fault switches
//!
//! Lets callers drive an engine into its failure paths: an unsupported
//! environment, a rejected open, aborted transactions and failing index
//! creation during a version change.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct Faults {
    unsupported: AtomicBool,
    reject_open: AtomicBool,
    abort_transactions: AtomicBool,
    fail_index_creation: AtomicBool,
}

impl Faults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unsupported(&self, on: bool) {
        self.unsupported.store(on, Ordering::SeqCst);
    }

    pub fn set_reject_open(&self, on: bool) {
        self.reject_open.store(on, Ordering::SeqCst);
    }

    pub fn set_abort_transactions(&self, on: bool) {
        self.abort_transactions.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_index_creation(&self, on: bool) {
        self.fail_index_creation.store(on, Ordering::SeqCst);
    }

    pub fn unsupported(&self) -> bool {
        self.unsupported.load(Ordering::SeqCst)
    }

    pub fn reject_open(&self) -> bool {
        self.reject_open.load(Ordering::SeqCst)
    }

    pub fn abort_transactions(&self) -> bool {
        self.abort_transactions.load(Ordering::SeqCst)
    }

    pub fn fail_index_creation(&self) -> bool {
        self.fail_index_creation.load(Ordering::SeqCst)
    }
}
