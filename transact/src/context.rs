//! [`TxnContext`]

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::record::Record;
use crate::TxnId;

#[derive(Default)]
struct Binding {
    record: Option<Arc<Record>>,
    timeout: Option<Duration>,
}

/// A calling context, such as a request handler or a worker task, to which at most one
/// transaction at a time can be bound.
///
/// Clones share the same binding, so passing a clone to a nested operation lets that
/// operation join the caller's transaction.
#[derive(Clone, Default)]
pub struct TxnContext {
    binding: Arc<Mutex<Binding>>,
}

impl TxnContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The [`TxnId`] of the live transaction bound to this context, if any.
    pub fn txn_id(&self) -> Option<TxnId> {
        self.live().map(|record| *record.id())
    }

    /// The [`TxnId`] of the transaction bound to this context, including one which has
    /// completed without the binding being released, e.g. one rolled back after a timeout.
    pub fn bound_id(&self) -> Option<TxnId> {
        self.bound().map(|record| *record.id())
    }

    /// Return `true` if a live transaction is bound to this context.
    pub fn is_bound(&self) -> bool {
        self.live().is_some()
    }

    /// The transaction bound to this context, which may already have been completed
    /// by the timeout supervisor.
    pub(crate) fn bound(&self) -> Option<Arc<Record>> {
        let binding = self.binding.lock().expect("transaction context");
        binding.record.clone()
    }

    pub(crate) fn live(&self) -> Option<Arc<Record>> {
        self.bound().filter(|record| record.is_live())
    }

    /// Bind `record` to this context, unless a live transaction is already bound.
    pub(crate) fn bind(&self, record: Arc<Record>) -> Result<(), TxnId> {
        let mut binding = self.binding.lock().expect("transaction context");

        match &binding.record {
            Some(bound) if bound.is_live() => Err(*bound.id()),
            _ => {
                binding.record = Some(record);
                Ok(())
            }
        }
    }

    /// Clear this context's binding if it's bound to the transaction `txn_id`.
    pub(crate) fn release(&self, txn_id: &TxnId) {
        let mut binding = self.binding.lock().expect("transaction context");

        if binding
            .record
            .as_ref()
            .map_or(false, |record| record.id() == txn_id)
        {
            binding.record = None;
        }
    }

    /// Detach and return the live transaction bound to this context, if any.
    pub(crate) fn take(&self) -> Option<Arc<Record>> {
        let mut binding = self.binding.lock().expect("transaction context");
        binding.record.take().filter(|record| record.is_live())
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.binding.lock().expect("transaction context").timeout
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
        self.binding.lock().expect("transaction context").timeout = timeout;
    }
}

impl fmt::Debug for TxnContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.bound() {
            Some(record) => write!(f, "context bound to {:?}", record),
            None => f.write_str("unbound context"),
        }
    }
}
