//! Provides a single-process two-phase commit coordinator.
//!
//! A [`Coordinator`] begins transactions on behalf of a [`TxnContext`], enlists [`Resource`]s
//! in them, and drives each one to a terminal [`Status`]. Every transaction has a deadline;
//! a background supervisor rolls back any transaction which has not been prepared in time.

use async_trait::async_trait;

use tc_txn_error::*;

mod context;
mod coordinator;
mod id;
mod record;
mod status;
mod supervisor;

pub mod journal;

pub use context::TxnContext;
pub use coordinator::{Builder, Coordinator, DEFAULT_SWEEP_INTERVAL, DEFAULT_TIMEOUT};
pub use id::TxnId;
pub use journal::{FileLog, MemoryLog, TxnLog};
pub use record::TxnHandle;
pub use status::{Outcome, Status, Vote};

/// A resource manager which can be enlisted in a transaction.
///
/// Implementations must tolerate `commit` and `rollback` being called more than once for the
/// same transaction, and `rollback` arriving while `prepare` is still in progress.
#[async_trait]
pub trait Resource: Send + Sync {
    /// The name of this resource, for logging.
    fn name(&self) -> &str;

    /// Phase one: validate the work staged at `txn_id` and vote on whether it can be committed.
    async fn prepare(&self, txn_id: &TxnId) -> TCResult<Vote>;

    /// Phase two: make the work staged at `txn_id` durable and visible.
    async fn commit(&self, txn_id: &TxnId) -> TCResult<()>;

    /// Discard any work staged at `txn_id`.
    async fn rollback(&self, txn_id: &TxnId) -> TCResult<()>;
}
