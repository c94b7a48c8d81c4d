use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::trace;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;

use tc_txn_error::*;

use crate::{Outcome, Resource, Status, TxnId};

/// The mutable state of a transaction, guarded by its [`Record`]'s lock.
pub(crate) struct State {
    pub(crate) status: Status,
    pub(crate) deadline: Instant,
    pub(crate) resources: Vec<Arc<dyn Resource>>,
    pub(crate) rollback_only: bool,
    pub(crate) anomalies: Vec<String>,
    history: Vec<Status>,
}

/// The coordinator's record of a single transaction.
pub(crate) struct Record {
    id: TxnId,
    state: Mutex<State>,
    status: watch::Sender<Status>,
    outcome: OnceLock<Outcome>,
    attached: AtomicBool,
}

impl Record {
    /// Construct a new `Record`, attached to the context which began it.
    pub fn new(id: TxnId, deadline: Instant) -> Self {
        let (status, _) = watch::channel(Status::Active);

        Self {
            id,
            state: Mutex::new(State {
                status: Status::Active,
                deadline,
                resources: vec![],
                rollback_only: false,
                anomalies: vec![],
                history: vec![Status::Active],
            }),
            status,
            outcome: OnceLock::new(),
            attached: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &TxnId {
        &self.id
    }

    /// The current status of this transaction, without waiting for its lock.
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.get().copied()
    }

    pub fn is_live(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Mark this transaction as bound to a context.
    /// Returns `false` if it's already bound to one.
    pub fn attach(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub async fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().await
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Move this transaction to the `next` status, if that's a legal transition.
    pub fn transition(&self, state: &mut State, next: Status) -> TCResult<()> {
        if state.status.can_transition(next) {
            trace!("transaction {}: {} -> {}", self.id, state.status, next);

            state.status = next;
            state.history.push(next);
            self.status.send_replace(next);
            Ok(())
        } else {
            Err(TCError::illegal_state(
                format!("transaction {} cannot move to {}", self.id, next),
                state.status,
            ))
        }
    }

    /// Record the final `outcome` of this transaction and move it to a terminal `status`.
    pub fn complete(&self, state: &mut State, status: Status, outcome: Outcome) -> TCResult<()> {
        debug_assert!(status.is_terminal());

        if self.outcome.set(outcome).is_err() {
            return Err(TCError::internal(format!(
                "transaction {} already has an outcome",
                self.id
            )));
        }

        state.resources.clear();
        self.transition(state, status)
    }

    /// Wait until this transaction reaches a terminal status.
    pub async fn wait(&self) -> Status {
        let mut status = self.subscribe();
        let result = status.wait_for(Status::is_terminal).await.map(|status| *status);
        result.unwrap_or_else(|_| self.status())
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "transaction {} ({})", self.id, self.status())
    }
}

/// A handle to a transaction returned by [`crate::Coordinator::begin`].
#[derive(Clone)]
pub struct TxnHandle {
    record: Arc<Record>,
}

impl TxnHandle {
    pub(crate) fn new(record: Arc<Record>) -> Self {
        Self { record }
    }

    pub(crate) fn record(&self) -> &Arc<Record> {
        &self.record
    }

    /// The [`TxnId`] of this transaction.
    pub fn id(&self) -> &TxnId {
        self.record.id()
    }

    /// The current [`Status`] of this transaction.
    pub fn status(&self) -> Status {
        self.record.status()
    }

    /// The [`Outcome`] of this transaction, if it has completed.
    pub fn outcome(&self) -> Option<Outcome> {
        self.record.outcome()
    }

    /// The time at which this transaction will be rolled back if not yet prepared.
    pub async fn deadline(&self) -> Instant {
        self.record.lock().await.deadline
    }

    /// Failures reported by enlisted resources during the commit or rollback sweep.
    pub async fn anomalies(&self) -> Vec<String> {
        self.record.lock().await.anomalies.clone()
    }

    /// Every status this transaction has held, in order.
    pub async fn history(&self) -> Vec<Status> {
        self.record.lock().await.history.clone()
    }

    /// Wait for this transaction to reach a terminal [`Status`].
    pub async fn wait(&self) -> Status {
        self.record.wait().await
    }
}

impl fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&*self.record, f)
    }
}
