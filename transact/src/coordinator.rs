//! The transaction [`Coordinator`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, trace, warn};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use tc_txn_error::*;

use crate::journal::{MemoryLog, TxnLog};
use crate::record::{Record, TxnHandle};
use crate::supervisor::Supervisor;
use crate::{Outcome, Resource, Status, TxnContext, TxnId, Vote};

/// The timeout of a transaction begun without one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the timeout supervisor checks for expired transactions.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Configures and constructs a [`Coordinator`].
pub struct Builder {
    default_timeout: Duration,
    sweep_interval: Duration,
    log: Option<Arc<dyn TxnLog>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            log: None,
        }
    }

    /// Set the timeout of transactions begun without one.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set how often the timeout supervisor checks for expired transactions.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Record prepare decisions and outcomes in the given [`TxnLog`]
    /// instead of an in-memory log.
    pub fn with_log(mut self, log: Arc<dyn TxnLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Construct the [`Coordinator`] and start its timeout supervisor.
    /// This must be called within a tokio runtime.
    pub fn build(self) -> Coordinator {
        let log = self.log.unwrap_or_else(|| Arc::new(MemoryLog::new()));

        let inner = Arc::new(Inner {
            default_timeout: self.default_timeout,
            live: RwLock::new(HashMap::new()),
            log,
            supervisor: Supervisor::new(),
        });

        spawn_supervisor_thread(Arc::downgrade(&inner), self.sweep_interval);

        Coordinator { inner }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    default_timeout: Duration,
    live: RwLock<HashMap<TxnId, Arc<Record>>>,
    log: Arc<dyn TxnLog>,
    supervisor: Supervisor,
}

/// Coordinates the two-phase commit of transactions bound to a [`TxnContext`].
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Construct a new `Coordinator` with the default configuration.
    /// This must be called within a tokio runtime.
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Construct a new, unbound [`TxnContext`].
    pub fn context(&self) -> TxnContext {
        TxnContext::new()
    }

    /// The number of transactions which have begun but not yet completed.
    pub fn live_count(&self) -> usize {
        self.inner.live.read().expect("live transactions").len()
    }

    /// Begin a new transaction and bind it to `context`.
    ///
    /// The transaction will be rolled back if it's not prepared within `timeout`, or else the
    /// timeout set on `context` with [`Self::set_transaction_timeout`], or else the default.
    pub fn begin(&self, context: &TxnContext, timeout: Option<Duration>) -> TCResult<TxnHandle> {
        let timeout = timeout
            .or_else(|| context.timeout())
            .unwrap_or(self.inner.default_timeout);

        let txn_id = TxnId::new();
        let deadline = Instant::now() + timeout;
        let record = Arc::new(Record::new(txn_id, deadline));

        context
            .bind(record.clone())
            .map_err(TCError::already_active)?;

        debug!("begin transaction {} with timeout {:?}", txn_id, timeout);

        self.inner
            .live
            .write()
            .expect("live transactions")
            .insert(txn_id, record.clone());

        self.inner.supervisor.register(&record, deadline);

        Ok(TxnHandle::new(record))
    }

    /// Enlist `resource` in the transaction bound to `context`.
    /// Enlisting the same resource more than once has no effect.
    pub async fn enlist(&self, context: &TxnContext, resource: Arc<dyn Resource>) -> TCResult<()> {
        let record = self.bound(context, "enlist")?;
        let mut state = record.lock().await;

        if state.status != Status::Active {
            return Err(TCError::illegal_state(
                format!("cannot enlist {} in transaction {}", resource.name(), record.id()),
                state.status,
            ));
        }

        if state
            .resources
            .iter()
            .any(|enlisted| same_resource(enlisted, &resource))
        {
            trace!("{} is already enlisted in {}", resource.name(), record.id());
        } else {
            debug!("enlist {} in transaction {}", resource.name(), record.id());
            state.resources.push(resource);
        }

        Ok(())
    }

    /// Commit the transaction bound to `context` and release the binding.
    pub async fn commit(&self, context: &TxnContext) -> TCResult<()> {
        let record = self.bound(context, "commit")?;
        let result = self.inner.commit(&record).await;

        if !record.is_live() {
            context.release(record.id());
        }

        result
    }

    /// Roll back the transaction bound to `context` and release the binding.
    pub async fn rollback(&self, context: &TxnContext) -> TCResult<()> {
        let record = self.bound(context, "rollback")?;
        let status = self.inner.abort(&record, Outcome::RolledBack).await;

        if !record.is_live() {
            context.release(record.id());
        }

        match status? {
            Status::Heuristic => Err(TCError::heuristic(format!(
                "no resource enlisted in transaction {} could be rolled back",
                record.id()
            ))),
            _ => Ok(()),
        }
    }

    /// Set the timeout of the transaction bound to `context`, measured from now, and of every
    /// transaction subsequently begun on `context` without an explicit timeout.
    ///
    /// A zero `timeout` restores the default. This has no effect on a transaction which is
    /// already being prepared.
    pub async fn set_transaction_timeout(
        &self,
        context: &TxnContext,
        timeout: Duration,
    ) -> TCResult<()> {
        let timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };

        context.set_timeout(timeout);

        let record = if let Some(record) = context.live() {
            record
        } else {
            return Ok(());
        };

        let mut state = record.lock().await;
        if state.status == Status::Active {
            let timeout = timeout.unwrap_or(self.inner.default_timeout);
            self.inner.supervisor.deregister(&record, state.deadline);
            state.deadline = Instant::now() + timeout;

            debug!(
                "transaction {} will now time out after {:?}",
                record.id(),
                timeout
            );

            self.inner.supervisor.register(&record, state.deadline);
        } else {
            trace!(
                "not changing the timeout of transaction {} since it's {}",
                record.id(),
                state.status
            );
        }

        Ok(())
    }

    /// Mark the transaction bound to `context` so that it can only be rolled back.
    pub async fn set_rollback_only(&self, context: &TxnContext) -> TCResult<()> {
        let record = self.bound(context, "set_rollback_only")?;
        let mut state = record.lock().await;

        if state.status.is_abortable() {
            debug!("transaction {} is now rollback-only", record.id());
            state.rollback_only = true;
            Ok(())
        } else {
            Err(TCError::illegal_state(
                format!("cannot mark transaction {} rollback-only", record.id()),
                state.status,
            ))
        }
    }

    /// The [`Status`] of the transaction bound to `context`, if any.
    pub fn get_status(&self, context: &TxnContext) -> Option<Status> {
        context.live().map(|record| record.status())
    }

    /// Detach the transaction bound to `context`, if any, so that `context` can begin another.
    pub fn suspend(&self, context: &TxnContext) -> Option<TxnHandle> {
        let record = context.take()?;
        record.detach();
        debug!("suspend transaction {}", record.id());
        Some(TxnHandle::new(record))
    }

    /// Bind a transaction detached by [`Self::suspend`] to `context`.
    ///
    /// A transaction which is still bound to a context cannot be resumed.
    pub fn resume(&self, context: &TxnContext, handle: TxnHandle) -> TCResult<()> {
        let record = handle.record();

        if !record.is_live() {
            return Err(TCError::illegal_state(
                format!("cannot resume transaction {}", record.id()),
                record.status(),
            ));
        }

        if !record.attach() {
            return Err(TCError::illegal_state(
                format!(
                    "cannot resume transaction {} while it's bound to another context",
                    record.id()
                ),
                record.status(),
            ));
        }

        debug!("resume transaction {}", record.id());

        context.bind(record.clone()).map_err(|txn_id| {
            record.detach();
            TCError::already_active(txn_id)
        })
    }

    /// Return the [`TxnId`] of the transaction bound to `context` if it's still
    /// [`Status::Active`], or else an error.
    ///
    /// Like any other operation, this reports a timeout once and then releases the binding.
    pub fn check_active(&self, context: &TxnContext) -> TCResult<TxnId> {
        let record = self.bound(context, "check_active")?;
        let status = record.status();

        if status == Status::Active {
            Ok(*record.id())
        } else {
            Err(TCError::illegal_state(
                format!("transaction {} is no longer active", record.id()),
                status,
            ))
        }
    }

    /// Look up the live transaction bound to `context`.
    ///
    /// If the timeout supervisor has rolled back the bound transaction, this releases the
    /// binding and reports the timeout.
    fn bound(&self, context: &TxnContext, operation: &str) -> TCResult<Arc<Record>> {
        let record = context
            .bound()
            .ok_or_else(|| TCError::no_active_transaction(operation))?;

        if record.is_live() {
            return Ok(record);
        }

        context.release(record.id());

        if record.outcome() == Some(Outcome::TimedOut) {
            Err(timed_out(record.id()).consume(operation))
        } else {
            Err(TCError::no_active_transaction(operation))
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    async fn commit(&self, record: &Arc<Record>) -> TCResult<()> {
        let txn_id = *record.id();

        let resources = {
            let mut state = record.lock().await;

            if state.status != Status::Active {
                return Err(TCError::illegal_state(
                    format!("cannot commit transaction {}", txn_id),
                    state.status,
                ));
            }

            let abort = if state.rollback_only {
                let cause = TCError::rolled_back(format!(
                    "transaction {} was marked rollback-only",
                    txn_id
                ));

                Some((Outcome::RolledBack, cause))
            } else if Instant::now() >= state.deadline {
                info!("transaction {} passed its deadline before commit", txn_id);
                Some((Outcome::TimedOut, timed_out(&txn_id)))
            } else {
                None
            };

            if let Some((outcome, cause)) = abort {
                record.transition(&mut state, Status::RollingBack)?;
                let resources = state.resources.clone();
                std::mem::drop(state);

                return Err(self.roll_back(record, resources, outcome, cause).await);
            }

            record.transition(&mut state, Status::Preparing)?;
            state.resources.clone()
        };

        debug!(
            "prepare transaction {} across {} resources",
            txn_id,
            resources.len()
        );

        let mut interrupt = record.subscribe();
        let mut decision = Ok(());

        for resource in &resources {
            let vote = tokio::select! {
                vote = resource.prepare(&txn_id) => vote,
                () = interrupted(&mut interrupt) => {
                    return Err(self.interrupted(record, &resources).await);
                }
            };

            match vote {
                Ok(Vote::Commit) => trace!("{} votes to commit {}", resource.name(), txn_id),
                Ok(Vote::Rollback) => {
                    debug!("{} votes to roll back {}", resource.name(), txn_id);

                    decision = Err(TCError::rolled_back(format!(
                        "{} voted to roll back transaction {}",
                        resource.name(),
                        txn_id
                    )));

                    break;
                }
                Err(cause) => {
                    warn!("{} failed to prepare {}: {}", resource.name(), txn_id, cause);

                    decision = Err(TCError::rolled_back(format!(
                        "{} failed to prepare transaction {}",
                        resource.name(),
                        txn_id
                    ))
                    .consume(cause));

                    break;
                }
            }
        }

        {
            let mut state = record.lock().await;

            if state.status != Status::Preparing {
                std::mem::drop(state);
                return Err(self.interrupted(record, &resources).await);
            }

            let mut outcome = Outcome::RolledBack;

            if decision.is_ok() && state.rollback_only {
                decision = Err(TCError::rolled_back(format!(
                    "transaction {} was marked rollback-only",
                    txn_id
                )));
            }

            if decision.is_ok() && Instant::now() >= state.deadline {
                info!("transaction {} passed its deadline while preparing", txn_id);
                outcome = Outcome::TimedOut;
                decision = Err(timed_out(&txn_id));
            }

            if decision.is_ok() {
                // the prepare decision must be durable before any resource commits
                if let Err(cause) = self.log.record(&txn_id, Status::Prepared).await {
                    decision = Err(TCError::rolled_back(format!(
                        "unable to record the prepare decision for transaction {}",
                        txn_id
                    ))
                    .consume(cause));
                }
            }

            match decision {
                Ok(()) => {
                    record.transition(&mut state, Status::Prepared)?;
                    record.transition(&mut state, Status::Committing)?;
                }
                Err(cause) => {
                    record.transition(&mut state, Status::RollingBack)?;
                    std::mem::drop(state);

                    return Err(self.roll_back(record, resources, outcome, cause).await);
                }
            }
        }

        debug!("commit transaction {}", txn_id);

        let mut anomalies = Vec::new();
        for resource in &resources {
            if let Err(cause) = resource.commit(&txn_id).await {
                warn!("{} failed to commit {}: {}", resource.name(), txn_id, cause);
                anomalies.push(format!("{}: {}", resource.name(), cause));
            }
        }

        if anomalies.is_empty() {
            self.complete(record, Status::Committed, Outcome::Committed, anomalies)
                .await?;

            info!("committed transaction {}", txn_id);
            Ok(())
        } else {
            let message = format!(
                "{} of {} resources failed to commit transaction {}",
                anomalies.len(),
                resources.len(),
                txn_id
            );

            self.complete(record, Status::Heuristic, Outcome::Heuristic, anomalies)
                .await?;

            Err(TCError::heuristic(message))
        }
    }

    /// Roll back a transaction which is still [`Status::Active`] or [`Status::Preparing`].
    async fn abort(&self, record: &Arc<Record>, outcome: Outcome) -> TCResult<Status> {
        let resources = {
            let mut state = record.lock().await;

            if !state.status.is_abortable() {
                return Err(TCError::illegal_state(
                    format!("cannot roll back transaction {}", record.id()),
                    state.status,
                ));
            }

            record.transition(&mut state, Status::RollingBack)?;
            state.resources.clone()
        };

        Ok(self.sweep(record, resources, outcome).await)
    }

    /// Roll back every still-live transaction whose deadline has passed as of `now`.
    async fn expire(&self, now: Instant) {
        let expired = self.supervisor.expired(now);

        if expired.is_empty() {
            return;
        }

        trace!("{} transactions may have timed out", expired.len());

        join_all(expired.iter().map(|record| self.time_out(record, now))).await;
    }

    async fn time_out(&self, record: &Arc<Record>, now: Instant) {
        let resources = {
            let mut state = record.lock().await;

            if !state.status.is_abortable() || state.deadline > now {
                return;
            }

            info!(
                "transaction {} timed out while {}, rolling back",
                record.id(),
                state.status
            );

            if let Err(cause) = record.transition(&mut state, Status::RollingBack) {
                warn!("{}", cause);
                return;
            }

            state.resources.clone()
        };

        self.sweep(record, resources, Outcome::TimedOut).await;
    }

    /// Roll back `resources` after a commit request decided to roll back,
    /// and return the error to report to the caller.
    async fn roll_back(
        &self,
        record: &Arc<Record>,
        resources: Vec<Arc<dyn Resource>>,
        outcome: Outcome,
        cause: TCError,
    ) -> TCError {
        match self.sweep(record, resources, outcome).await {
            Status::Heuristic => TCError::heuristic(format!(
                "no resource enlisted in transaction {} could be rolled back",
                record.id()
            ))
            .consume(cause),
            _ => cause,
        }
    }

    /// Handle a commit request which lost a race with a rollback of the same transaction.
    async fn interrupted(&self, record: &Arc<Record>, resources: &[Arc<dyn Resource>]) -> TCError {
        let txn_id = record.id();
        debug!("commit of transaction {} was interrupted", txn_id);

        record.wait().await;

        // a vote abandoned mid-flight may have staged work after its resource rolled back
        for resource in resources {
            if let Err(cause) = resource.rollback(txn_id).await {
                warn!("{} failed to roll back {}: {}", resource.name(), txn_id, cause);
            }
        }

        match record.outcome() {
            Some(Outcome::TimedOut) => timed_out(txn_id),
            _ => TCError::rolled_back(format!(
                "transaction {} was rolled back during commit",
                txn_id
            )),
        }
    }

    /// Ask every resource to roll back, then complete the transaction.
    /// Returns [`Status::Heuristic`] if no resource could be rolled back.
    async fn sweep(
        &self,
        record: &Arc<Record>,
        resources: Vec<Arc<dyn Resource>>,
        outcome: Outcome,
    ) -> Status {
        let txn_id = record.id();
        debug!("roll back transaction {}", txn_id);

        let results = join_all(resources.iter().map(|resource| resource.rollback(txn_id))).await;

        let mut anomalies = Vec::new();
        for (resource, result) in resources.iter().zip(results) {
            if let Err(cause) = result {
                warn!("{} failed to roll back {}: {}", resource.name(), txn_id, cause);
                anomalies.push(format!("{}: {}", resource.name(), cause));
            }
        }

        let (status, outcome) = if !resources.is_empty() && anomalies.len() == resources.len() {
            (Status::Heuristic, Outcome::Heuristic)
        } else {
            (Status::RolledBack, outcome)
        };

        match self.complete(record, status, outcome, anomalies).await {
            Ok(()) => {
                info!("transaction {} {}", txn_id, outcome);
                status
            }
            Err(cause) => {
                warn!("{}", cause);
                record.status()
            }
        }
    }

    async fn complete(
        &self,
        record: &Arc<Record>,
        status: Status,
        outcome: Outcome,
        anomalies: Vec<String>,
    ) -> TCResult<()> {
        let txn_id = record.id();

        {
            let mut state = record.lock().await;
            state.anomalies.extend(anomalies);
            record.complete(&mut state, status, outcome)?;
            self.supervisor.deregister(record, state.deadline);
        }

        self.live.write().expect("live transactions").remove(txn_id);

        if let Err(cause) = self.log.record(txn_id, status).await {
            warn!("unable to record that transaction {} is {}: {}", txn_id, status, cause);
        }

        Ok(())
    }
}

fn spawn_supervisor_thread(inner: Weak<Inner>, sweep_interval: Duration) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tokio::spawn(async move {
        loop {
            interval.tick().await;

            if let Some(inner) = inner.upgrade() {
                inner.expire(Instant::now()).await;
            } else {
                debug!("coordinator dropped, stopping the timeout supervisor");
                break;
            }
        }
    });
}

/// Resolves once the watched transaction is no longer [`Status::Preparing`].
async fn interrupted(status: &mut watch::Receiver<Status>) {
    let _ = status.wait_for(|status| *status != Status::Preparing).await;
}

fn same_resource(left: &Arc<dyn Resource>, right: &Arc<dyn Resource>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(left) as *const (),
        Arc::as_ptr(right) as *const (),
    )
}

fn timed_out(txn_id: &TxnId) -> TCError {
    TCError::timeout(format!(
        "transaction {} was rolled back because it timed out",
        txn_id
    ))
}
