//! A [`Table`] of rows with a unique key, versioned per transaction.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, trace};

use tc_txn::{Resource, TxnId, Vote};
use tc_txn_error::*;

use crate::delay::{NoDelay, PrepareDelay};

struct State<T> {
    canon: BTreeMap<String, T>,
    pending: HashMap<TxnId, BTreeMap<String, T>>,
    reserved: HashMap<String, TxnId>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            canon: BTreeMap::new(),
            pending: HashMap::new(),
            reserved: HashMap::new(),
        }
    }
}

/// An in-memory table of rows of type `T` keyed by a unique `String`.
///
/// Writes are staged per transaction and become visible to other readers only when the
/// transaction commits. Reads without a [`TxnId`] see committed rows only.
/// The uniqueness of each key is checked when a transaction is prepared; a transaction which
/// inserts a key that's already committed, or reserved by another prepared transaction,
/// votes to roll back.
pub struct Table<T> {
    name: String,
    state: Mutex<State<T>>,
    delay: Arc<dyn PrepareDelay>,
}

impl<T> Table<T> {
    /// Construct a new empty `Table`.
    pub fn new<I: fmt::Display>(name: I) -> Self {
        Self::with_prepare_delay(name, Arc::new(NoDelay))
    }

    /// Construct a new empty `Table` which runs `delay` at the end of every prepare request.
    pub fn with_prepare_delay<I: fmt::Display>(name: I, delay: Arc<dyn PrepareDelay>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            delay,
        }
    }

    /// Return `true` if `key` is visible at `txn_id`, or committed if `txn_id` is `None`.
    pub fn contains(&self, txn_id: Option<&TxnId>, key: &str) -> bool {
        let state = self.state.lock().expect("table state");

        if state.canon.contains_key(key) {
            return true;
        }

        txn_id
            .and_then(|txn_id| state.pending.get(txn_id))
            .map_or(false, |writes| writes.contains_key(key))
    }

    /// Stage the insertion of `row` at `key` at `txn_id`.
    ///
    /// Returns `false` without staging anything if `key` is already visible at `txn_id`,
    /// or a conflict error if another transaction has already prepared an insert at `key`.
    pub fn insert(&self, txn_id: &TxnId, key: String, row: T) -> TCResult<bool> {
        let mut state = self.state.lock().expect("table state");

        if state.canon.contains_key(&key) {
            return Ok(false);
        }

        if let Some(owner) = state.reserved.get(&key).filter(|owner| *owner != txn_id) {
            return Err(TCError::conflict(format!(
                "key {} in {} is reserved by transaction {}",
                key, self.name, owner
            )));
        }

        let writes = state.pending.entry(*txn_id).or_default();
        if writes.contains_key(&key) {
            Ok(false)
        } else {
            trace!("stage insert of {} into {} at {}", key, self.name, txn_id);
            writes.insert(key, row);
            Ok(true)
        }
    }

    /// The number of committed rows.
    pub fn len(&self) -> usize {
        self.state.lock().expect("table state").canon.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of transactions with staged writes which have not yet completed.
    pub fn pending(&self) -> usize {
        self.state.lock().expect("table state").pending.len()
    }
}

impl<T: Clone> Table<T> {
    /// Look up the row at `key` as visible at `txn_id`, or committed if `txn_id` is `None`.
    pub fn get(&self, txn_id: Option<&TxnId>, key: &str) -> Option<T> {
        let state = self.state.lock().expect("table state");

        txn_id
            .and_then(|txn_id| state.pending.get(txn_id))
            .and_then(|writes| writes.get(key))
            .or_else(|| state.canon.get(key))
            .cloned()
    }

    /// Every committed row, in key order.
    pub fn rows(&self) -> Vec<T> {
        let state = self.state.lock().expect("table state");
        state.canon.values().cloned().collect()
    }
}

#[async_trait]
impl<T: Send + Sync> Resource for Table<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, txn_id: &TxnId) -> TCResult<Vote> {
        let vote = {
            let mut state = self.state.lock().expect("table state");
            let State {
                canon,
                pending,
                reserved,
            } = &mut *state;

            match pending.get(txn_id) {
                None => Vote::Commit,
                Some(writes) => {
                    let conflict = writes.keys().find(|key| {
                        canon.contains_key(*key)
                            || reserved.get(*key).map_or(false, |owner| owner != txn_id)
                    });

                    if let Some(key) = conflict {
                        debug!("{} at {} conflicts with key {}", self.name, txn_id, key);
                        Vote::Rollback
                    } else {
                        for key in writes.keys() {
                            reserved.insert(key.clone(), *txn_id);
                        }

                        Vote::Commit
                    }
                }
            }
        };

        trace!("{} votes {} at {}", self.name, vote, txn_id);

        self.delay.delay(txn_id).await;
        Ok(vote)
    }

    async fn commit(&self, txn_id: &TxnId) -> TCResult<()> {
        let mut state = self.state.lock().expect("table state");

        if let Some(writes) = state.pending.remove(txn_id) {
            debug!("commit {} rows to {} at {}", writes.len(), self.name, txn_id);

            for (key, row) in writes {
                if state.reserved.get(&key) == Some(txn_id) {
                    state.reserved.remove(&key);
                }

                state.canon.insert(key, row);
            }
        }

        Ok(())
    }

    async fn rollback(&self, txn_id: &TxnId) -> TCResult<()> {
        let mut state = self.state.lock().expect("table state");

        if let Some(writes) = state.pending.remove(txn_id) {
            debug!("discard {} rows staged in {} at {}", writes.len(), self.name, txn_id);
        }

        state.reserved.retain(|_, owner| owner != txn_id);

        Ok(())
    }
}

impl<T> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "table {}", self.name)
    }
}
