//! A customer manager which creates customers with unique names inside a transaction.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use tc_txn::{Coordinator, Resource, TxnContext, TxnId};
use tc_txn_error::*;
use tc_txn_store::Table;

/// A customer, identified by a unique name.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: u64,
    pub name: String,
}

impl fmt::Display for Customer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "customer {} ({})", self.id, self.name)
    }
}

/// Creates, lists, and counts [`Customer`]s stored in a transactional [`Table`].
pub struct CustomerManager {
    coordinator: Coordinator,
    customers: Arc<Table<Customer>>,
    next_id: AtomicU64,
}

impl CustomerManager {
    pub fn new(coordinator: Coordinator, customers: Arc<Table<Customer>>) -> Self {
        let next_id = customers
            .rows()
            .iter()
            .map(|customer| customer.id + 1)
            .max()
            .unwrap_or(1);

        Self {
            coordinator,
            customers,
            next_id: AtomicU64::new(next_id),
        }
    }

    /// Create a customer called `name` unless one already exists.
    ///
    /// If `context` is bound to a transaction, the customer is created as part of it and the
    /// caller is responsible for committing. A bound transaction which has already timed out
    /// fails with a timeout error. Otherwise this begins and commits a transaction of its own.
    /// Returns `true` if a new customer was created.
    pub async fn create(&self, context: &TxnContext, name: &str) -> TCResult<bool> {
        if name.is_empty() {
            return Err(TCError::bad_request("invalid customer name", "(empty)"));
        }

        if let Some(txn_id) = context.bound_id() {
            debug!("create customer {} as part of transaction {}", name, txn_id);
            return self.insert(context, &txn_id, name).await;
        }

        let handle = self.coordinator.begin(context, None)?;
        let txn_id = *handle.id();

        let result = match self.insert(context, &txn_id, name).await {
            Ok(created) => self.coordinator.commit(context).await.map(|()| created),
            Err(cause) => {
                if let Err(rollback_err) = self.coordinator.rollback(context).await {
                    debug!("rollback after a failed insert: {}", rollback_err);
                }

                Err(cause)
            }
        };

        if result.is_err() {
            // writes staged after a forced rollback reached this table are not visible,
            // but must still be discarded
            if let Err(cause) = self.customers.rollback(&txn_id).await {
                warn!("unable to discard staged customer {}: {}", name, cause);
            }
        }

        result
    }

    /// Every committed customer, ordered by name.
    pub fn list(&self) -> Vec<Customer> {
        self.customers.rows()
    }

    /// The number of committed customers.
    pub fn count(&self) -> usize {
        self.customers.len()
    }

    async fn insert(&self, context: &TxnContext, txn_id: &TxnId, name: &str) -> TCResult<bool> {
        let resource: Arc<dyn Resource> = self.customers.clone();
        self.coordinator.enlist(context, resource).await?;

        if self.customers.contains(Some(txn_id), name) {
            debug!("customer {} already exists", name);
            return Ok(false);
        }

        let customer = Customer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
        };

        debug!("insert {} at {}", customer, txn_id);
        let created = self.customers.insert(txn_id, name.to_string(), customer)?;

        self.discard_unless_active(context, txn_id).await?;
        Ok(created)
    }

    /// Discard the rows staged at `txn_id` if its transaction is no longer active,
    /// since a rollback may have reached the table before they were staged.
    async fn discard_unless_active(&self, context: &TxnContext, txn_id: &TxnId) -> TCResult<()> {
        match self.coordinator.check_active(context) {
            Ok(_) => Ok(()),
            Err(cause) => {
                debug!("discard customers staged at {}: {}", txn_id, cause);

                if let Err(rollback_err) = self.customers.rollback(txn_id).await {
                    warn!("unable to discard customers staged at {}: {}", txn_id, rollback_err);
                }

                Err(cause)
            }
        }
    }
}
