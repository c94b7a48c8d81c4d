use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, Weak};

use ds_ext::OrdHashSet;
use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::record::Record;
use crate::TxnId;

#[derive(Debug)]
struct Deadline {
    txn_id: TxnId,
    expires: Instant,
    record: Weak<Record>,
}

impl Deadline {
    fn new(record: &Arc<Record>, expires: Instant) -> Self {
        Self {
            txn_id: *record.id(),
            expires,
            record: Arc::downgrade(record),
        }
    }
}

impl Eq for Deadline {}

impl PartialEq<Self> for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.txn_id == other.txn_id && self.expires == other.expires
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires
            .cmp(&other.expires)
            .then(self.txn_id.cmp(&other.txn_id))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Deadline {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.txn_id.hash(hasher);
        self.expires.hash(hasher);
    }
}

enum Change {
    Register(Deadline),
    Deregister(Deadline),
}

/// Keeps track of the deadline of every live transaction, in deadline order.
///
/// Entries hold only a weak reference to their transaction. Changes are applied in the order
/// they're sent, so moving a deadline means deregistering the old one and registering the new.
pub(crate) struct Supervisor {
    deadlines: Arc<RwLock<OrdHashSet<Deadline>>>,
    tx: mpsc::UnboundedSender<Change>,
}

impl Supervisor {
    /// Construct a new `Supervisor`. This spawns a task and must be called within a tokio runtime.
    pub fn new() -> Self {
        let deadlines = Arc::new(RwLock::new(OrdHashSet::new()));

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_receiver_thread(deadlines.clone(), rx);

        Self { deadlines, tx }
    }

    /// Watch `record` until `expires`.
    pub fn register(&self, record: &Arc<Record>, expires: Instant) {
        trace!("watch transaction {} until {:?}", record.id(), expires);

        let change = Change::Register(Deadline::new(record, expires));
        if self.tx.send(change).is_err() {
            debug!(
                "timeout supervisor has shut down, not watching transaction {}",
                record.id()
            );
        }
    }

    /// Stop watching `record` until `expires`.
    pub fn deregister(&self, record: &Arc<Record>, expires: Instant) {
        trace!("stop watching transaction {} until {:?}", record.id(), expires);

        let change = Change::Deregister(Deadline::new(record, expires));
        if self.tx.send(change).is_err() {
            trace!("timeout supervisor has shut down");
        }
    }

    /// Remove and return every still-live transaction whose deadline has passed as of `now`.
    pub fn expired(&self, now: Instant) -> Vec<Arc<Record>> {
        let mut deadlines = self.deadlines.write().expect("transaction deadlines");
        let mut expired = Vec::new();

        while let Some(deadline) = deadlines.first() {
            if deadline.expires <= now {
                let deadline = deadlines.pop_first().expect("expired deadline");

                if let Some(record) = deadline.record.upgrade() {
                    if record.status().is_abortable() {
                        expired.push(record);
                    }
                }
            } else {
                break;
            }
        }

        expired
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.deadlines.read().expect("transaction deadlines").len()
    }
}

fn spawn_receiver_thread(
    deadlines: Arc<RwLock<OrdHashSet<Deadline>>>,
    mut rx: mpsc::UnboundedReceiver<Change>,
) {
    tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            let mut deadlines = deadlines.write().expect("transaction deadlines");
            apply(&mut deadlines, change);

            while let Ok(change) = rx.try_recv() {
                apply(&mut deadlines, change);
            }
        }
    });
}

fn apply(deadlines: &mut OrdHashSet<Deadline>, change: Change) {
    match change {
        Change::Register(deadline) => {
            deadlines.insert(deadline);
        }
        Change::Deregister(deadline) => {
            deadlines.remove(&deadline);
        }
    }
}
