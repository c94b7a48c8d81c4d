//! Strategies to delay a [`crate::Table`]'s prepare vote, to simulate a slow resource.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use tc_txn::TxnId;

/// Runs at the end of every prepare request, after the vote is decided and before it's returned.
#[async_trait]
pub trait PrepareDelay: Send + Sync {
    async fn delay(&self, txn_id: &TxnId);
}

/// Return prepare votes immediately.
pub struct NoDelay;

#[async_trait]
impl PrepareDelay for NoDelay {
    async fn delay(&self, _txn_id: &TxnId) {}
}

/// Delay every prepare vote by a fixed duration, which can be changed at any time.
#[derive(Default)]
pub struct FixedDelay {
    millis: AtomicU64,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            millis: AtomicU64::new(as_millis(delay)),
        }
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Relaxed))
    }

    pub fn set(&self, delay: Duration) {
        self.millis.store(as_millis(delay), Ordering::Relaxed);
    }
}

fn as_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl PrepareDelay for FixedDelay {
    async fn delay(&self, txn_id: &TxnId) {
        let delay = self.get();

        if !delay.is_zero() {
            debug!("delay the prepare vote for {} by {:?}", txn_id, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
