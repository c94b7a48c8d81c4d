//! Durable records of transaction status transitions.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use log::trace;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use tc_txn_error::*;

use crate::{Status, TxnId};

/// A log of transaction status transitions.
///
/// The coordinator writes `Status::Prepared` here before any resource is asked to commit.
#[async_trait]
pub trait TxnLog: Send + Sync {
    /// Durably record that the transaction `txn_id` has reached the given `status`.
    async fn record(&self, txn_id: &TxnId, status: Status) -> TCResult<()>;
}

/// The number of entries a [`MemoryLog`] keeps by default.
pub const DEFAULT_CAPACITY: usize = 4096;

/// An in-memory [`TxnLog`] which keeps only its most recent entries.
pub struct MemoryLog {
    capacity: usize,
    entries: Mutex<VecDeque<(TxnId, Status)>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Construct a `MemoryLog` which keeps at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
        }
    }

    /// Return a copy of every entry in this log, in the order recorded.
    pub fn entries(&self) -> Vec<(TxnId, Status)> {
        let entries = self.entries.lock().expect("transaction log");
        entries.iter().copied().collect()
    }

    /// Return the statuses recorded for the given transaction, in the order recorded.
    pub fn statuses(&self, txn_id: &TxnId) -> Vec<Status> {
        let entries = self.entries.lock().expect("transaction log");

        entries
            .iter()
            .filter(|(id, _)| id == txn_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl TxnLog for MemoryLog {
    async fn record(&self, txn_id: &TxnId, status: Status) -> TCResult<()> {
        trace!("record {} at {}", status, txn_id);

        let mut entries = self.entries.lock().expect("transaction log");
        entries.push_back((*txn_id, status));

        while entries.len() > self.capacity {
            entries.pop_front();
        }

        Ok(())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

/// An append-only [`TxnLog`] file with one `<txn id> <status>` line per entry.
pub struct FileLog {
    path: PathBuf,
    file: tokio::sync::Mutex<fs::File>,
}

impl FileLog {
    /// Open the log file at `path`, creating it if it doesn't exist.
    pub async fn open<P: AsRef<Path>>(path: P) -> TCResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|cause| {
                TCError::from(cause).consume(format!("open transaction log {:?}", path))
            })?;

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TxnLog for FileLog {
    async fn record(&self, txn_id: &TxnId, status: Status) -> TCResult<()> {
        trace!("record {} at {} in {:?}", status, txn_id, self.path);

        let line = format!("{} {}\n", txn_id, status);

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log() {
        let log = MemoryLog::new();
        let first = TxnId::new();
        let second = TxnId::new();

        log.record(&first, Status::Prepared).await.unwrap();
        log.record(&second, Status::RolledBack).await.unwrap();
        log.record(&first, Status::Committed).await.unwrap();

        assert_eq!(
            log.statuses(&first),
            vec![Status::Prepared, Status::Committed]
        );
        assert_eq!(log.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_log_capacity() {
        let log = MemoryLog::with_capacity(2);
        let first = TxnId::new();
        let second = TxnId::new();

        log.record(&first, Status::Prepared).await.unwrap();
        log.record(&first, Status::Committed).await.unwrap();
        log.record(&second, Status::RolledBack).await.unwrap();

        assert_eq!(log.statuses(&first), vec![Status::Committed]);
        assert_eq!(
            log.entries(),
            vec![(first, Status::Committed), (second, Status::RolledBack)]
        );
    }

    #[tokio::test]
    async fn test_file_log() {
        let txn_id = TxnId::new();
        let path = std::env::temp_dir().join(format!("tc-txn-log-{}", txn_id));

        {
            let log = FileLog::open(&path).await.unwrap();
            log.record(&txn_id, Status::Prepared).await.unwrap();
            log.record(&txn_id, Status::Committed).await.unwrap();
        }

        let contents = fs::read_to_string(&path).await.unwrap();
        assert_eq!(
            contents,
            format!("{} PREPARED\n{} COMMITTED\n", txn_id, txn_id)
        );

        fs::remove_file(&path).await.unwrap();
    }
}
