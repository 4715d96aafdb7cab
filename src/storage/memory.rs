use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use super::{IsolationLevel, StorageProvider};
use crate::StorageError;

type Table = BTreeMap<String, Value>;

/// Key/value storage kept in memory.
///
/// Writes are staged on the transaction and only applied to the shared table
/// on commit, which makes it a faithful stand-in for a real database in
/// tests and in embedded setups without one.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    committed: Arc<RwLock<Table>>,
    open: Arc<AtomicUsize>,
    next_commit_failure: Arc<Mutex<Option<StorageError>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the committed value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.committed.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.read().is_empty()
    }

    /// Number of transactions begun but neither committed nor rolled back.
    pub fn open_transactions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Makes the next commit fail with `error` without applying its writes.
    pub fn fail_next_commit(&self, error: StorageError) {
        *self.next_commit_failure.lock() = Some(error);
    }

    fn close(&self, tx: &MemoryTransaction) -> Result<Table, StorageError> {
        let mut state = tx.state.lock();
        if state.closed {
            return Err(StorageError::TransactionClosed);
        }
        state.closed = true;
        self.open.fetch_sub(1, Ordering::SeqCst);
        Ok(std::mem::take(&mut state.staged))
    }
}

#[derive(Default)]
struct TxState {
    staged: Table,
    closed: bool,
}

/// Handle of one open [`MemoryStorage`] transaction.
#[derive(Clone)]
pub struct MemoryTransaction {
    committed: Arc<RwLock<Table>>,
    state: Arc<Mutex<TxState>>,
    isolation: Option<IsolationLevel>,
}

impl MemoryTransaction {
    pub fn put(&self, key: impl Into<String>, value: Value) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::TransactionClosed);
        }
        state.staged.insert(key.into(), value);
        Ok(())
    }

    /// Reads through staged writes first, then the committed table.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let state = self.state.lock();
        if state.closed {
            return Err(StorageError::TransactionClosed);
        }
        if let Some(value) = state.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.committed.read().get(key).cloned())
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    type Handle = MemoryTransaction;

    async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<MemoryTransaction, StorageError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTransaction {
            committed: self.committed.clone(),
            state: Arc::new(Mutex::new(TxState::default())),
            isolation,
        })
    }

    async fn commit(&self, handle: &MemoryTransaction) -> Result<(), StorageError> {
        let staged = self.close(handle)?;
        if let Some(error) = self.next_commit_failure.lock().take() {
            debug!(error = %error, "injected commit failure");
            return Err(error);
        }
        let writes = staged.len();
        self.committed.write().extend(staged);
        debug!(writes, "memory transaction committed");
        Ok(())
    }

    async fn rollback(&self, handle: &MemoryTransaction) -> Result<(), StorageError> {
        let staged = self.close(handle)?;
        debug!(discarded = staged.len(), "memory transaction rolled back");
        Ok(())
    }
}
