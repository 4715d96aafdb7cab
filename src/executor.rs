use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::StorageError;

/// Executor wraps a database transaction for use by repositories.
///
/// This is the storage handle a PostgreSQL-backed unit of work hands to its
/// body. Clones share the same transaction; once it is committed or rolled
/// back, every clone sees `None`.
#[derive(Clone, Debug)]
pub struct Executor {
    pub tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl Executor {
    /// Creates a new Executor from a PostgreSQL transaction.
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Whether commit or rollback already consumed the transaction.
    pub async fn is_closed(&self) -> bool {
        self.tx.lock().await.is_none()
    }

    /// Takes ownership of the transaction, leaving None in its place.
    /// This should only be called when committing or rolling back.
    pub(crate) async fn take_transaction(&self) -> Result<Transaction<'static, Postgres>, StorageError> {
        self.tx
            .lock()
            .await
            .take()
            .ok_or(StorageError::TransactionClosed)
    }
}
