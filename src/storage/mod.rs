//! Storage transaction providers.

mod memory;
mod postgres;

pub use memory::{MemoryStorage, MemoryTransaction};
pub use postgres::PostgresStorage;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::StorageError;

/// Isolation hint passed through to the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Begins, commits and rolls back the storage transaction of a unit of work.
///
/// The handle is cloned into the body and is how the body runs work against
/// the open transaction. Lock and deadlock conditions must surface as the
/// transient [`StorageError`] variants so the retry policy can act on them.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    type Handle: Clone + Send + Sync + 'static;

    async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<Self::Handle, StorageError>;

    async fn commit(&self, handle: &Self::Handle) -> Result<(), StorageError>;

    async fn rollback(&self, handle: &Self::Handle) -> Result<(), StorageError>;
}
