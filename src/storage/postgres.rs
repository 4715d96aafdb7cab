use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{IsolationLevel, StorageProvider};
use crate::{Executor, StorageError};

/// Storage provider over a PostgreSQL connection pool.
///
/// Each unit of work gets its own pooled transaction wrapped in an
/// [`Executor`]; repositories built from that executor run their queries
/// inside it.
#[derive(Clone, Debug)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StorageProvider for PostgresStorage {
    type Handle = Executor;

    async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<Executor, StorageError> {
        let mut tx = self.pool.begin().await?;
        if let Some(level) = isolation {
            let statement = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            sqlx::query(&statement).execute(&mut *tx).await?;
            debug!(isolation = %level, "transaction isolation set");
        }
        Ok(Executor::new(tx))
    }

    async fn commit(&self, handle: &Executor) -> Result<(), StorageError> {
        let tx = handle.take_transaction().await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, handle: &Executor) -> Result<(), StorageError> {
        let tx = handle.take_transaction().await?;
        tx.rollback().await?;
        Ok(())
    }
}
