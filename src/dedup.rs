//! Deduplication of effect deliveries.
//!
//! A delivery first claims its effect id in the store. Only the unit of work
//! holding the claim reaches the transport; it records the delivery right
//! after it succeeds, or releases the claim if it fails so a later attempt
//! can try again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{StorageError, TransactionResult};

/// Delivery state of one effect id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeduplicationRecord {
    pub delivered: bool,
    pub timestamp: DateTime<Utc>,
}

/// Shared map from effect id to delivery state.
///
/// Implementations must be safe to call from many units of work at once;
/// `try_claim` and `mark_delivered` are atomic check-and-set operations.
#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    async fn is_delivered(&self, effect_id: &str) -> TransactionResult<bool>;

    /// Reserves `effect_id` for delivery. Returns `false` when the id is
    /// already delivered or claimed by another unit of work.
    async fn try_claim(&self, effect_id: &str) -> TransactionResult<bool>;

    /// Drops an undelivered claim. A delivered record is left untouched.
    async fn release(&self, effect_id: &str) -> TransactionResult<()>;

    /// Records a successful delivery. Returns `false` if the id was already
    /// recorded by someone else.
    async fn mark_delivered(&self, effect_id: &str) -> TransactionResult<bool>;

    async fn record(&self, effect_id: &str) -> TransactionResult<Option<DeduplicationRecord>>;
}

/// Process-local store backed by a [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryDeduplicationStore {
    records: DashMap<String, DeduplicationRecord>,
}

impl InMemoryDeduplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forgets records older than `retention`; returns how many were removed.
    pub fn purge_older_than(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let before = self.records.len();
        self.records.retain(|_, record| record.timestamp >= cutoff);
        let purged = before - self.records.len();
        if purged > 0 {
            debug!(purged, "purged deduplication records");
        }
        purged
    }
}

#[async_trait]
impl DeduplicationStore for InMemoryDeduplicationStore {
    async fn is_delivered(&self, effect_id: &str) -> TransactionResult<bool> {
        Ok(self
            .records
            .get(effect_id)
            .map(|r| r.delivered)
            .unwrap_or(false))
    }

    async fn try_claim(&self, effect_id: &str) -> TransactionResult<bool> {
        match self.records.entry(effect_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(DeduplicationRecord {
                    delivered: false,
                    timestamp: Utc::now(),
                });
                Ok(true)
            }
        }
    }

    async fn release(&self, effect_id: &str) -> TransactionResult<()> {
        self.records.remove_if(effect_id, |_, record| !record.delivered);
        Ok(())
    }

    async fn mark_delivered(&self, effect_id: &str) -> TransactionResult<bool> {
        match self.records.entry(effect_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().delivered {
                    Ok(false)
                } else {
                    occupied.insert(DeduplicationRecord {
                        delivered: true,
                        timestamp: Utc::now(),
                    });
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DeduplicationRecord {
                    delivered: true,
                    timestamp: Utc::now(),
                });
                Ok(true)
            }
        }
    }

    async fn record(&self, effect_id: &str) -> TransactionResult<Option<DeduplicationRecord>> {
        Ok(self.records.get(effect_id).map(|r| *r))
    }
}

/// PostgreSQL-backed store, shared by every process using the same database.
///
/// # Database Schema
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS effect_deliveries (
///     effect_id TEXT PRIMARY KEY,
///     delivered BOOLEAN NOT NULL DEFAULT TRUE,
///     delivered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
#[derive(Clone, Debug)]
pub struct PgDeduplicationStore {
    pool: PgPool,
}

impl PgDeduplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `effect_deliveries` table if it does not exist.
    pub async fn ensure_schema(&self) -> TransactionResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS effect_deliveries (
                effect_id TEXT PRIMARY KEY,
                delivered BOOLEAN NOT NULL DEFAULT TRUE,
                delivered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DeduplicationStore for PgDeduplicationStore {
    async fn is_delivered(&self, effect_id: &str) -> TransactionResult<bool> {
        let row = sqlx::query("SELECT delivered FROM effect_deliveries WHERE effect_id = $1")
            .bind(effect_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(row.map(|r| r.get::<bool, _>("delivered")).unwrap_or(false))
    }

    async fn try_claim(&self, effect_id: &str) -> TransactionResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO effect_deliveries (effect_id, delivered, delivered_at)
            VALUES ($1, FALSE, NOW())
            ON CONFLICT (effect_id) DO NOTHING
            "#,
        )
        .bind(effect_id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, effect_id: &str) -> TransactionResult<()> {
        sqlx::query("DELETE FROM effect_deliveries WHERE effect_id = $1 AND delivered = FALSE")
            .bind(effect_id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn mark_delivered(&self, effect_id: &str) -> TransactionResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO effect_deliveries (effect_id, delivered, delivered_at)
            VALUES ($1, TRUE, NOW())
            ON CONFLICT (effect_id) DO UPDATE
                SET delivered = TRUE, delivered_at = NOW()
                WHERE effect_deliveries.delivered = FALSE
            "#,
        )
        .bind(effect_id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record(&self, effect_id: &str) -> TransactionResult<Option<DeduplicationRecord>> {
        let row = sqlx::query(
            "SELECT delivered, delivered_at FROM effect_deliveries WHERE effect_id = $1",
        )
        .bind(effect_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(row.map(|r| DeduplicationRecord {
            delivered: r.get("delivered"),
            timestamp: r.get("delivered_at"),
        }))
    }
}
