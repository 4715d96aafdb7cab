//! Unit of Work Coordinator
//!
//! Ties the side effects of a unit of work (domain events, cache
//! invalidation, audit records) to the fate of its storage transaction.
//! Effects queued while the work runs only become visible once the
//! transaction reaches its commit phases, and are dropped if it rolls back.
//!
//! The pieces:
//! - [`TransactionCoordinator`] drives the phase state machine, retries and timeouts.
//! - [`Adapter`]s hang concerns off each [`Phase`]; [`AdapterRegistry`] runs them by priority.
//! - [`TransactionContext`] holds the effect queue and compensation stack of one unit of work.
//! - [`EventDeferralAdapter`] flushes effects to an [`EffectTransport`], deduplicated by a
//!   [`DeduplicationStore`].
//! - [`StorageProvider`] abstracts the storage transaction; [`PostgresStorage`] and
//!   [`MemoryStorage`] are provided.
//!
//! ```rust,ignore
//! let coordinator = TransactionCoordinator::builder(PostgresStorage::new(pool))
//!     .event_deferral(Arc::new(bus), Arc::new(InMemoryDeduplicationStore::new()))
//!     .build();
//!
//! coordinator
//!     .run(|session| async move {
//!         let users = UserRepository::new(session.handle().clone());
//!         users.create(&user).await?;
//!         session.publish(PendingEffect::new("UserCreated", json!({ "id": user.id })));
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod adapter;
pub mod audit;
pub mod compensation;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dedup;
pub mod effect;
pub mod error;
pub mod event_deferral;
pub mod executor;
pub mod phase;
pub mod retry;
pub mod storage;
pub mod transaction_aware;

pub use adapter::{Adapter, AdapterRegistry};
pub use audit::AuditAdapter;
pub use compensation::{Compensation, CompensationReport};
pub use config::{CoordinatorConfig, EffectRouteConfig, RetryConfig};
pub use context::{Session, TransactionContext};
pub use coordinator::{CoordinatorBuilder, RunOptions, RunOutcome, TransactionCoordinator};
pub use dedup::{
    DeduplicationRecord, DeduplicationStore, InMemoryDeduplicationStore, PgDeduplicationStore,
};
pub use effect::{BroadcastTransport, DeliveryMode, EffectRoute, EffectRouting, EffectTransport, PendingEffect};
pub use error::{BoxError, ErrorKind, StorageError, TransactionError, TransactionResult};
pub use event_deferral::{EventDeferralAdapter, EVENT_DEFERRAL_PRIORITY};
pub use executor::Executor;
pub use phase::Phase;
pub use retry::{DefaultClassifier, ErrorClassifier, RetryAttempt, RetryPolicy};
pub use storage::{IsolationLevel, MemoryStorage, MemoryTransaction, PostgresStorage, StorageProvider};
pub use transaction_aware::TransactionAware;

pub use async_trait::async_trait;
