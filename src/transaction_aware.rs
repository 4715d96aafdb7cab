use async_trait::async_trait;

use crate::TransactionResult;

/// Trait for components that need to be notified of the outcome of a single
/// unit of work.
///
/// Unlike an [`Adapter`](crate::Adapter), which is registered once for every
/// unit of work, an observer is registered on one
/// [`TransactionContext`](crate::TransactionContext) and only hears about that
/// unit's outcome. Repositories use this to flush caches or reset in-memory
/// state.
#[async_trait]
pub trait TransactionAware: Send + Sync {
    /// Called after storage committed and the AFTER_COMMIT phase ran.
    ///
    /// Errors are logged; storage is already committed.
    async fn on_commit(&self) -> TransactionResult<()>;

    /// Called after storage rolled back and the AFTER_ROLLBACK phase ran.
    ///
    /// Implementations should use this to revert any in-memory state changes
    /// that were made during the unit of work.
    async fn on_rollback(&self) -> TransactionResult<()>;
}
