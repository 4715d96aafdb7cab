use std::time::Duration;

use crate::Phase;

/// Boxed error used for failures coming from collaborator code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for coordinator operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Classification of a terminal error, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Lock contention, deadlock, lost connection. Eligible for retry.
    Transient,
    /// Constraint violation, validation failure, critical-adapter rejection.
    Permanent,
    /// The attempt exceeded its time budget.
    Timeout,
    /// An effect could not be delivered to its transport.
    DeliveryFailure,
}

/// Errors reported by a storage transaction provider.
///
/// Lock and deadlock conditions are kept apart from constraint violations so
/// that a retry policy can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("lock not available: {0}")]
    LockTimeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("transaction already closed")]
    TransactionClosed,

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the condition may clear up on its own if the work is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Serialization(_)
                | StorageError::Deadlock(_)
                | StorageError::LockTimeout(_)
                | StorageError::Connection(_)
        )
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some("40001") => StorageError::Serialization(message),
                    Some("40P01") => StorageError::Deadlock(message),
                    Some("55P03") => StorageError::LockTimeout(message),
                    Some(code) if code.starts_with("23") => {
                        StorageError::ConstraintViolation(message)
                    }
                    Some(code) if code.starts_with("08") => StorageError::Connection(message),
                    _ => StorageError::Backend(message),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StorageError::Connection(err.to_string())
            }
            sqlx::Error::PoolClosed => StorageError::TransactionClosed,
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

/// Error type for a unit of work
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction commit failed: {0}")]
    CommitFailed(StorageError),

    #[error("Unit of work failed: {0}")]
    Body(String),

    #[error("Adapter '{adapter}' rejected phase {phase}: {source}")]
    AdapterRejected {
        adapter: String,
        phase: Phase,
        #[source]
        source: Box<TransactionError>,
    },

    #[error("Delivery of effect {effect_id} failed: {reason}")]
    DeliveryFailure { effect_id: String, reason: String },

    #[error("Unit of work exceeded its time budget of {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(BoxError),
}

impl TransactionError {
    /// Wraps an arbitrary collaborator error.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        TransactionError::Other(err.into())
    }

    /// Shorthand for a failure raised by the unit-of-work body itself.
    pub fn body(message: impl Into<String>) -> Self {
        TransactionError::Body(message.into())
    }

    /// Built-in classification. Critical-adapter rejections take the kind of
    /// their cause when that cause is a transient storage condition.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::Storage(e) | TransactionError::CommitFailed(e) => {
                if e.is_transient() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            TransactionError::AdapterRejected { source, .. } => match source.kind() {
                ErrorKind::Transient => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            TransactionError::DeliveryFailure { .. } => ErrorKind::DeliveryFailure,
            TransactionError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Permanent,
        }
    }
}

impl From<sqlx::Error> for TransactionError {
    fn from(err: sqlx::Error) -> Self {
        TransactionError::Storage(err.into())
    }
}
