//! Retry classification and backoff.

use std::sync::Arc;
use std::time::Duration;

use crate::{ErrorKind, TransactionError};

/// Decides whether a terminal error is worth another attempt.
///
/// Swap this out per storage backend when its errors need a different reading
/// than [`TransactionError::kind`].
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &TransactionError) -> ErrorKind;
}

/// Uses the built-in [`TransactionError::kind`] mapping: lock, deadlock and
/// connection conditions are transient, everything else is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &TransactionError) -> ErrorKind {
        error.kind()
    }
}

/// One attempt of a unit of work, as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based.
    pub attempt: u32,
    /// Time since the first attempt started, measured when this one ended.
    pub elapsed: Duration,
    /// `None` when the attempt succeeded.
    pub kind: Option<ErrorKind>,
    /// Backoff slept before the next attempt, if one followed.
    pub backoff: Option<Duration>,
}

/// Exponential backoff with jitter, bounded by a maximum attempt count.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    retry_on_timeout: bool,
    classifier: Arc<dyn ErrorClassifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: true,
            retry_on_timeout: false,
            classifier: Arc::new(DefaultClassifier),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the base delay and the cap. The cap is never below the base.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Lets a timed-out attempt be retried while attempts and budget remain.
    pub fn with_retry_on_timeout(mut self, retry_on_timeout: bool) -> Self {
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn classify(&self, error: &TransactionError) -> ErrorKind {
        self.classifier.classify(error)
    }

    /// Whether the attempt that just failed with `kind` may be followed by another.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match kind {
            ErrorKind::Transient => true,
            ErrorKind::Timeout => self.retry_on_timeout,
            ErrorKind::Permanent | ErrorKind::DeliveryFailure => false,
        }
    }

    /// Delay to wait after the 1-based `attempt` failed.
    ///
    /// `min(cap, base * 2^(attempt-1))` plus up to half of that again as
    /// jitter. Jitter never lifts a delay to the cap, so delays strictly
    /// increase until one reaches the cap and stay there afterwards.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.max_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);

        let spread = (delay_ms / 2).min(cap_ms - delay_ms);
        let jitter_ms = if self.jitter && spread > 0 {
            fastrand::u64(0..spread)
        } else {
            0
        };
        Duration::from_millis(delay_ms + jitter_ms)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish_non_exhaustive()
    }
}
