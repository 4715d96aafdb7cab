//! The transaction lifecycle coordinator.
//!
//! One call to [`TransactionCoordinator::run`] is one unit of work. Each
//! attempt walks the phase state machine:
//!
//! ```text
//! BEFORE_BEGIN ─► begin storage ─► AFTER_BEGIN ─► body ─► BEFORE_COMMIT ─► commit ─► AFTER_COMMIT
//!                      │                            │            │             │
//!                      └────────────────────────────┴────────────┴─────────────┘
//!                                                   │ failure or deadline
//!                                                   ▼
//!                         compensations (LIFO) ─► ON_ROLLBACK ─► rollback storage ─► AFTER_ROLLBACK
//! ```
//!
//! A failed attempt whose error the retry policy classifies as transient is
//! restarted from a fresh context after a backoff, as long as attempts and the
//! overall time budget remain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::storage::{IsolationLevel, StorageProvider};
use crate::{
    Adapter, AdapterRegistry, CoordinatorConfig, DeduplicationStore, EffectRouting,
    EffectTransport, EventDeferralAdapter, Phase, RetryAttempt, RetryPolicy, Session,
    StorageError, TransactionContext, TransactionError, TransactionResult,
};

/// Per-call overrides for [`TransactionCoordinator::run_with`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub isolation: Option<IsolationLevel>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

/// Result of a run together with the record of every attempt it took.
#[derive(Debug)]
pub struct RunOutcome<T> {
    pub result: TransactionResult<T>,
    pub attempts: Vec<RetryAttempt>,
}

/// Drives units of work through their lifecycle against a storage provider.
///
/// The coordinator is shared by every unit of work of the application; each
/// call to `run` gets its own [`TransactionContext`] and storage transaction.
pub struct TransactionCoordinator<S: StorageProvider> {
    storage: Arc<S>,
    registry: Arc<AdapterRegistry>,
    routing: Arc<EffectRouting>,
    retry: RetryPolicy,
    timeout: Duration,
    attempt_timeout: Option<Duration>,
    isolation: Option<IsolationLevel>,
}

impl<S: StorageProvider> TransactionCoordinator<S> {
    pub fn builder(storage: S) -> CoordinatorBuilder<S> {
        CoordinatorBuilder::new(storage)
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<EffectRouting> {
        &self.routing
    }

    /// Runs `body` as a unit of work with the coordinator's defaults.
    pub async fn run<T, F, Fut>(&self, body: F) -> TransactionResult<T>
    where
        F: Fn(Session<S::Handle>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        self.run_detailed(RunOptions::default(), body).await.result
    }

    /// Runs `body` with per-call timeout, retry policy or isolation overrides.
    pub async fn run_with<T, F, Fut>(&self, options: RunOptions, body: F) -> TransactionResult<T>
    where
        F: Fn(Session<S::Handle>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        self.run_detailed(options, body).await.result
    }

    /// Like [`run_with`](Self::run_with), also reporting every attempt.
    ///
    /// `body` may be invoked once per attempt; each invocation sees a fresh
    /// context and storage transaction.
    pub async fn run_detailed<T, F, Fut>(&self, options: RunOptions, body: F) -> RunOutcome<T>
    where
        F: Fn(Session<S::Handle>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let budget = options.timeout.unwrap_or(self.timeout);
        let deadline = started + budget;
        let policy = options.retry.unwrap_or_else(|| self.retry.clone());
        let isolation = options.isolation.or(self.isolation);

        let mut attempts = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let (attempt_deadline, attempt_budget) = match self.attempt_timeout {
                Some(limit) if Instant::now() + limit < deadline => (Instant::now() + limit, limit),
                _ => (deadline, budget),
            };

            let result = self
                .attempt(attempt, &body, isolation, attempt_deadline, attempt_budget)
                .await;

            let error = match result {
                Ok(value) => {
                    attempts.push(RetryAttempt {
                        attempt,
                        elapsed: started.elapsed(),
                        kind: None,
                        backoff: None,
                    });
                    info!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "unit of work committed");
                    return RunOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(error) => error,
            };

            let kind = policy.classify(&error);
            let mut record = RetryAttempt {
                attempt,
                elapsed: started.elapsed(),
                kind: Some(kind),
                backoff: None,
            };

            if !policy.should_retry(attempt, kind) {
                attempts.push(record);
                warn!(attempt, ?kind, error = %error, "unit of work failed");
                return RunOutcome {
                    result: Err(error),
                    attempts,
                };
            }

            let delay = policy.next_delay(attempt);
            if Instant::now() + delay >= deadline {
                attempts.push(record);
                warn!(attempt, ?kind, error = %error, "time budget exhausted, not retrying");
                return RunOutcome {
                    result: Err(error),
                    attempts,
                };
            }

            record.backoff = Some(delay);
            attempts.push(record);
            warn!(
                attempt,
                ?kind,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "unit of work failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        attempt: u32,
        body: &F,
        isolation: Option<IsolationLevel>,
        deadline: Instant,
        budget: Duration,
    ) -> TransactionResult<T>
    where
        F: Fn(Session<S::Handle>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        let context = TransactionContext::new(attempt, self.routing.clone());
        debug!(unit_id = %context.unit_id(), attempt, "unit of work starting");

        match timeout_at(deadline, self.registry.for_phase(Phase::BeforeBegin, &context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(&context, None, e, deadline).await),
            Err(_) => {
                return Err(self
                    .fail(&context, None, TransactionError::Timeout(budget), deadline)
                    .await)
            }
        }

        let handle = match timeout_at(deadline, self.storage.begin(isolation)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.fail(&context, None, e.into(), deadline).await),
            Err(_) => {
                return Err(self
                    .fail(&context, None, TransactionError::Timeout(budget), deadline)
                    .await)
            }
        };

        match timeout_at(deadline, self.registry.for_phase(Phase::AfterBegin, &context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(&context, Some(&handle), e, deadline).await),
            Err(_) => {
                return Err(self
                    .fail(&context, Some(&handle), TransactionError::Timeout(budget), deadline)
                    .await)
            }
        }

        let session = Session::new(context.clone(), handle.clone());
        let value = match timeout_at(deadline, body(session)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(self.fail(&context, Some(&handle), e, deadline).await),
            Err(_) => {
                return Err(self
                    .fail(&context, Some(&handle), TransactionError::Timeout(budget), deadline)
                    .await)
            }
        };

        match timeout_at(deadline, self.registry.for_phase(Phase::BeforeCommit, &context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(&context, Some(&handle), e, deadline).await),
            Err(_) => {
                return Err(self
                    .fail(&context, Some(&handle), TransactionError::Timeout(budget), deadline)
                    .await)
            }
        }

        // Not cancellable: the outcome of an interrupted commit is unknown.
        if let Err(e) = self.storage.commit(&handle).await {
            error!(unit_id = %context.unit_id(), attempt, error = %e, "storage commit failed");
            return Err(self
                .fail(&context, Some(&handle), TransactionError::CommitFailed(e), deadline)
                .await);
        }

        // Storage is durable from here on; running out of time only cuts
        // after-commit work short.
        match timeout_at(deadline, self.registry.for_phase(Phase::AfterCommit, &context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(unit_id = %context.unit_id(), error = %e, "after-commit phase reported an error")
            }
            Err(_) => warn!(unit_id = %context.unit_id(), "after-commit phase exceeded the deadline"),
        }
        if timeout_at(deadline, context.notify_commit()).await.is_err() {
            warn!(unit_id = %context.unit_id(), "commit observers exceeded the deadline");
        }
        context.clear();
        Ok(value)
    }

    /// Failure path: compensations, ON_ROLLBACK, storage rollback,
    /// AFTER_ROLLBACK. Always hands back the error that triggered it.
    ///
    /// Everything but the storage rollback is cut off at `deadline`; work
    /// that is ready without waiting still runs once it has passed.
    async fn fail(
        &self,
        context: &TransactionContext,
        handle: Option<&S::Handle>,
        error: TransactionError,
        deadline: Instant,
    ) -> TransactionError {
        warn!(
            unit_id = %context.unit_id(),
            attempt = context.attempt(),
            error = %error,
            "unit of work failed, rolling back"
        );

        match timeout_at(deadline, context.run_compensations()).await {
            Ok(report) if !report.failed.is_empty() => warn!(
                unit_id = %context.unit_id(),
                failed = ?report.failed,
                "some compensations failed"
            ),
            Ok(_) => {}
            Err(_) => warn!(unit_id = %context.unit_id(), "compensations cut short by the deadline"),
        }

        match timeout_at(deadline, self.registry.for_phase(Phase::OnRollback, context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(unit_id = %context.unit_id(), error = %e, "on-rollback phase reported an error")
            }
            Err(_) => warn!(unit_id = %context.unit_id(), "on-rollback phase exceeded the deadline"),
        }

        if let Some(handle) = handle {
            match self.storage.rollback(handle).await {
                Ok(()) => debug!(unit_id = %context.unit_id(), "storage rolled back"),
                Err(StorageError::TransactionClosed) => {
                    debug!(unit_id = %context.unit_id(), "storage transaction already closed")
                }
                Err(e) => {
                    error!(unit_id = %context.unit_id(), error = %e, "storage rollback failed")
                }
            }
        }

        match timeout_at(deadline, self.registry.for_phase(Phase::AfterRollback, context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(unit_id = %context.unit_id(), error = %e, "after-rollback phase reported an error")
            }
            Err(_) => warn!(unit_id = %context.unit_id(), "after-rollback phase exceeded the deadline"),
        }
        if timeout_at(deadline, context.notify_rollback()).await.is_err() {
            warn!(unit_id = %context.unit_id(), "rollback observers exceeded the deadline");
        }
        context.clear();
        error
    }
}

/// Builder for [`TransactionCoordinator`].
pub struct CoordinatorBuilder<S: StorageProvider> {
    storage: S,
    registry: Option<Arc<AdapterRegistry>>,
    adapters: Vec<Arc<dyn Adapter>>,
    routing: EffectRouting,
    retry: RetryPolicy,
    timeout: Duration,
    attempt_timeout: Option<Duration>,
    isolation: Option<IsolationLevel>,
    deferral: Option<(Arc<dyn EffectTransport>, Arc<dyn DeduplicationStore>)>,
}

impl<S: StorageProvider> CoordinatorBuilder<S> {
    pub fn new(storage: S) -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            storage,
            registry: None,
            adapters: Vec::new(),
            routing: defaults.routing(),
            retry: defaults.retry.policy(),
            timeout: defaults.timeout(),
            attempt_timeout: defaults.attempt_timeout(),
            isolation: defaults.isolation,
            deferral: None,
        }
    }

    /// Applies timeouts, isolation, retry and effect routing from `config`.
    pub fn config(mut self, config: &CoordinatorConfig) -> Self {
        self.routing = config.routing();
        self.retry = config.retry.policy();
        self.timeout = config.timeout();
        self.attempt_timeout = config.attempt_timeout();
        self.isolation = config.isolation;
        self
    }

    /// Uses an existing registry, e.g. one shared with other coordinators.
    pub fn registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn routing(mut self, routing: EffectRouting) -> Self {
        self.routing = routing;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout);
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Registers an [`EventDeferralAdapter`] delivering through `transport`.
    pub fn event_deferral(
        mut self,
        transport: Arc<dyn EffectTransport>,
        dedup: Arc<dyn DeduplicationStore>,
    ) -> Self {
        self.deferral = Some((transport, dedup));
        self
    }

    pub fn build(self) -> TransactionCoordinator<S> {
        let registry = self.registry.unwrap_or_default();
        let routing = Arc::new(self.routing);

        if let Some((transport, dedup)) = self.deferral {
            registry.register(Arc::new(EventDeferralAdapter::new(
                transport,
                dedup,
                routing.clone(),
            )));
        }
        for adapter in self.adapters {
            registry.register(adapter);
        }

        TransactionCoordinator {
            storage: Arc::new(self.storage),
            registry,
            routing,
            retry: self.retry,
            timeout: self.timeout,
            attempt_timeout: self.attempt_timeout,
            isolation: self.isolation,
        }
    }
}
