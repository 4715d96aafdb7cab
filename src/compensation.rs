//! Compensation actions and the engine that unwinds them.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::TransactionResult;

type CompensationFn = Box<dyn FnOnce() -> BoxFuture<'static, TransactionResult<()>> + Send>;

/// A named rollback action registered during a unit of work.
///
/// Actions should be idempotent where possible; they may run after a partial
/// failure in which the forward step only half happened.
pub struct Compensation {
    name: String,
    action: CompensationFn,
}

impl Compensation {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransactionResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn execute(self) -> TransactionResult<()> {
        (self.action)().await
    }
}

impl fmt::Debug for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Summary of one unwinding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Names in execution order.
    pub executed: Vec<String>,
    /// Names of actions that returned an error.
    pub failed: Vec<String>,
}

/// Runs compensations most-recent-first.
///
/// `stack` is in registration order. A failing action is logged and the
/// engine moves on to the next older one.
pub async fn run_compensations(stack: Vec<Compensation>) -> CompensationReport {
    let mut report = CompensationReport::default();
    if stack.is_empty() {
        return report;
    }
    debug!(count = stack.len(), "running compensations");

    for compensation in stack.into_iter().rev() {
        let name = compensation.name.clone();
        if let Err(e) = compensation.execute().await {
            warn!(compensation = %name, error = %e, "compensation failed, continuing");
            report.failed.push(name.clone());
        }
        report.executed.push(name);
    }
    report
}
