use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::{Phase, TransactionContext, TransactionError, TransactionResult};

/// A concern that hangs off the lifecycle of every unit of work:
/// persistence bookkeeping, event delivery, cache invalidation, auditing.
///
/// Adapters are registered once with an [`AdapterRegistry`] and invoked for
/// every phase of every unit of work. They may mutate the context they are
/// handed, e.g. to queue effects or push compensations.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Identity used in logs and by [`AdapterRegistry::unregister_by_name`].
    fn name(&self) -> &str;

    /// Higher runs first within a phase.
    fn priority(&self) -> i32 {
        0
    }

    /// A critical adapter failing in BEFORE_COMMIT forces a rollback.
    /// In every other phase its failure is logged like any other adapter's.
    fn is_critical(&self) -> bool {
        false
    }

    async fn on_phase(&self, phase: Phase, context: &TransactionContext) -> TransactionResult<()>;
}

fn same_adapter(a: &Arc<dyn Adapter>, b: &Arc<dyn Adapter>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Adapters ordered by descending priority, insertion order among equals.
///
/// Registration normally happens at startup; lookups from in-flight units of
/// work take a snapshot under a read lock and never hold it across an await.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<Vec<Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter. Registering the same instance twice is a no-op.
    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        let mut adapters = self.adapters.write();
        if adapters.iter().any(|a| same_adapter(a, &adapter)) {
            debug!(adapter = adapter.name(), "adapter already registered");
            return;
        }
        let priority = adapter.priority();
        let position = adapters
            .iter()
            .position(|a| a.priority() < priority)
            .unwrap_or(adapters.len());
        debug!(
            adapter = adapter.name(),
            priority,
            critical = adapter.is_critical(),
            "adapter registered"
        );
        adapters.insert(position, adapter);
    }

    /// Removes this exact instance. Returns whether it was registered.
    pub fn unregister(&self, adapter: &Arc<dyn Adapter>) -> bool {
        let mut adapters = self.adapters.write();
        let before = adapters.len();
        adapters.retain(|a| !same_adapter(a, adapter));
        before != adapters.len()
    }

    /// Removes every adapter carrying `name`. Returns how many were removed.
    pub fn unregister_by_name(&self, name: &str) -> usize {
        let mut adapters = self.adapters.write();
        let before = adapters.len();
        adapters.retain(|a| a.name() != name);
        before - adapters.len()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Runs every adapter for `phase`, highest priority first.
    ///
    /// Failures are logged and swallowed, except a critical adapter failing
    /// in BEFORE_COMMIT: that stops the phase and is returned as
    /// [`TransactionError::AdapterRejected`].
    pub async fn for_phase(&self, phase: Phase, context: &TransactionContext) -> TransactionResult<()> {
        let adapters = self.adapters.read().clone();

        for adapter in adapters.iter() {
            let Err(e) = adapter.on_phase(phase, context).await else {
                continue;
            };
            if adapter.is_critical() && phase == Phase::BeforeCommit {
                error!(
                    adapter = adapter.name(),
                    %phase,
                    unit_id = %context.unit_id(),
                    error = %e,
                    "critical adapter failed, forcing rollback"
                );
                return Err(TransactionError::AdapterRejected {
                    adapter: adapter.name().to_string(),
                    phase,
                    source: Box::new(e),
                });
            }
            warn!(
                adapter = adapter.name(),
                %phase,
                unit_id = %context.unit_id(),
                error = %e,
                "adapter failed, continuing"
            );
        }
        Ok(())
    }
}
