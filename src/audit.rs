use async_trait::async_trait;
use tracing::info;

use crate::{Adapter, DeliveryMode, Phase, TransactionContext, TransactionResult};

/// Logs every phase transition of every unit of work.
///
/// Runs first in each phase and never fails, so it also records phases that a
/// later adapter aborts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditAdapter;

#[async_trait]
impl Adapter for AuditAdapter {
    fn name(&self) -> &str {
        "audit"
    }

    fn priority(&self) -> i32 {
        i32::MAX
    }

    async fn on_phase(&self, phase: Phase, context: &TransactionContext) -> TransactionResult<()> {
        info!(
            target: "unit_of_work::audit",
            unit_id = %context.unit_id(),
            attempt = context.attempt(),
            %phase,
            before_commit_effects = context.pending_effects(DeliveryMode::BeforeCommit),
            after_commit_effects = context.pending_effects(DeliveryMode::AfterCommit),
            compensations = context.compensation_count(),
            "unit of work phase"
        );
        Ok(())
    }
}
