//! Holds published effects back until their unit of work reaches the commit
//! phases, then hands them to the transport in queue order.
//!
//! - BEFORE_COMMIT: before-commit effects are delivered one by one; the first
//!   failure is returned and, since the adapter is critical, rolls the unit
//!   of work back.
//! - AFTER_COMMIT: everything still queued is delivered; failures are logged
//!   per effect and never touch committed storage.
//! - ON_ROLLBACK: every queued effect is discarded.
//!
//! Each delivery first claims its effect id in the [`DeduplicationStore`],
//! so concurrent units of work publishing the same id reach the transport
//! once. The claim becomes a delivery record on success and is released on
//! failure.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    Adapter, DeduplicationStore, DeliveryMode, EffectRouting, EffectTransport, PendingEffect,
    Phase, TransactionContext, TransactionError, TransactionResult,
};

/// Runs after every adapter that might still queue effects in the same phase.
pub const EVENT_DEFERRAL_PRIORITY: i32 = -1000;

pub struct EventDeferralAdapter {
    transport: Arc<dyn EffectTransport>,
    dedup: Arc<dyn DeduplicationStore>,
    routing: Arc<EffectRouting>,
    priority: i32,
}

impl EventDeferralAdapter {
    pub fn new(
        transport: Arc<dyn EffectTransport>,
        dedup: Arc<dyn DeduplicationStore>,
        routing: Arc<EffectRouting>,
    ) -> Self {
        Self {
            transport,
            dedup,
            routing,
            priority: EVENT_DEFERRAL_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delivers one effect unless it already went out.
    ///
    /// Returns `Ok(false)` when the effect was skipped because another
    /// delivery of the same id already happened or is in flight.
    pub async fn deliver(&self, effect: &PendingEffect) -> TransactionResult<bool> {
        if !self.dedup.try_claim(&effect.effect_id).await? {
            debug!(effect_id = %effect.effect_id, "effect already delivered or claimed, skipping");
            return Ok(false);
        }

        let claim = Claim::new(self.dedup.clone(), &effect.effect_id);
        if let Err(e) = self.send(effect).await {
            claim.disarm();
            if let Err(release) = self.dedup.release(&effect.effect_id).await {
                warn!(effect_id = %effect.effect_id, error = %release, "failed to release delivery claim");
            }
            return Err(e);
        }
        claim.disarm();

        self.dedup.mark_delivered(&effect.effect_id).await?;
        debug!(
            effect_id = %effect.effect_id,
            effect_type = %effect.effect_type,
            mode = ?effect.mode,
            "effect delivered"
        );
        Ok(true)
    }

    async fn send(&self, effect: &PendingEffect) -> TransactionResult<()> {
        let delivery = self.transport.deliver(effect);
        let outcome = match self.routing.delivery_timeout(&effect.effect_type) {
            Some(limit) => match tokio::time::timeout(limit, delivery).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransactionError::DeliveryFailure {
                    effect_id: effect.effect_id.clone(),
                    reason: format!("delivery timed out after {limit:?}"),
                }),
            },
            None => delivery.await,
        };

        outcome.map_err(|e| match e {
            e @ TransactionError::DeliveryFailure { .. } => e,
            other => TransactionError::DeliveryFailure {
                effect_id: effect.effect_id.clone(),
                reason: other.to_string(),
            },
        })
    }

    async fn flush_before_commit(&self, context: &TransactionContext) -> TransactionResult<()> {
        for effect in context.drain_effects(DeliveryMode::BeforeCommit) {
            self.deliver(&effect).await?;
        }
        Ok(())
    }

    async fn flush_after_commit(&self, context: &TransactionContext) {
        for effect in context.drain_all_effects() {
            if let Err(e) = self.deliver(&effect).await {
                warn!(
                    unit_id = %context.unit_id(),
                    effect_id = %effect.effect_id,
                    effect_type = %effect.effect_type,
                    error = %e,
                    "after-commit delivery failed"
                );
            }
        }
    }
}

/// Releases a delivery claim if the delivery future is dropped mid-flight,
/// e.g. when the unit of work hits its deadline.
struct Claim {
    dedup: Arc<dyn DeduplicationStore>,
    effect_id: Option<String>,
}

impl Claim {
    fn new(dedup: Arc<dyn DeduplicationStore>, effect_id: &str) -> Self {
        Self {
            dedup,
            effect_id: Some(effect_id.to_string()),
        }
    }

    fn disarm(mut self) {
        self.effect_id = None;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let Some(effect_id) = self.effect_id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(effect_id = %effect_id, "delivery cancelled outside a runtime, claim left in place");
            return;
        };
        let dedup = self.dedup.clone();
        runtime.spawn(async move {
            if let Err(e) = dedup.release(&effect_id).await {
                warn!(effect_id = %effect_id, error = %e, "failed to release cancelled delivery claim");
            }
        });
    }
}

#[async_trait]
impl Adapter for EventDeferralAdapter {
    fn name(&self) -> &str {
        "event-deferral"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn on_phase(&self, phase: Phase, context: &TransactionContext) -> TransactionResult<()> {
        match phase {
            Phase::BeforeCommit => self.flush_before_commit(context).await,
            Phase::AfterCommit => {
                self.flush_after_commit(context).await;
                Ok(())
            }
            Phase::OnRollback => {
                let discarded = context.discard_effects();
                if discarded > 0 {
                    debug!(unit_id = %context.unit_id(), discarded, "discarded queued effects");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryDeduplicationStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<String>>,
        reject: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EffectTransport for Recorder {
        async fn deliver(&self, effect: &PendingEffect) -> TransactionResult<()> {
            if effect.effect_type == "Slow" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.reject.lock().contains(&effect.effect_id) {
                return Err(TransactionError::body("broker unavailable"));
            }
            self.delivered.lock().push(effect.effect_id.clone());
            Ok(())
        }
    }

    fn setup(routing: EffectRouting) -> (Arc<Recorder>, EventDeferralAdapter, TransactionContext) {
        let recorder = Arc::new(Recorder::default());
        let routing = Arc::new(routing);
        let adapter = EventDeferralAdapter::new(
            recorder.clone(),
            Arc::new(InMemoryDeduplicationStore::new()),
            routing.clone(),
        );
        (recorder, adapter, TransactionContext::new(1, routing))
    }

    #[tokio::test]
    async fn before_commit_flush_leaves_deferred_effects_queued() {
        let (recorder, adapter, ctx) =
            setup(EffectRouting::new().route("Notify", DeliveryMode::AfterCommit));
        ctx.publish(PendingEffect::new("Placed", json!(1)).with_id("e1"));
        ctx.publish(PendingEffect::new("Notify", json!(2)).with_id("e2"));
        ctx.publish(PendingEffect::new("Paid", json!(3)).with_id("e3"));

        adapter.on_phase(Phase::BeforeCommit, &ctx).await.unwrap();
        assert_eq!(*recorder.delivered.lock(), vec!["e1", "e3"]);

        adapter.on_phase(Phase::AfterCommit, &ctx).await.unwrap();
        assert_eq!(*recorder.delivered.lock(), vec!["e1", "e3", "e2"]);
    }

    #[tokio::test]
    async fn before_commit_failure_is_reported() {
        let (recorder, adapter, ctx) = setup(EffectRouting::new());
        recorder.reject.lock().push("bad".into());
        ctx.publish(PendingEffect::new("Placed", json!(1)).with_id("bad"));

        let err = adapter.on_phase(Phase::BeforeCommit, &ctx).await.unwrap_err();
        assert!(matches!(err, TransactionError::DeliveryFailure { ref effect_id, .. } if effect_id == "bad"));
    }

    #[tokio::test]
    async fn after_commit_failures_are_isolated() {
        let (recorder, adapter, ctx) =
            setup(EffectRouting::new().with_default_mode(DeliveryMode::AfterCommit));
        recorder.reject.lock().push("e1".into());
        ctx.publish(PendingEffect::new("A", json!(1)).with_id("e1"));
        ctx.publish(PendingEffect::new("B", json!(2)).with_id("e2"));

        adapter.on_phase(Phase::AfterCommit, &ctx).await.unwrap();
        assert_eq!(*recorder.delivered.lock(), vec!["e2"]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_delivered_once() {
        let (recorder, adapter, ctx) = setup(EffectRouting::new());
        let effect = PendingEffect::new("Placed", json!(1)).with_id("same");
        assert!(adapter.deliver(&effect).await.unwrap());
        assert!(!adapter.deliver(&effect).await.unwrap());

        ctx.publish(effect.clone());
        adapter.on_phase(Phase::BeforeCommit, &ctx).await.unwrap();
        assert_eq!(recorder.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_releases_its_claim() {
        let (recorder, adapter, _ctx) = setup(EffectRouting::new());
        let effect = PendingEffect::new("Placed", json!(1)).with_id("flaky");
        recorder.reject.lock().push("flaky".into());
        assert!(adapter.deliver(&effect).await.is_err());

        recorder.reject.lock().clear();
        assert!(adapter.deliver(&effect).await.unwrap());
        assert_eq!(*recorder.delivered.lock(), vec!["flaky"]);
    }

    #[tokio::test]
    async fn cancelled_delivery_releases_its_claim() {
        let (recorder, adapter, _ctx) = setup(EffectRouting::new());
        let slow = PendingEffect::new("Slow", json!(1)).with_id("cut-short");
        let cut = tokio::time::timeout(Duration::from_millis(20), adapter.deliver(&slow)).await;
        assert!(cut.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let retried = PendingEffect::new("Placed", json!(1)).with_id("cut-short");
        assert!(adapter.deliver(&retried).await.unwrap());
        assert_eq!(*recorder.delivered.lock(), vec!["cut-short"]);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let (recorder, adapter, ctx) =
            setup(EffectRouting::new().route("Notify", DeliveryMode::AfterCommit));
        ctx.publish(PendingEffect::new("Placed", json!(1)));
        ctx.publish(PendingEffect::new("Notify", json!(2)));

        adapter.on_phase(Phase::OnRollback, &ctx).await.unwrap();
        adapter.on_phase(Phase::AfterCommit, &ctx).await.unwrap();
        assert!(recorder.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn slow_delivery_times_out() {
        let (_recorder, adapter, _ctx) = setup(EffectRouting::new().route_with_timeout(
            "Slow",
            DeliveryMode::BeforeCommit,
            Duration::from_millis(20),
        ));
        let effect = PendingEffect::new("Slow", json!(null));
        let err = adapter.deliver(&effect).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DeliveryFailure);
    }
}
