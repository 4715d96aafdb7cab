//! Per-unit-of-work state.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compensation::{run_compensations, Compensation, CompensationReport};
use crate::{DeliveryMode, EffectRouting, PendingEffect, TransactionAware, TransactionResult};

#[derive(Default)]
struct ContextState {
    effects: Vec<PendingEffect>,
    compensations: Vec<Compensation>,
    observers: Vec<Arc<dyn TransactionAware>>,
}

/// Mutable state owned by exactly one unit of work.
///
/// Holds the queue of pending effects, the compensation stack, and the
/// observers interested in this unit's outcome. The context is cheap to clone
/// so it can be handed to the body and to adapters, but every clone refers to
/// the same unit of work and it is never shared across units.
#[derive(Clone)]
pub struct TransactionContext {
    unit_id: Uuid,
    attempt: u32,
    routing: Arc<EffectRouting>,
    state: Arc<Mutex<ContextState>>,
}

impl TransactionContext {
    pub fn new(attempt: u32, routing: Arc<EffectRouting>) -> Self {
        Self {
            unit_id: Uuid::new_v4(),
            attempt,
            routing,
            state: Arc::new(Mutex::new(ContextState::default())),
        }
    }

    /// Identifier of this attempt's context, for log correlation.
    pub fn unit_id(&self) -> Uuid {
        self.unit_id
    }

    /// 1-based attempt number this context belongs to.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn routing(&self) -> &EffectRouting {
        &self.routing
    }

    /// Queues an effect using the delivery mode configured for its type.
    pub fn publish(&self, effect: PendingEffect) {
        let mode = self.routing.mode_for(&effect.effect_type);
        self.queue_effect(effect, mode);
    }

    /// Queues an effect with an explicit delivery mode.
    pub fn queue_effect(&self, mut effect: PendingEffect, mode: DeliveryMode) {
        effect.mode = mode;
        debug!(
            unit_id = %self.unit_id,
            effect_id = %effect.effect_id,
            effect_type = %effect.effect_type,
            ?mode,
            "effect queued"
        );
        self.state.lock().effects.push(effect);
    }

    /// Removes and returns the effects queued with `mode`, in queue order.
    /// Effects queued with the other mode stay where they are.
    pub fn drain_effects(&self, mode: DeliveryMode) -> Vec<PendingEffect> {
        let mut state = self.state.lock();
        let (drained, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.effects)
            .into_iter()
            .partition(|e| e.mode == mode);
        state.effects = kept;
        drained
    }

    /// Removes and returns every queued effect regardless of mode.
    pub fn drain_all_effects(&self) -> Vec<PendingEffect> {
        std::mem::take(&mut self.state.lock().effects)
    }

    /// Drops every queued effect; returns how many were dropped.
    pub fn discard_effects(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.effects.len();
        state.effects.clear();
        count
    }

    pub fn pending_effects(&self, mode: DeliveryMode) -> usize {
        self.state
            .lock()
            .effects
            .iter()
            .filter(|e| e.mode == mode)
            .count()
    }

    /// Pushes a compensation onto the stack.
    pub fn register_compensation<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransactionResult<()>> + Send + 'static,
    {
        let compensation = Compensation::new(name, action);
        debug!(unit_id = %self.unit_id, compensation = %compensation.name(), "compensation registered");
        self.state.lock().compensations.push(compensation);
    }

    pub fn compensation_count(&self) -> usize {
        self.state.lock().compensations.len()
    }

    /// Drains the compensation stack and runs it most-recent-first.
    pub async fn run_compensations(&self) -> CompensationReport {
        let stack = std::mem::take(&mut self.state.lock().compensations);
        run_compensations(stack).await
    }

    /// Registers an observer for this unit's outcome.
    pub fn register_transaction_aware(&self, observer: Arc<dyn TransactionAware>) {
        self.state.lock().observers.push(observer);
    }

    pub(crate) async fn notify_commit(&self) {
        let observers = std::mem::take(&mut self.state.lock().observers);
        for observer in observers.iter() {
            if let Err(e) = observer.on_commit().await {
                warn!(unit_id = %self.unit_id, error = %e, "observer failed on commit");
            }
        }
    }

    pub(crate) async fn notify_rollback(&self) {
        let observers = std::mem::take(&mut self.state.lock().observers);
        for observer in observers.iter() {
            if let Err(e) = observer.on_rollback().await {
                warn!(unit_id = %self.unit_id, error = %e, "observer failed on rollback");
            }
        }
    }

    /// Clears every queue. Called once the unit of work reached a terminal phase.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.effects.clear();
        state.compensations.clear();
        state.observers.clear();
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionContext")
            .field("unit_id", &self.unit_id)
            .field("attempt", &self.attempt)
            .field("effects", &state.effects.len())
            .field("compensations", &state.compensations.len())
            .finish()
    }
}

/// What the body of a unit of work receives: the context plus the storage
/// handle of the open transaction.
#[derive(Clone, Debug)]
pub struct Session<H> {
    context: TransactionContext,
    handle: H,
}

impl<H> Session<H> {
    pub(crate) fn new(context: TransactionContext, handle: H) -> Self {
        Self { context, handle }
    }

    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    /// Handle of the storage transaction, exclusive to this unit of work.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn publish(&self, effect: PendingEffect) {
        self.context.publish(effect);
    }

    pub fn compensate<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransactionResult<()>> + Send + 'static,
    {
        self.context.register_compensation(name, action);
    }
}
