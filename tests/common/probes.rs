use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use unit_of_work_coordinator::{
    Adapter, EffectTransport, PendingEffect, Phase, TransactionContext, TransactionError,
    TransactionResult,
};

/// Transport that records delivered effect ids in order.
#[derive(Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<String>>,
    reject_types: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }

    /// Fails every delivery of `effect_type`.
    pub fn reject(&self, effect_type: &str) {
        self.reject_types.lock().push(effect_type.to_string());
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl EffectTransport for RecordingTransport {
    async fn deliver(&self, effect: &PendingEffect) -> TransactionResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_types.lock().contains(&effect.effect_type) {
            return Err(TransactionError::body(format!(
                "transport rejected {}",
                effect.effect_type
            )));
        }
        self.delivered.lock().push(effect.effect_id.clone());
        Ok(())
    }
}

/// Adapter that records every phase it sees, optionally failing in one.
pub struct PhaseRecorder {
    name: String,
    priority: i32,
    critical: bool,
    fail_on: Option<Phase>,
    phases: Mutex<Vec<Phase>>,
    shared_log: Option<Arc<Mutex<Vec<String>>>>,
}

impl PhaseRecorder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: 0,
            critical: false,
            fail_on: None,
            phases: Mutex::new(Vec::new()),
            shared_log: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn fail_on(mut self, phase: Phase) -> Self {
        self.fail_on = Some(phase);
        self
    }

    /// Also appends `name:PHASE` entries to a log shared between recorders.
    pub fn log_to(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.shared_log = Some(log);
        self
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.phases.lock().clone()
    }
}

#[async_trait]
impl Adapter for PhaseRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    async fn on_phase(&self, phase: Phase, _context: &TransactionContext) -> TransactionResult<()> {
        self.phases.lock().push(phase);
        if let Some(log) = &self.shared_log {
            log.lock().push(format!("{}:{}", self.name, phase));
        }
        if self.fail_on == Some(phase) {
            return Err(TransactionError::body(format!("{} refused {}", self.name, phase)));
        }
        Ok(())
    }
}
