//! Pending effects, their delivery routing, and the transport contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{TransactionError, TransactionResult};

/// When a queued effect becomes visible to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Delivered during BEFORE_COMMIT; a delivery failure rolls the unit of work back.
    #[default]
    BeforeCommit,
    /// Delivered during AFTER_COMMIT; a delivery failure is logged and isolated.
    AfterCommit,
}

/// An event or message waiting for its unit of work to reach a commit phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEffect {
    /// Stable identity used for deduplication across retries.
    pub effect_id: String,
    /// Routing key looked up in [`EffectRouting`].
    pub effect_type: String,
    pub payload: serde_json::Value,
    pub mode: DeliveryMode,
}

impl PendingEffect {
    /// Creates an effect with a fresh v4 id and the default delivery mode.
    pub fn new(effect_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            effect_id: Uuid::new_v4().to_string(),
            effect_type: effect_type.into(),
            payload,
            mode: DeliveryMode::default(),
        }
    }

    /// Overrides the generated id, e.g. with a business key that survives retries.
    pub fn with_id(mut self, effect_id: impl Into<String>) -> Self {
        self.effect_id = effect_id.into();
        self
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Delivery settings for one effect type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectRoute {
    pub mode: DeliveryMode,
    pub delivery_timeout: Option<Duration>,
}

/// Lookup table from effect type to delivery settings.
///
/// Unconfigured types fall back to the default mode, which is
/// [`DeliveryMode::BeforeCommit`] unless overridden.
#[derive(Debug, Clone, Default)]
pub struct EffectRouting {
    default_mode: DeliveryMode,
    routes: HashMap<String, EffectRoute>,
}

impl EffectRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_mode(mut self, mode: DeliveryMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn route(mut self, effect_type: impl Into<String>, mode: DeliveryMode) -> Self {
        self.set(effect_type, mode, None);
        self
    }

    pub fn route_with_timeout(
        mut self,
        effect_type: impl Into<String>,
        mode: DeliveryMode,
        delivery_timeout: Duration,
    ) -> Self {
        self.set(effect_type, mode, Some(delivery_timeout));
        self
    }

    pub fn set(
        &mut self,
        effect_type: impl Into<String>,
        mode: DeliveryMode,
        delivery_timeout: Option<Duration>,
    ) {
        self.routes.insert(
            effect_type.into(),
            EffectRoute {
                mode,
                delivery_timeout,
            },
        );
    }

    pub fn mode_for(&self, effect_type: &str) -> DeliveryMode {
        self.routes
            .get(effect_type)
            .map(|r| r.mode)
            .unwrap_or(self.default_mode)
    }

    pub fn delivery_timeout(&self, effect_type: &str) -> Option<Duration> {
        self.routes.get(effect_type).and_then(|r| r.delivery_timeout)
    }
}

/// Something that can make an effect visible to consumers: an in-process
/// bus, a broker bridge, a webhook sender.
#[async_trait]
pub trait EffectTransport: Send + Sync {
    async fn deliver(&self, effect: &PendingEffect) -> TransactionResult<()>;
}

/// In-process transport publishing effects on a tokio broadcast channel.
///
/// Delivery fails when nobody is subscribed, so a missing consumer is
/// reported instead of silently dropping the effect.
#[derive(Clone)]
pub struct BroadcastTransport {
    sender: broadcast::Sender<PendingEffect>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PendingEffect> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EffectTransport for BroadcastTransport {
    async fn deliver(&self, effect: &PendingEffect) -> TransactionResult<()> {
        self.sender
            .send(effect.clone())
            .map(|_| ())
            .map_err(|_| TransactionError::DeliveryFailure {
                effect_id: effect.effect_id.clone(),
                reason: "no active subscribers".to_string(),
            })
    }
}
