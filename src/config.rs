//! Typed coordinator configuration.
//!
//! Loading it from files or the environment is left to the application; the
//! structs deserialize from any serde format.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DeliveryMode, EffectRouting, IsolationLevel, RetryPolicy};

/// Configuration for a [`TransactionCoordinator`](crate::TransactionCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Budget across all attempts of one `run` call (ms).
    /// Default: 30000
    pub timeout_ms: u64,
    /// Budget for a single attempt (ms). Unset means only the overall budget applies.
    pub attempt_timeout_ms: Option<u64>,
    /// Isolation hint passed to storage when a run does not set one.
    pub isolation: Option<IsolationLevel>,
    pub retry: RetryConfig,
    /// Mode for effect types without an entry in `effects`.
    /// Default: before_commit
    pub default_delivery_mode: DeliveryMode,
    /// Per-effect-type delivery settings.
    pub effects: HashMap<String, EffectRouteConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            attempt_timeout_ms: None,
            isolation: None,
            retry: RetryConfig::default(),
            default_delivery_mode: DeliveryMode::BeforeCommit,
            effects: HashMap::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn routing(&self) -> EffectRouting {
        let mut routing = EffectRouting::new().with_default_mode(self.default_delivery_mode);
        for (effect_type, route) in &self.effects {
            routing.set(
                effect_type.clone(),
                route.mode,
                route.delivery_timeout_ms.map(Duration::from_millis),
            );
        }
        routing
    }
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default: 3
    pub max_attempts: u32,
    /// Default: 10
    pub base_delay_ms: u64,
    /// Default: 1000
    pub max_delay_ms: u64,
    /// Default: true
    pub jitter: bool,
    /// Default: false
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
            jitter: true,
            retry_on_timeout: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
            .with_jitter(self.jitter)
            .with_retry_on_timeout(self.retry_on_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectRouteConfig {
    pub mode: DeliveryMode,
    #[serde(default)]
    pub delivery_timeout_ms: Option<u64>,
}
