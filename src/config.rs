//! Relay configuration.
//!
//! Loaded from JSON. Every section has defaults, so a config file only needs
//! to list what differs from them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::outbound::OutboundTarget;
use crate::subscription::SubscriptionDescriptor;
use crate::transform::AdapterSpec;
use crate::validation::ValidationPolicy;

/// Serializes a [`Duration`] as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serializes a [`Duration`] as milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::time::millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Health sweep and re-establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Time between health sweeps.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Missed heartbeats tolerated before a subscription is unhealthy.
    pub healthcheck_factor: u32,
    /// Workers running terminate/subscribe handshakes.
    pub restart_workers: usize,
    /// Queued handshakes before new ones are dropped until the next sweep.
    pub restart_queue_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            healthcheck_factor: crate::subscription::HEALTHCHECK_FACTOR,
            restart_workers: 2,
            restart_queue_capacity: 256,
        }
    }
}

/// Push delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Largest chunk for targets that are not scoped to a dataset.
    pub max_elements_per_delivery: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Per-chunk send timeout.
    #[serde(with = "duration_millis")]
    pub delivery_timeout: Duration,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_elements_per_delivery: 1000,
            workers: 4,
            queue_capacity: 1024,
            delivery_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Upstream calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(10_000),
        }
    }
}

/// In-memory store layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub shards: usize,
    /// Change cursors idle for longer than this are dropped.
    #[serde(with = "duration_secs")]
    pub cursor_idle_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: crate::storage::DEFAULT_SHARDS,
            cursor_idle_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub health: HealthConfig,
    pub outbound: OutboundConfig,
    pub upstream: UpstreamConfig,
    pub store: StoreConfig,
    /// What to do with inbound records that break a validation rule.
    pub validation: ValidationPolicy,
    /// Named transformation chains that subscriptions can reference.
    pub presets: std::collections::BTreeMap<String, Vec<AdapterSpec>>,
    pub subscriptions: Vec<SubscriptionDescriptor>,
    pub targets: Vec<OutboundTarget>,
}

impl RelayConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    /// Checks numeric bounds and every descriptor and target.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.health.healthcheck_factor == 0 {
            return Err(invalid("health.healthcheck_factor", "must be at least 1"));
        }
        if self.health.sweep_interval.is_zero() {
            return Err(invalid("health.sweep_interval", "must be positive"));
        }
        if self.outbound.max_elements_per_delivery == 0 {
            return Err(invalid("outbound.max_elements_per_delivery", "must be at least 1"));
        }
        if self.outbound.delivery_timeout.is_zero() {
            return Err(invalid("outbound.delivery_timeout", "must be positive"));
        }
        if self.upstream.request_timeout.is_zero() {
            return Err(invalid("upstream.request_timeout", "must be positive"));
        }

        let mut seen = std::collections::HashSet::new();
        for descriptor in &self.subscriptions {
            descriptor.validate()?;
            if !seen.insert(descriptor.subscription_id.as_str()) {
                return Err(invalid(
                    "subscriptions",
                    &format!("duplicate subscription id '{}'", descriptor.subscription_id),
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !seen.insert(target.id.as_str()) {
                return Err(invalid("targets", &format!("duplicate target id '{}'", target.id)));
            }
        }
        Ok(self)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
