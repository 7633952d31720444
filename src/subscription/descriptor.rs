//! Upstream subscription configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_secs;
use crate::error::ConfigError;
use crate::model::DataKind;
use crate::transform::AdapterSpec;

/// How data arrives from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionMode {
    /// The provider pushes updates after a subscribe handshake.
    Subscribe,
    /// The relay polls the provider on every heartbeat.
    RequestResponse,
}

/// The kinds of upstream request a descriptor can carry an endpoint for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    Subscribe,
    CheckStatus,
    Delete,
    Fetch,
}

impl fmt::Display for RequestPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subscribe => "subscribe",
            Self::CheckStatus => "check_status",
            Self::Delete => "delete",
            Self::Fetch => "fetch",
        })
    }
}

fn default_active() -> bool {
    true
}

/// One configured upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub subscription_id: String,
    #[serde(default)]
    pub internal_id: u64,
    /// Provider name, for logs and stats.
    #[serde(default)]
    pub vendor: String,
    pub dataset_id: String,
    pub kind: DataKind,
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub endpoints: BTreeMap<RequestPurpose, String>,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_secs")]
    pub subscription_duration: Duration,
    /// Administrative switch; inactive descriptors are never (re)established.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Ingest-time transformation chain.
    #[serde(default)]
    pub transforms: Vec<AdapterSpec>,
}

impl SubscriptionDescriptor {
    pub fn builder(
        subscription_id: impl Into<String>,
        dataset_id: impl Into<String>,
        kind: DataKind,
    ) -> SubscriptionDescriptorBuilder {
        SubscriptionDescriptorBuilder::new(subscription_id.into(), dataset_id.into(), kind)
    }

    /// The endpoint for `purpose`, or a configuration fault naming it.
    pub fn endpoint(&self, purpose: RequestPurpose) -> Result<&str, ConfigError> {
        self.endpoints
            .get(&purpose)
            .map(String::as_str)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEndpoint {
                id: self.subscription_id.clone(),
                purpose,
            })
    }

    #[must_use]
    pub fn has_endpoint(&self, purpose: RequestPurpose) -> bool {
        self.endpoint(purpose).is_ok()
    }

    /// Endpoints a descriptor cannot work without.
    #[must_use]
    pub fn required_purposes(&self) -> &'static [RequestPurpose] {
        match self.mode {
            SubscriptionMode::Subscribe => &[RequestPurpose::Subscribe],
            SubscriptionMode::RequestResponse => &[RequestPurpose::Fetch],
        }
    }

    /// Rejects descriptors that could never run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "subscription_id".to_string(),
            });
        }
        if self.dataset_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "dataset_id".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval".to_string(),
                reason: format!("subscription '{}' needs a positive heartbeat", self.subscription_id),
            });
        }
        for purpose in self.required_purposes() {
            self.endpoint(*purpose)?;
        }
        Ok(())
    }
}

/// Builder for [`SubscriptionDescriptor`]; `build` validates.
#[derive(Debug)]
pub struct SubscriptionDescriptorBuilder {
    inner: SubscriptionDescriptor,
}

impl SubscriptionDescriptorBuilder {
    fn new(subscription_id: String, dataset_id: String, kind: DataKind) -> Self {
        Self {
            inner: SubscriptionDescriptor {
                subscription_id,
                internal_id: 0,
                vendor: String::new(),
                dataset_id,
                kind,
                mode: SubscriptionMode::RequestResponse,
                endpoints: BTreeMap::new(),
                heartbeat_interval: Duration::from_secs(60),
                subscription_duration: Duration::from_secs(24 * 60 * 60),
                active: true,
                transforms: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn internal_id(mut self, internal_id: u64) -> Self {
        self.inner.internal_id = internal_id;
        self
    }

    #[must_use]
    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.inner.vendor = vendor.into();
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: SubscriptionMode) -> Self {
        self.inner.mode = mode;
        self
    }

    #[must_use]
    pub fn endpoint(mut self, purpose: RequestPurpose, url: impl Into<String>) -> Self {
        self.inner.endpoints.insert(purpose, url.into());
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.inner.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn subscription_duration(mut self, duration: Duration) -> Self {
        self.inner.subscription_duration = duration;
        self
    }

    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.inner.active = active;
        self
    }

    #[must_use]
    pub fn transform(mut self, spec: AdapterSpec) -> Self {
        self.inner.transforms.push(spec);
        self
    }

    pub fn build(self) -> Result<SubscriptionDescriptor, ConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}
