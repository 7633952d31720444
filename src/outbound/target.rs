//! Push consumer configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{DataKind, IdPolicy};

use super::filter::ContentFilter;

/// How bytes reach a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelPolicy {
    /// Synchronous request/response per chunk.
    #[default]
    RequestResponse,
    /// Fire-and-forget publish to a topic.
    Publish,
}

fn all_kinds() -> Vec<DataKind> {
    DataKind::ALL.to_vec()
}

/// One push consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTarget {
    pub id: String,
    pub address: String,
    /// Restricts deliveries to one dataset. Dataset-scoped targets always
    /// receive a single, unsplit chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub filter: ContentFilter,
    #[serde(default = "all_kinds")]
    pub kinds: Vec<DataKind>,
    /// Overrides the relay-wide chunk size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_elements_per_delivery: Option<usize>,
    #[serde(default)]
    pub id_policy: IdPolicy,
    #[serde(default)]
    pub channel_policy: ChannelPolicy,
}

impl OutboundTarget {
    /// A target receiving every kind from every dataset.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            dataset_id: None,
            filter: ContentFilter::default(),
            kinds: all_kinds(),
            max_elements_per_delivery: None,
            id_policy: IdPolicy::default(),
            channel_policy: ChannelPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_dataset(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_kinds(mut self, kinds: Vec<DataKind>) -> Self {
        self.kinds = kinds;
        self
    }

    #[must_use]
    pub fn with_max_elements(mut self, max: usize) -> Self {
        self.max_elements_per_delivery = Some(max);
        self
    }

    #[must_use]
    pub fn with_id_policy(mut self, policy: IdPolicy) -> Self {
        self.id_policy = policy;
        self
    }

    #[must_use]
    pub fn with_channel_policy(mut self, policy: ChannelPolicy) -> Self {
        self.channel_policy = policy;
        self
    }

    /// Cursor key under which this target reads the change feed.
    #[must_use]
    pub fn requestor_id(&self) -> String {
        format!("push:{}", self.id)
    }

    /// True if this target wants changes of `kind` in `dataset_id`.
    #[must_use]
    pub fn wants(&self, dataset_id: &str, kind: DataKind) -> bool {
        self.dataset_id.as_deref().map_or(true, |ds| ds == dataset_id) && self.kinds.contains(&kind)
    }

    /// Largest chunk this target accepts, given the relay default.
    #[must_use]
    pub fn chunk_limit(&self, default: usize) -> usize {
        if self.dataset_id.is_some() {
            return usize::MAX;
        }
        self.max_elements_per_delivery.unwrap_or(default).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "target.id".to_string(),
            });
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: format!("target '{}' address", self.id),
            });
        }
        if self.kinds.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "kinds".to_string(),
                reason: format!("target '{}' subscribes to no data kind", self.id),
            });
        }
        if self.max_elements_per_delivery == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_elements_per_delivery".to_string(),
                reason: format!("target '{}' must allow at least one element", self.id),
            });
        }
        Ok(())
    }
}
