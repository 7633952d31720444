//! Error types for transit-relay.
//!
//! All errors are strongly typed using thiserror. Each subsystem owns a
//! narrow enum and the top-level [`RelayError`] folds them together so callers
//! can either match precisely or just propagate with `?`.

use thiserror::Error;

use crate::storage::StorageError;
use crate::subscription::{RequestPurpose, SubscriptionPhase};

/// Errors raised by subscription registry transitions.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Subscription already exists ({phase}): {id}")]
    AlreadyExists {
        id: String,
        phase: SubscriptionPhase,
    },

    #[error("Subscription not found: {id}")]
    NotFound {
        id: String,
    },
}

/// Malformed configuration: descriptors, targets or transformation chains.
///
/// These surface when a subscription or target is created and the offending
/// item is never registered.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Subscription '{id}' has no endpoint for {purpose}")]
    MissingEndpoint {
        id: String,
        purpose: RequestPurpose,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        field: String,
        reason: String,
    },

    #[error("Unknown transformation preset '{name}'")]
    UnknownPreset {
        name: String,
    },

    #[error("Failed to read configuration from {path}: {message}")]
    Io {
        path: String,
        message: String,
    },

    #[error("Failed to parse configuration: {message}")]
    Parse {
        message: String,
    },
}

/// Downstream delivery failures.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Recipient unreachable at {address}: {message}")]
    Unreachable {
        address: String,
        message: String,
    },

    #[error("Delivery to {address} timed out after {duration_ms}ms")]
    Timeout {
        address: String,
        duration_ms: u64,
    },

    #[error("Transport error for {address}: {message}")]
    Transport {
        address: String,
        message: String,
    },

    #[error("Failed to encode payload: {message}")]
    Encoding {
        message: String,
    },

    #[error("Unknown outbound target: {id}")]
    UnknownTarget {
        id: String,
    },

    #[error("Delivery queue full (capacity: {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Delivery worker disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

/// Upstream (provider-facing) call failures.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream unreachable at {endpoint}: {message}")]
    Unreachable {
        endpoint: String,
        message: String,
    },

    #[error("Upstream call to {endpoint} timed out after {duration_ms}ms")]
    Timeout {
        endpoint: String,
        duration_ms: u64,
    },

    #[error("Upstream {endpoint} rejected request with status {status}")]
    Rejected {
        endpoint: String,
        status: u16,
    },

    #[error("Upstream transport error for {endpoint}: {message}")]
    Transport {
        endpoint: String,
        message: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DeliveryError {
    /// Connection refused/reset style failures. Expected when consumers go away.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// Timeouts and transport-level errors other than connection refusal.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }
}

impl UpstreamError {
    /// Connection refused/reset style failures.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// Timeouts and transport-level errors; the next scheduled cycle retries.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }
}

/// Top-level error type for transit-relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RelayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration fault.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if the failure is an unreachable endpoint, upstream or downstream.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        match self {
            Self::Delivery(e) => e.is_unreachable(),
            Self::Upstream(e) => e.is_unreachable(),
            _ => false,
        }
    }

    /// Returns true if this error is worth retrying on the next cycle.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Registry(_) | Self::Config(_) | Self::Internal { .. } => false,
            Self::Delivery(e) => e.is_unreachable() || e.is_transient(),
            Self::Upstream(e) => e.is_unreachable() || e.is_transient(),
            Self::Storage(e) => matches!(e, StorageError::Connection(_)),
        }
    }
}

/// Result type alias for transit-relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_exists_mentions_phase() {
        let err = RegistryError::AlreadyExists {
            id: "sub-1".to_string(),
            phase: SubscriptionPhase::Pending,
        };
        let msg = err.to_string();
        assert!(msg.contains("sub-1"));
        assert!(msg.contains("pending"));
    }

    #[test]
    fn test_missing_endpoint_display() {
        let err = ConfigError::MissingEndpoint {
            id: "ruter-et".to_string(),
            purpose: RequestPurpose::Fetch,
        };
        assert!(err.to_string().contains("ruter-et"));
        assert!(err.to_string().contains("fetch"));
    }

    #[test]
    fn test_delivery_classification() {
        let refused = DeliveryError::Unreachable {
            address: "http://consumer".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(refused.is_unreachable());
        assert!(!refused.is_transient());

        let timeout = DeliveryError::Timeout {
            address: "http://consumer".to_string(),
            duration_ms: 500,
        };
        assert!(timeout.is_transient());
        assert!(RelayError::from(timeout).is_retryable());
    }

    #[test]
    fn test_config_errors_are_not_retryable() {
        let err = RelayError::from(ConfigError::MissingField {
            field: "dataset_id".to_string(),
        });
        assert!(err.is_config());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_upstream_unreachable_propagates() {
        let err = RelayError::from(UpstreamError::Unreachable {
            endpoint: "http://provider/subscribe".to_string(),
            message: "connection reset".to_string(),
        });
        assert!(err.is_unreachable());
        assert!(err.is_retryable());
    }
}
