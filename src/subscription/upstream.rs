//! Upstream provider contract.
//!
//! The relay never speaks a provider protocol itself. An [`UpstreamClient`]
//! performs the handshakes and returns decoded payloads; every call carries
//! a timeout and reports connection failures as
//! [`UpstreamError::Unreachable`].

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::UpstreamError;
use crate::model::Payload;

use super::descriptor::SubscriptionDescriptor;

/// Provider status as reported by a check-status call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStatus {
    /// When the provider's service process started, if reported.
    pub service_started_at: Option<DateTime<Utc>>,
}

/// Network-facing half of a subscription.
pub trait UpstreamClient: Send + Sync {
    /// Sends a subscribe request. The provider confirms by starting to push.
    fn subscribe(&self, descriptor: &SubscriptionDescriptor, timeout: Duration) -> Result<(), UpstreamError>;

    /// Asks the provider whether it is alive and when it started.
    fn check_status(
        &self,
        descriptor: &SubscriptionDescriptor,
        timeout: Duration,
    ) -> Result<ServiceStatus, UpstreamError>;

    /// Cancels a subscription at the provider.
    fn terminate(&self, descriptor: &SubscriptionDescriptor, timeout: Duration) -> Result<(), UpstreamError>;

    /// Fetches the current data set of a polled subscription.
    fn fetch(&self, descriptor: &SubscriptionDescriptor, timeout: Duration) -> Result<Payload, UpstreamError>;
}
