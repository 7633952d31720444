//! Upstream subscriptions: configuration, lifecycle state, health and timers.

mod descriptor;
mod health;
mod registry;
mod scheduler;
mod upstream;

pub use descriptor::{RequestPurpose, SubscriptionDescriptor, SubscriptionDescriptorBuilder, SubscriptionMode};
pub use health::{HealthMonitor, RestartStats, SweepReport};
pub use registry::{
    HealthVerdict, SubscriptionEntry, SubscriptionPhase, SubscriptionRegistry, SubscriptionRuntimeState,
    SubscriptionStatus, HEALTHCHECK_FACTOR,
};
pub use scheduler::{CycleOutcome, SubscriptionScheduler};
pub use upstream::{ServiceStatus, UpstreamClient};
