//! # transit-relay
//!
//! A real-time public-transport data relay. It keeps subscriptions to many
//! upstream providers alive, merges what they send into one consistent
//! current state per data kind, and republishes changes to downstream
//! consumers.
//!
//! ## Core Concepts
//!
//! - **Subscription**: one upstream data source, either pushed to us after a
//!   subscribe handshake or polled on every heartbeat
//! - **Entity store**: the merged current state of one data kind (situations,
//!   estimated timetables, vehicle monitoring, production timetables), with a
//!   change feed per consumer
//! - **Transformation chain**: identifier rewriting on ingest and id-policy
//!   resolution on egress
//! - **Outbound target**: a push consumer receiving filtered, size-bounded
//!   chunks of changes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use transit_relay::{Relay, RelayConfig};
//!
//! let config = RelayConfig::from_path("relay.json")?;
//! let relay = Relay::builder(config)
//!     .upstream(Arc::new(my_upstream_client))
//!     .channel_provider(Arc::new(my_channel_provider))
//!     .build()?;
//! relay.start();
//!
//! // Data pushed by a provider:
//! relay.ingest("ruter-et", payload)?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod entity;
pub mod error;
pub mod ingest;
pub mod model;
pub mod observability;
pub mod outbound;
pub mod relay;
pub mod storage;
pub mod subscription;
pub mod time;
pub mod transform;
pub mod validation;

// Re-export primary types at crate root for convenience
pub use config::{HealthConfig, OutboundConfig, RelayConfig, StoreConfig, UpstreamConfig};
pub use entity::{ChangeCursor, EntityStore, EntityStores, MergeOutcome, MergeSummary, TransitRecord};
pub use error::{ConfigError, DeliveryError, RegistryError, RelayError, RelayResult, UpstreamError};
pub use ingest::{ChangeListener, IngestReport, Ingestor};
pub use model::{
    Call, CallStatus, DataKind, EstimatedJourney, IdField, IdPolicy, Location, ObjectRef, Payload,
    ProductionTimetable, Situation, ValidityPeriod, VehicleActivity,
};
pub use outbound::{
    ChannelPolicy, ChannelProvider, ContentFilter, DeliveryChannel, DeliveryContext, DeliveryReport, JsonCodec,
    OutboundDistributor, OutboundTarget, PayloadCodec,
};
pub use relay::{Relay, RelayBuilder, RelayStats};
pub use storage::{InMemoryStore, KeyValueStore, StorageError};
pub use subscription::{
    HealthMonitor, HealthVerdict, RequestPurpose, ServiceStatus, SubscriptionDescriptor, SubscriptionMode,
    SubscriptionPhase, SubscriptionRegistry, SubscriptionScheduler, UpstreamClient,
};
pub use time::{Clock, ManualClock, SystemClock};
pub use transform::{AdapterSpec, TransformChain, TransformRegistry};
pub use validation::{ValidationPolicy, ValidationSuite, Validator, Violation};
