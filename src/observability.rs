//! Canonical structured event names.
//!
//! Every `tracing` event emitted by the crate carries an `event` field with
//! one of these values, so log pipelines can filter on stable identifiers
//! rather than message text.

// Subscription registry.
pub const SUBSCRIPTION_REGISTERED: &str = "subscription_registered";
pub const SUBSCRIPTION_PENDING: &str = "subscription_pending";
pub const SUBSCRIPTION_DEMOTED: &str = "subscription_demoted";
pub const SUBSCRIPTION_DESTROYED: &str = "subscription_destroyed";
pub const SUBSCRIPTION_ACTIVATED: &str = "subscription_activated";
pub const SUBSCRIPTION_TOUCH_UNKNOWN: &str = "subscription_touch_unknown";
pub const SUBSCRIPTION_REMOTE_RESTARTED: &str = "subscription_remote_restarted";

// Health sweep and re-establishment.
pub const HEALTH_SWEEP: &str = "health_sweep";
pub const HEALTH_UNHEALTHY: &str = "health_unhealthy";
pub const RESTART_QUEUED: &str = "restart_queued";
pub const RESTART_QUEUE_FULL: &str = "restart_queue_full";
pub const RESTART_OK: &str = "restart_ok";
pub const RESTART_FAILED: &str = "restart_failed";

// Upstream scheduling.
pub const UPSTREAM_FETCH_OK: &str = "upstream_fetch_ok";
pub const UPSTREAM_FETCH_FAILED: &str = "upstream_fetch_failed";
pub const UPSTREAM_STATUS_OK: &str = "upstream_status_ok";
pub const UPSTREAM_STATUS_FAILED: &str = "upstream_status_failed";

// Ingest and merge.
pub const INGEST_COMPLETE: &str = "ingest_complete";
pub const INGEST_UNKNOWN_SUBSCRIPTION: &str = "ingest_unknown_subscription";
pub const VALIDATION_VIOLATIONS: &str = "validation_violations";
pub const MERGE_DISCARDED_STALE: &str = "merge_discarded_stale";
pub const MERGE_IGNORED_UNKEYED: &str = "merge_ignored_unkeyed";
pub const DATASET_CLEARED: &str = "dataset_cleared";

// Transformation.
pub const TIMES_CORRECTED: &str = "times_corrected";

// Outbound delivery.
pub const DELIVERY_QUEUED: &str = "delivery_queued";
pub const DELIVERY_QUEUE_FULL: &str = "delivery_queue_full";
pub const DELIVERY_SKIPPED_EMPTY: &str = "delivery_skipped_empty";
pub const DELIVERY_BUILD_FAILED: &str = "delivery_build_failed";
pub const DELIVERY_SPLIT: &str = "delivery_split";
pub const DELIVERY_CHUNK_OK: &str = "delivery_chunk_ok";
pub const DELIVERY_CHUNK_UNREACHABLE: &str = "delivery_chunk_unreachable";
pub const DELIVERY_CHUNK_FAILED: &str = "delivery_chunk_failed";
pub const DELIVERY_DONE: &str = "delivery_done";
