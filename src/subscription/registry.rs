//! Subscription lifecycle state.
//!
//! Each subscription id maps to exactly one [`SubscriptionEntry`] holding the
//! descriptor and its runtime state, phase included. Every transition is a
//! single atomic update of that one key, so an id can never be pending and
//! active at the same time, even with several instances racing on it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RelayResult};
use crate::observability as events;
use crate::storage::{InMemoryStore, KeyValueStore, Mutation, DEFAULT_SHARDS};
use crate::time::{to_chrono, Clock, SystemClock};

use super::descriptor::{SubscriptionDescriptor, SubscriptionMode};

/// Heartbeats a subscription may miss before it is considered unhealthy.
pub const HEALTHCHECK_FACTOR: u32 = 5;

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPhase {
    /// Requested or demoted; waiting for confirmation or reactivation.
    Pending,
    /// Confirmed and receiving data.
    Active,
}

impl fmt::Display for SubscriptionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Active => "active",
        })
    }
}

/// Mutable runtime state of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRuntimeState {
    pub phase: SubscriptionPhase,
    pub last_activity: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub pending_since: Option<DateTime<Utc>>,
    pub hits: u64,
    pub objects: u64,
}

impl SubscriptionRuntimeState {
    fn active(now: DateTime<Utc>) -> Self {
        Self {
            phase: SubscriptionPhase::Active,
            last_activity: None,
            activated_at: Some(now),
            pending_since: None,
            hits: 0,
            objects: 0,
        }
    }

    fn pending(now: DateTime<Utc>) -> Self {
        Self {
            phase: SubscriptionPhase::Pending,
            last_activity: None,
            activated_at: None,
            pending_since: Some(now),
            hits: 0,
            objects: 0,
        }
    }

    fn demote(&mut self, now: DateTime<Utc>) {
        self.phase = SubscriptionPhase::Pending;
        self.activated_at = None;
        self.pending_since = Some(now);
    }

    fn activate(&mut self, now: DateTime<Utc>) {
        self.phase = SubscriptionPhase::Active;
        self.activated_at = Some(now);
        self.pending_since = None;
    }
}

/// Descriptor and state stored under one subscription id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub descriptor: SubscriptionDescriptor,
    pub state: SubscriptionRuntimeState,
}

/// Why a subscription is, or is not, healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    /// Nothing recorded yet; given the benefit of the doubt.
    NotStarted,
    /// No activity within the heartbeat threshold.
    Stale,
    /// A pushed subscription outlived its configured duration.
    Expired,
    /// Pending for longer than the heartbeat threshold.
    NeverActivated,
}

impl HealthVerdict {
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy | Self::NotStarted)
    }
}

/// Read-only view of one subscription for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub subscription_id: String,
    pub internal_id: u64,
    pub vendor: String,
    pub dataset_id: String,
    pub kind: crate::model::DataKind,
    pub mode: SubscriptionMode,
    pub phase: SubscriptionPhase,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub pending_since: Option<DateTime<Utc>>,
    pub hits: u64,
    pub objects: u64,
    pub verdict: HealthVerdict,
    pub healthy: bool,
}

type EntryBackend = Arc<dyn KeyValueStore<String, SubscriptionEntry>>;

/// Owns every subscription descriptor and its runtime state.
pub struct SubscriptionRegistry {
    entries: EntryBackend,
    clock: Arc<dyn Clock>,
    healthcheck_factor: u32,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("healthcheck_factor", &self.healthcheck_factor)
            .finish_non_exhaustive()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SubscriptionRegistry {
    /// In-memory registry with the default health-check factor.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_backend(
            Arc::new(InMemoryStore::with_shards(DEFAULT_SHARDS)),
            clock,
            HEALTHCHECK_FACTOR,
        )
    }

    #[must_use]
    pub fn with_backend(entries: EntryBackend, clock: Arc<dyn Clock>, healthcheck_factor: u32) -> Self {
        Self {
            entries,
            clock,
            healthcheck_factor: healthcheck_factor.max(1),
        }
    }

    fn threshold(&self, heartbeat: StdDuration) -> Duration {
        to_chrono(heartbeat) * i32::try_from(self.healthcheck_factor).unwrap_or(i32::MAX)
    }

    /// Registers a new subscription as active and stamps its activation time.
    pub fn register(&self, descriptor: SubscriptionDescriptor) -> RelayResult<()> {
        let id = descriptor.subscription_id.clone();
        let now = self.clock.now();
        let entry = SubscriptionEntry {
            descriptor,
            state: SubscriptionRuntimeState::active(now),
        };
        if let Some(existing) = self.entries.put_if_absent(id.clone(), entry)? {
            return Err(RegistryError::AlreadyExists {
                id,
                phase: existing.state.phase,
            }
            .into());
        }
        info!(event = events::SUBSCRIPTION_REGISTERED, subscription_id = %id, "subscription registered");
        Ok(())
    }

    /// Inserts or replaces an entry as active, keeping its counters and last
    /// activity.
    ///
    /// Used when a polled subscription is re-established. A provider that
    /// stays silent is judged stale again on the next sweep.
    pub fn reactivate(&self, descriptor: SubscriptionDescriptor) -> RelayResult<()> {
        let id = descriptor.subscription_id.clone();
        let now = self.clock.now();
        self.entries.update(&id, &mut |current| {
            let mut state = current.map_or_else(|| SubscriptionRuntimeState::active(now), |e| e.state.clone());
            state.activate(now);
            Mutation::Put(SubscriptionEntry {
                descriptor: descriptor.clone(),
                state,
            })
        })?;
        info!(event = events::SUBSCRIPTION_ACTIVATED, subscription_id = %id, "subscription (re)activated");
        Ok(())
    }

    /// Inserts or replaces an entry as pending, keeping its counters.
    ///
    /// Used after a subscribe handshake while waiting for the first delivery.
    pub fn mark_pending(&self, descriptor: SubscriptionDescriptor) -> RelayResult<()> {
        let id = descriptor.subscription_id.clone();
        let now = self.clock.now();
        self.entries.update(&id, &mut |current| {
            let mut state = current.map_or_else(|| SubscriptionRuntimeState::pending(now), |e| e.state.clone());
            state.demote(now);
            state.last_activity = None;
            Mutation::Put(SubscriptionEntry {
                descriptor: descriptor.clone(),
                state,
            })
        })?;
        info!(event = events::SUBSCRIPTION_PENDING, subscription_id = %id, "subscription pending");
        Ok(())
    }

    /// Moves an entry to pending, keeping its descriptor. No-op for unknown ids.
    ///
    /// Returns whether the id was known.
    pub fn demote(&self, id: &str) -> RelayResult<bool> {
        let now = self.clock.now();
        let mut found = false;
        self.entries.update(&id.to_string(), &mut |current| match current {
            Some(entry) => {
                found = true;
                let mut entry = entry.clone();
                entry.state.demote(now);
                Mutation::Put(entry)
            }
            None => {
                found = false;
                Mutation::Keep
            }
        })?;
        if found {
            info!(event = events::SUBSCRIPTION_DEMOTED, subscription_id = id, "subscription demoted to pending");
        }
        Ok(found)
    }

    /// Removes every trace of an id. Returns the removed descriptor.
    pub fn destroy(&self, id: &str) -> RelayResult<Option<SubscriptionDescriptor>> {
        let removed = self.entries.remove(&id.to_string())?.map(|e| e.descriptor);
        info!(
            event = events::SUBSCRIPTION_DESTROYED,
            subscription_id = id,
            found = removed.is_some(),
            "subscription destroyed"
        );
        Ok(removed)
    }

    /// Records activity: bumps the hit counter and stamps last activity.
    ///
    /// A pending entry is promoted to active, covering confirmations that
    /// arrive after a demotion. Returns false for unknown ids.
    pub fn touch(&self, id: &str) -> RelayResult<bool> {
        let now = self.clock.now();
        let mut promoted = false;
        let mut found = false;
        self.entries.update(&id.to_string(), &mut |current| {
            let Some(entry) = current else {
                found = false;
                return Mutation::Keep;
            };
            found = true;
            let mut entry = entry.clone();
            promoted = entry.state.phase == SubscriptionPhase::Pending;
            if promoted {
                entry.state.activate(now);
            }
            entry.state.hits += 1;
            entry.state.last_activity = Some(now);
            Mutation::Put(entry)
        })?;

        if promoted {
            info!(event = events::SUBSCRIPTION_ACTIVATED, subscription_id = id, "pending subscription activated");
        } else if !found {
            warn!(event = events::SUBSCRIPTION_TOUCH_UNKNOWN, subscription_id = id, "touch for unknown subscription");
        }
        Ok(found)
    }

    /// Alias of [`touch`](Self::touch).
    pub fn record_hit(&self, id: &str) -> RelayResult<bool> {
        self.touch(id)
    }

    /// Touch with the provider's reported service start time.
    ///
    /// If the provider started at or after our last sign of life, it has
    /// restarted underneath the subscription and no longer knows about it.
    /// Last activity is then back-dated past the health threshold so the next
    /// sweep re-establishes the subscription, and false is returned.
    pub fn touch_with_service_start(&self, id: &str, service_started_at: DateTime<Utc>) -> RelayResult<bool> {
        let now = self.clock.now();
        let factor = i32::try_from(self.healthcheck_factor).unwrap_or(i32::MAX - 1);
        let mut restarted = false;
        let mut healthy = false;
        self.entries.update(&id.to_string(), &mut |current| {
            restarted = false;
            healthy = false;
            let Some(entry) = current else {
                return Mutation::Keep;
            };
            if entry.state.phase != SubscriptionPhase::Active {
                return Mutation::Keep;
            }
            let reference = entry.state.last_activity.or(entry.state.activated_at);
            let mut entry = entry.clone();
            if reference.is_some_and(|seen| seen > service_started_at) {
                healthy = true;
                entry.state.hits += 1;
                entry.state.last_activity = Some(now);
            } else {
                restarted = true;
                let heartbeat = to_chrono(entry.descriptor.heartbeat_interval);
                entry.state.last_activity = Some(now - heartbeat * (factor + 1));
            }
            Mutation::Put(entry)
        })?;

        if restarted {
            info!(
                event = events::SUBSCRIPTION_REMOTE_RESTARTED,
                subscription_id = id,
                %service_started_at,
                "remote service restarted, re-establishing subscription"
            );
        }
        Ok(healthy)
    }

    /// Health verdict for an id. Unknown ids count as not started.
    pub fn health(&self, id: &str) -> RelayResult<HealthVerdict> {
        Ok(self
            .entries
            .get(&id.to_string())?
            .map_or(HealthVerdict::NotStarted, |entry| self.verdict(&entry)))
    }

    /// True unless the subscription is stale, expired or never activated.
    pub fn is_healthy(&self, id: &str) -> RelayResult<bool> {
        Ok(self.health(id)?.is_healthy())
    }

    fn verdict(&self, entry: &SubscriptionEntry) -> HealthVerdict {
        let now = self.clock.now();
        let threshold = self.threshold(entry.descriptor.heartbeat_interval);
        let state = &entry.state;

        match state.phase {
            SubscriptionPhase::Pending => match state.pending_since {
                Some(since) if now - since > threshold => HealthVerdict::NeverActivated,
                _ if state.last_activity.is_none() => HealthVerdict::NotStarted,
                _ => HealthVerdict::Healthy,
            },
            SubscriptionPhase::Active => {
                let Some(last) = state.last_activity else {
                    return HealthVerdict::NotStarted;
                };
                if now - last > threshold {
                    return HealthVerdict::Stale;
                }
                if entry.descriptor.mode == SubscriptionMode::Subscribe {
                    let duration = to_chrono(entry.descriptor.subscription_duration);
                    if state.activated_at.is_some_and(|at| at + duration < now) {
                        debug!(
                            subscription_id = %entry.descriptor.subscription_id,
                            "subscription outlived its duration"
                        );
                        return HealthVerdict::Expired;
                    }
                }
                HealthVerdict::Healthy
            }
        }
    }

    /// Adds to the cumulative object counter.
    pub fn increment_object_counter(&self, id: &str, count: usize) -> RelayResult<()> {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.entries.update(&id.to_string(), &mut |current| match current {
            Some(entry) => {
                let mut entry = entry.clone();
                entry.state.objects = entry.state.objects.saturating_add(count);
                Mutation::Put(entry)
            }
            None => Mutation::Keep,
        })?;
        Ok(())
    }

    /// Descriptor of a pending or active subscription.
    pub fn get(&self, id: &str) -> RelayResult<Option<SubscriptionDescriptor>> {
        Ok(self.entries.get(&id.to_string())?.map(|e| e.descriptor))
    }

    /// Full entry of a subscription.
    pub fn entry(&self, id: &str) -> RelayResult<Option<SubscriptionEntry>> {
        Ok(self.entries.get(&id.to_string())?)
    }

    pub fn get_by_internal_id(&self, internal_id: u64) -> RelayResult<Option<SubscriptionDescriptor>> {
        Ok(self
            .entries
            .entries()?
            .into_iter()
            .map(|(_, e)| e.descriptor)
            .find(|d| d.internal_id == internal_id))
    }

    pub fn is_registered(&self, id: &str) -> RelayResult<bool> {
        Ok(self.entries.get(&id.to_string())?.is_some())
    }

    pub fn phase(&self, id: &str) -> RelayResult<Option<SubscriptionPhase>> {
        Ok(self.entries.get(&id.to_string())?.map(|e| e.state.phase))
    }

    pub fn active_count(&self) -> RelayResult<usize> {
        self.count_phase(SubscriptionPhase::Active)
    }

    pub fn pending_count(&self) -> RelayResult<usize> {
        self.count_phase(SubscriptionPhase::Pending)
    }

    fn count_phase(&self, phase: SubscriptionPhase) -> RelayResult<usize> {
        Ok(self
            .entries
            .entries()?
            .iter()
            .filter(|(_, e)| e.state.phase == phase)
            .count())
    }

    /// Descriptor, state and health of every subscription, ordered by id.
    pub fn snapshot(&self) -> RelayResult<Vec<SubscriptionStatus>> {
        let mut out: Vec<SubscriptionStatus> = self
            .entries
            .entries()?
            .into_iter()
            .map(|(_, entry)| {
                let verdict = self.verdict(&entry);
                let SubscriptionEntry { descriptor, state } = entry;
                SubscriptionStatus {
                    subscription_id: descriptor.subscription_id,
                    internal_id: descriptor.internal_id,
                    vendor: descriptor.vendor,
                    dataset_id: descriptor.dataset_id,
                    kind: descriptor.kind,
                    mode: descriptor.mode,
                    phase: state.phase,
                    activated_at: state.activated_at,
                    last_activity: state.last_activity,
                    pending_since: state.pending_since,
                    hits: state.hits,
                    objects: state.objects,
                    verdict,
                    healthy: verdict.is_healthy(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::model::DataKind;
    use crate::subscription::RequestPurpose;
    use crate::time::ManualClock;

    fn descriptor(id: &str, mode: SubscriptionMode) -> SubscriptionDescriptor {
        SubscriptionDescriptor::builder(id, "RUT", DataKind::EstimatedTimetable)
            .mode(mode)
            .endpoint(RequestPurpose::Subscribe, "http://provider/subscribe")
            .endpoint(RequestPurpose::Fetch, "http://provider/fetch")
            .heartbeat_interval(StdDuration::from_secs(60))
            .subscription_duration(StdDuration::from_secs(3600))
            .build()
            .unwrap()
    }

    fn setup() -> (Arc<ManualClock>, SubscriptionRegistry) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = SubscriptionRegistry::new(clock.clone());
        (clock, registry)
    }

    #[test]
    fn test_register_twice_fails() {
        let (_, registry) = setup();
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();
        let err = registry
            .register(descriptor("a", SubscriptionMode::Subscribe))
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Registry(RegistryError::AlreadyExists {
                phase: SubscriptionPhase::Active,
                ..
            })
        ));
    }

    #[test]
    fn test_register_fails_for_pending_id() {
        let (_, registry) = setup();
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();
        registry.demote("a").unwrap();
        assert!(registry.register(descriptor("a", SubscriptionMode::Subscribe)).is_err());
    }

    #[test]
    fn test_demote_and_touch_promotes() {
        let (_, registry) = setup();
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();

        assert!(registry.demote("a").unwrap());
        assert_eq!(registry.phase("a").unwrap(), Some(SubscriptionPhase::Pending));
        assert!(registry.get("a").unwrap().is_some());

        assert!(registry.touch("a").unwrap());
        assert_eq!(registry.phase("a").unwrap(), Some(SubscriptionPhase::Active));
        assert_eq!(registry.entry("a").unwrap().unwrap().state.hits, 1);
    }

    #[test]
    fn test_demote_unknown_is_noop() {
        let (_, registry) = setup();
        assert!(!registry.demote("ghost").unwrap());
        assert!(!registry.is_registered("ghost").unwrap());
    }

    #[test]
    fn test_touch_unknown_returns_false() {
        let (_, registry) = setup();
        assert!(!registry.touch("ghost").unwrap());
    }

    #[test]
    fn test_destroy_removes_everything() {
        let (_, registry) = setup();
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();
        registry.increment_object_counter("a", 10).unwrap();

        assert!(registry.destroy("a").unwrap().is_some());
        assert!(!registry.is_registered("a").unwrap());
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();
        assert_eq!(registry.entry("a").unwrap().unwrap().state.objects, 0);
    }

    #[test]
    fn test_no_activity_is_healthy() {
        let (clock, registry) = setup();
        registry.register(descriptor("a", SubscriptionMode::RequestResponse)).unwrap();
        clock.advance(Duration::hours(10));
        assert_eq!(registry.health("a").unwrap(), HealthVerdict::NotStarted);
        assert!(registry.is_healthy("a").unwrap());
    }

    #[test]
    fn test_stale_after_factor_heartbeats() {
        let (clock, registry) = setup();
        registry.register(descriptor("a", SubscriptionMode::RequestResponse)).unwrap();
        registry.touch("a").unwrap();

        clock.advance(Duration::seconds(300));
        assert!(registry.is_healthy("a").unwrap());

        clock.advance(Duration::seconds(1));
        assert_eq!(registry.health("a").unwrap(), HealthVerdict::Stale);
    }

    #[test]
    fn test_subscribe_mode_expires_after_duration() {
        let (clock, registry) = setup();
        registry.register(descriptor("push", SubscriptionMode::Subscribe)).unwrap();
        registry.register(descriptor("poll", SubscriptionMode::RequestResponse)).unwrap();

        for _ in 0..61 {
            clock.advance(Duration::seconds(60));
            registry.touch("push").unwrap();
            registry.touch("poll").unwrap();
        }

        assert_eq!(registry.health("push").unwrap(), HealthVerdict::Expired);
        assert!(registry.is_healthy("poll").unwrap());
    }

    #[test]
    fn test_pending_never_activated() {
        let (clock, registry) = setup();
        registry
            .mark_pending(descriptor("a", SubscriptionMode::Subscribe))
            .unwrap();
        assert!(registry.is_healthy("a").unwrap());

        clock.advance(Duration::seconds(301));
        assert_eq!(registry.health("a").unwrap(), HealthVerdict::NeverActivated);
    }

    #[test]
    fn test_reactivate_keeps_last_activity() {
        let (clock, registry) = setup();
        let d = descriptor("a", SubscriptionMode::RequestResponse);
        registry.register(d.clone()).unwrap();
        registry.touch("a").unwrap();
        let seen = clock.now();

        clock.advance(Duration::seconds(301));
        registry.demote("a").unwrap();
        registry.reactivate(d).unwrap();
        let state = registry.entry("a").unwrap().unwrap().state;
        assert_eq!(state.phase, SubscriptionPhase::Active);
        assert_eq!(state.last_activity, Some(seen));
        assert_eq!(registry.health("a").unwrap(), HealthVerdict::Stale);
    }

    #[test]
    fn test_service_restart_forces_unhealthy() {
        let (clock, registry) = setup();
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();
        registry.touch("a").unwrap();
        clock.advance(Duration::seconds(10));

        let restarted_at = clock.now();
        assert!(!registry.touch_with_service_start("a", restarted_at).unwrap());
        assert_eq!(registry.health("a").unwrap(), HealthVerdict::Stale);
    }

    #[test]
    fn test_service_start_before_activity_is_a_touch() {
        let (clock, registry) = setup();
        let started = clock.now() - Duration::hours(1);
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();
        registry.touch("a").unwrap();

        clock.advance(Duration::seconds(30));
        assert!(registry.touch_with_service_start("a", started).unwrap());
        let state = registry.entry("a").unwrap().unwrap().state;
        assert_eq!(state.last_activity, Some(clock.now()));
        assert_eq!(state.hits, 2);
    }

    #[test]
    fn test_snapshot_and_counts() {
        let (_, registry) = setup();
        registry.register(descriptor("b", SubscriptionMode::Subscribe)).unwrap();
        registry.register(descriptor("a", SubscriptionMode::Subscribe)).unwrap();
        registry.demote("b").unwrap();

        assert_eq!(registry.active_count().unwrap(), 1);
        assert_eq!(registry.pending_count().unwrap(), 1);

        let snapshot = registry.snapshot().unwrap();
        let ids: Vec<&str> = snapshot.iter().map(|s| s.subscription_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snapshot[1].phase, SubscriptionPhase::Pending);
    }

    #[test]
    fn test_get_by_internal_id() {
        let (_, registry) = setup();
        let mut d = descriptor("a", SubscriptionMode::Subscribe);
        d.internal_id = 42;
        registry.register(d).unwrap();
        assert_eq!(
            registry.get_by_internal_id(42).unwrap().map(|d| d.subscription_id),
            Some("a".to_string())
        );
        assert!(registry.get_by_internal_id(7).unwrap().is_none());
    }
}
