use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use transit_relay::error::{RegistryError, RelayError, UpstreamError};
use transit_relay::model::{DataKind, EstimatedJourney, ObjectRef, Payload};
use transit_relay::outbound::{ChannelPolicy, ChannelProvider, DeliveryChannel};
use transit_relay::subscription::{
    HealthVerdict, RequestPurpose, ServiceStatus, SubscriptionDescriptor, SubscriptionMode, SubscriptionPhase,
    SubscriptionRegistry, UpstreamClient,
};
use transit_relay::transform::AdapterSpec;
use transit_relay::{Clock, DeliveryError, ManualClock, Relay, RelayConfig};

#[derive(Default)]
struct RecordingUpstream {
    subscribes: AtomicUsize,
    terminates: AtomicUsize,
    terminated: Mutex<Vec<String>>,
}

impl UpstreamClient for RecordingUpstream {
    fn subscribe(&self, _: &SubscriptionDescriptor, _: Duration) -> Result<(), UpstreamError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_status(&self, _: &SubscriptionDescriptor, _: Duration) -> Result<ServiceStatus, UpstreamError> {
        Ok(ServiceStatus::default())
    }

    fn terminate(&self, d: &SubscriptionDescriptor, _: Duration) -> Result<(), UpstreamError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        self.terminated.lock().unwrap().push(d.subscription_id.clone());
        Ok(())
    }

    fn fetch(&self, _: &SubscriptionDescriptor, _: Duration) -> Result<Payload, UpstreamError> {
        Ok(Payload::default())
    }
}

struct NullChannel;

impl DeliveryChannel for NullChannel {
    fn send(&self, _: &[u8], _: Duration) -> Result<(), DeliveryError> {
        Ok(())
    }
}

struct NullProvider;

impl ChannelProvider for NullProvider {
    fn channel(&self, _: &str, _: ChannelPolicy) -> Result<Arc<dyn DeliveryChannel>, DeliveryError> {
        Ok(Arc::new(NullChannel))
    }
}

fn push_descriptor(id: &str) -> SubscriptionDescriptor {
    SubscriptionDescriptor::builder(id, "RUT", DataKind::EstimatedTimetable)
        .vendor("ruter")
        .mode(SubscriptionMode::Subscribe)
        .endpoint(RequestPurpose::Subscribe, "http://provider/subscribe")
        .endpoint(RequestPurpose::Delete, "http://provider/delete")
        .heartbeat_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}

fn poll_descriptor(id: &str) -> SubscriptionDescriptor {
    SubscriptionDescriptor::builder(id, "RUT", DataKind::EstimatedTimetable)
        .vendor("ruter")
        .endpoint(RequestPurpose::Fetch, "http://provider/et")
        .heartbeat_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}

fn relay() -> (Relay, Arc<ManualClock>, Arc<RecordingUpstream>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let upstream = Arc::new(RecordingUpstream::default());
    let relay = Relay::builder(RelayConfig::default())
        .upstream(upstream.clone())
        .channel_provider(Arc::new(NullProvider))
        .clock(clock.clone())
        .build()
        .unwrap();
    (relay, clock, upstream)
}

fn journeys(count: usize) -> Payload {
    let mut payload = Payload::default();
    for i in 0..count {
        payload.estimated_journeys.push(EstimatedJourney {
            journey_ref: format!("J{i}"),
            line_ref: ObjectRef::new("RUT:Line:31"),
            recorded_at: Some(Utc::now()),
            ..EstimatedJourney::default()
        });
    }
    payload
}

#[test]
fn provider_restart_marks_subscription_unhealthy() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let registry = SubscriptionRegistry::new(clock.clone());
    registry.register(push_descriptor("a")).unwrap();
    registry.touch("a").unwrap();
    let last_activity = clock.now();
    assert!(registry.is_healthy("a").unwrap());

    clock.advance(ChronoDuration::seconds(10));
    let started_later = last_activity + ChronoDuration::seconds(5);
    assert!(!registry.touch_with_service_start("a", started_later).unwrap());
    assert!(!registry.is_healthy("a").unwrap());
    assert_eq!(registry.health("a").unwrap(), HealthVerdict::Stale);
}

#[test]
fn provider_started_before_last_activity_stays_healthy() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let registry = SubscriptionRegistry::new(clock.clone());
    registry.register(push_descriptor("a")).unwrap();
    registry.touch("a").unwrap();
    let started_earlier = clock.now() - ChronoDuration::hours(3);

    clock.advance(ChronoDuration::seconds(10));
    assert!(registry.touch_with_service_start("a", started_earlier).unwrap());
    assert_eq!(registry.entry("a").unwrap().unwrap().state.hits, 2);
    assert!(registry.is_healthy("a").unwrap());
}

#[test]
fn registration_is_exclusive() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let registry = SubscriptionRegistry::new(clock);
    registry.register(push_descriptor("a")).unwrap();

    let err = registry.register(push_descriptor("a")).unwrap_err();
    assert!(matches!(
        err,
        RelayError::Registry(RegistryError::AlreadyExists {
            phase: SubscriptionPhase::Active,
            ..
        })
    ));

    assert!(registry.demote("a").unwrap());
    let err = registry.register(push_descriptor("a")).unwrap_err();
    assert!(matches!(
        err,
        RelayError::Registry(RegistryError::AlreadyExists {
            phase: SubscriptionPhase::Pending,
            ..
        })
    ));
    assert_eq!(registry.active_count().unwrap() + registry.pending_count().unwrap(), 1);
}

#[test]
fn demote_and_destroy() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let registry = SubscriptionRegistry::new(clock);
    assert!(!registry.demote("missing").unwrap());
    assert!(registry.destroy("missing").unwrap().is_none());

    registry.register(push_descriptor("a")).unwrap();
    registry.touch("a").unwrap();
    registry.demote("a").unwrap();
    assert_eq!(registry.phase("a").unwrap(), Some(SubscriptionPhase::Pending));
    // Activity on a pending subscription confirms it.
    registry.touch("a").unwrap();
    assert_eq!(registry.phase("a").unwrap(), Some(SubscriptionPhase::Active));

    let removed = registry.destroy("a").unwrap().unwrap();
    assert_eq!(removed.subscription_id, "a");
    assert!(!registry.is_registered("a").unwrap());
    assert!(registry.get("a").unwrap().is_none());
}

#[test]
fn pushed_subscription_expires_after_its_duration() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let registry = SubscriptionRegistry::new(clock.clone());
    let descriptor = SubscriptionDescriptor::builder("a", "RUT", DataKind::Situation)
        .mode(SubscriptionMode::Subscribe)
        .endpoint(RequestPurpose::Subscribe, "http://provider/subscribe")
        .heartbeat_interval(Duration::from_secs(60))
        .subscription_duration(Duration::from_secs(600))
        .build()
        .unwrap();
    registry.register(descriptor).unwrap();

    for _ in 0..11 {
        clock.advance(ChronoDuration::seconds(60));
        registry.touch("a").unwrap();
    }
    assert_eq!(registry.health("a").unwrap(), HealthVerdict::Expired);
}

#[test]
fn pending_subscription_activates_on_first_delivery() {
    let (relay, _, upstream) = relay();
    relay.start_subscription(push_descriptor("ruter-et")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));

    assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().phase("ruter-et").unwrap(), Some(SubscriptionPhase::Pending));
    // Push subscriptions without a status endpoint need no timer.
    assert!(relay.scheduler().scheduled().is_empty());

    let report = relay.ingest("ruter-et", journeys(3)).unwrap();
    assert_eq!(report.merge.inserted, 3);

    let statuses = relay.list_subscriptions().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].phase, SubscriptionPhase::Active);
    assert_eq!(statuses[0].hits, 1);
    assert_eq!(statuses[0].objects, 3);
    assert!(statuses[0].healthy);
}

#[test]
fn stale_subscription_is_reestablished() {
    let (relay, clock, upstream) = relay();
    relay.start_subscription(push_descriptor("ruter-et")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    relay.ingest("ruter-et", journeys(1)).unwrap();

    clock.advance(ChronoDuration::seconds(60 * 5 + 1));
    let report = relay.sweep_now().unwrap();
    assert_eq!(report.unhealthy, 1);
    assert_eq!(report.restarts_queued, 1);
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));

    assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 2);
    assert_eq!(relay.registry().phase("ruter-et").unwrap(), Some(SubscriptionPhase::Pending));
    assert_eq!(relay.stats().unwrap().restarts.succeeded, 2);
}

#[test]
fn stop_keeps_entry_pending_and_terminates_upstream() {
    let (relay, clock, upstream) = relay();
    relay.start_subscription(push_descriptor("ruter-et")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    relay.ingest("ruter-et", journeys(1)).unwrap();

    assert!(relay.stop_subscription("ruter-et").unwrap());
    assert_eq!(upstream.terminates.load(Ordering::SeqCst), 2);
    assert_eq!(relay.registry().phase("ruter-et").unwrap(), Some(SubscriptionPhase::Pending));
    assert!(relay.monitor().desired().is_empty());

    // A stopped subscription is never brought back by the sweep.
    clock.advance(ChronoDuration::seconds(60 * 5 + 1));
    let report = relay.sweep_now().unwrap();
    assert_eq!(report.restarts_queued, 0);
    assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 1);

    assert!(!relay.stop_subscription("unknown").unwrap());
}

#[test]
fn removed_subscription_leaves_no_trace() {
    let (relay, _, upstream) = relay();
    relay.start_subscription(push_descriptor("ruter-et")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));

    let removed = relay.remove_subscription("ruter-et").unwrap().unwrap();
    assert_eq!(removed.vendor, "ruter");
    assert!(!relay.registry().is_registered("ruter-et").unwrap());
    assert_eq!(upstream.terminated.lock().unwrap().last().unwrap(), "ruter-et");

    let err = relay.ingest("ruter-et", journeys(1)).unwrap_err();
    assert!(matches!(err, RelayError::Registry(RegistryError::NotFound { .. })));
}

#[test]
fn malformed_descriptor_is_never_registered() {
    let (relay, _, upstream) = relay();
    let mut descriptor = push_descriptor("broken");
    descriptor.transforms.push(AdapterSpec::Preset {
        name: "does-not-exist".to_string(),
    });

    let err = relay.start_subscription(descriptor).unwrap_err();
    assert!(err.is_config());
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    assert!(!relay.registry().is_registered("broken").unwrap());
    assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 0);
}

#[test]
fn silent_polled_provider_stays_unhealthy_across_sweeps() {
    let (relay, clock, _) = relay();
    relay.start_subscription(poll_descriptor("ruter-et")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    relay.ingest("ruter-et", journeys(1)).unwrap();

    clock.advance(ChronoDuration::seconds(60 * 5 + 1));
    let first = relay.sweep_now().unwrap();
    assert_eq!(first.unhealthy, 1);
    assert_eq!(first.restarts_queued, 1);
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    assert_eq!(relay.registry().phase("ruter-et").unwrap(), Some(SubscriptionPhase::Active));

    clock.advance(ChronoDuration::hours(10));
    let second = relay.sweep_now().unwrap();
    assert_eq!(second.unhealthy, 1);
    assert_eq!(second.restarts_queued, 1);
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    assert_eq!(relay.registry().health("ruter-et").unwrap(), HealthVerdict::Stale);

    // Fresh data makes it healthy again.
    relay.ingest("ruter-et", journeys(1)).unwrap();
    assert!(relay.registry().is_healthy("ruter-et").unwrap());
}

#[test]
fn starting_a_running_subscription_is_rejected() {
    let (relay, _, upstream) = relay();
    relay.start_subscription(push_descriptor("dup")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    relay.ingest("dup", journeys(1)).unwrap();

    let err = relay.start_subscription(push_descriptor("dup")).unwrap_err();
    assert!(matches!(
        err,
        RelayError::Registry(RegistryError::AlreadyExists {
            phase: SubscriptionPhase::Active,
            ..
        })
    ));
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().phase("dup").unwrap(), Some(SubscriptionPhase::Active));

    // Still waiting for its first delivery: also rejected.
    assert!(relay.start_subscription(push_descriptor("pending")).is_ok());
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    assert!(relay.start_subscription(push_descriptor("pending")).is_err());
    assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 2);
}

#[test]
fn stopped_subscription_can_be_started_again() {
    let (relay, _, upstream) = relay();
    relay.start_subscription(push_descriptor("ruter-et")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    assert!(relay.stop_subscription("ruter-et").unwrap());

    relay.start_subscription(push_descriptor("ruter-et")).unwrap();
    assert!(relay.monitor().wait_idle(Duration::from_secs(2)));
    assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 2);
    assert_eq!(relay.monitor().desired().len(), 1);
}
