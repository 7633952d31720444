//! Heartbeat-driven upstream polling.
//!
//! Each scheduled subscription gets its own timer thread. Polled
//! subscriptions fetch and ingest on every tick; pushed subscriptions with a
//! check-status endpoint ask the provider whether it restarted. A failed
//! cycle is logged and the next tick simply tries again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, info, warn};

use crate::error::RelayResult;
use crate::ingest::{IngestReport, Ingestor};
use crate::observability as events;

use super::descriptor::{RequestPurpose, SubscriptionDescriptor, SubscriptionMode};
use super::registry::{SubscriptionPhase, SubscriptionRegistry};
use super::upstream::UpstreamClient;

/// Result of one scheduled cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not registered, inactive, or pending a handshake.
    Skipped,
    Fetched(IngestReport),
    /// Status checked; false when the provider restarted underneath us.
    StatusChecked { healthy: bool },
}

struct SchedulerShared {
    registry: Arc<SubscriptionRegistry>,
    upstream: Arc<dyn UpstreamClient>,
    ingestor: Arc<Ingestor>,
    request_timeout: Duration,
}

impl SchedulerShared {
    fn cycle(&self, id: &str) -> RelayResult<CycleOutcome> {
        let Some(entry) = self.registry.entry(id)? else {
            debug!(subscription_id = id, "not registered, skipping cycle");
            return Ok(CycleOutcome::Skipped);
        };
        let descriptor = entry.descriptor;
        if !descriptor.active {
            return Ok(CycleOutcome::Skipped);
        }

        match descriptor.mode {
            SubscriptionMode::RequestResponse => {
                let payload = match self.upstream.fetch(&descriptor, self.request_timeout) {
                    Ok(payload) => payload,
                    Err(e) => {
                        if e.is_unreachable() || e.is_transient() {
                            info!(event = events::UPSTREAM_FETCH_FAILED, subscription_id = id, error = %e, "fetch failed");
                        } else {
                            warn!(event = events::UPSTREAM_FETCH_FAILED, subscription_id = id, error = %e, "fetch failed");
                        }
                        return Err(e.into());
                    }
                };
                debug!(
                    event = events::UPSTREAM_FETCH_OK,
                    subscription_id = id,
                    elements = payload.element_count(),
                    "fetched"
                );
                Ok(CycleOutcome::Fetched(self.ingestor.ingest(id, payload)?))
            }
            SubscriptionMode::Subscribe => {
                if entry.state.phase != SubscriptionPhase::Active
                    || !descriptor.has_endpoint(RequestPurpose::CheckStatus)
                {
                    return Ok(CycleOutcome::Skipped);
                }
                let status = match self.upstream.check_status(&descriptor, self.request_timeout) {
                    Ok(status) => status,
                    Err(e) => {
                        info!(event = events::UPSTREAM_STATUS_FAILED, subscription_id = id, error = %e, "check status failed");
                        return Err(e.into());
                    }
                };
                let healthy = match status.service_started_at {
                    Some(started) => self.registry.touch_with_service_start(id, started)?,
                    None => true,
                };
                debug!(event = events::UPSTREAM_STATUS_OK, subscription_id = id, healthy, "status checked");
                Ok(CycleOutcome::StatusChecked { healthy })
            }
        }
    }
}

struct Timer {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs one timer thread per scheduled subscription.
pub struct SubscriptionScheduler {
    shared: Arc<SchedulerShared>,
    timers: Mutex<HashMap<String, Timer>>,
}

impl std::fmt::Debug for SubscriptionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionScheduler")
            .field("scheduled", &self.scheduled())
            .finish_non_exhaustive()
    }
}

impl SubscriptionScheduler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        upstream: Arc<dyn UpstreamClient>,
        ingestor: Arc<Ingestor>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                registry,
                upstream,
                ingestor,
                request_timeout,
            }),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the timer for `descriptor`, replacing any existing one.
    ///
    /// Returns false when the descriptor needs no timer: inactive, or pushed
    /// without a check-status endpoint.
    pub fn schedule(&self, descriptor: &SubscriptionDescriptor) -> bool {
        self.unschedule(&descriptor.subscription_id);
        let needs_timer = descriptor.active
            && (descriptor.mode == SubscriptionMode::RequestResponse
                || descriptor.has_endpoint(RequestPurpose::CheckStatus));
        if !needs_timer {
            return false;
        }

        let id = descriptor.subscription_id.clone();
        let interval = descriptor.heartbeat_interval;
        let shared = Arc::clone(&self.shared);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_id = id.clone();
        let handle = thread::Builder::new()
            .name(format!("relay-sub-{id}"))
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            match shared.cycle(&thread_id) {
                                Ok(outcome) => debug!(subscription_id = %thread_id, ?outcome, "cycle finished"),
                                Err(e) => debug!(subscription_id = %thread_id, error = %e, "cycle failed, retrying next tick"),
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn subscription timer");

        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Timer { stop_tx, handle });
        true
    }

    /// Stops the timer of `id`, waiting for a running cycle to finish.
    pub fn unschedule(&self, id: &str) -> bool {
        let timer = self.timers.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        match timer {
            Some(timer) => {
                drop(timer.stop_tx);
                let _ = timer.handle.join();
                true
            }
            None => false,
        }
    }

    /// Ids with a running timer, sorted.
    #[must_use]
    pub fn scheduled(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Runs one cycle for `id` on the calling thread.
    pub fn run_cycle(&self, id: &str) -> RelayResult<CycleOutcome> {
        self.shared.cycle(id)
    }
}

impl Drop for SubscriptionScheduler {
    fn drop(&mut self) {
        let timers: Vec<Timer> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        for timer in &timers {
            let _ = timer.stop_tx.send(());
        }
        for timer in timers {
            let _ = timer.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    use super::*;
    use crate::entity::EntityStores;
    use crate::error::UpstreamError;
    use crate::model::{DataKind, ObjectRef, Payload, Situation};
    use crate::subscription::{HealthVerdict, ServiceStatus};
    use crate::time::{Clock, ManualClock};
    use crate::transform::TransformRegistry;
    use crate::validation::ValidationSuite;

    struct ScriptedUpstream {
        fetches: AtomicUsize,
        fail_fetch: bool,
        started_at: Option<DateTime<Utc>>,
    }

    impl UpstreamClient for ScriptedUpstream {
        fn subscribe(&self, _: &SubscriptionDescriptor, _: Duration) -> Result<(), UpstreamError> {
            Ok(())
        }

        fn check_status(&self, _: &SubscriptionDescriptor, _: Duration) -> Result<ServiceStatus, UpstreamError> {
            Ok(ServiceStatus {
                service_started_at: self.started_at,
            })
        }

        fn terminate(&self, _: &SubscriptionDescriptor, _: Duration) -> Result<(), UpstreamError> {
            Ok(())
        }

        fn fetch(&self, descriptor: &SubscriptionDescriptor, _: Duration) -> Result<Payload, UpstreamError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch {
                return Err(UpstreamError::Unreachable {
                    endpoint: descriptor.endpoint(RequestPurpose::Fetch).unwrap_or("").to_string(),
                    message: "connection refused".to_string(),
                });
            }
            let mut payload = Payload::default();
            payload.situations.push(Situation {
                situation_number: format!("SX-{n}"),
                participant_ref: Some(ObjectRef::new("RUT")),
                ..Situation::default()
            });
            Ok(payload)
        }
    }

    fn scheduler(upstream: ScriptedUpstream) -> (SubscriptionScheduler, Arc<SubscriptionRegistry>, Arc<ManualClock>) {
        let manual = Arc::new(ManualClock::new(Utc::now()));
        let clock: Arc<dyn Clock> = manual.clone();
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&clock)));
        let stores = Arc::new(EntityStores::new(4, clock));
        let ingestor = Arc::new(Ingestor::new(
            stores,
            Arc::clone(&registry),
            Arc::new(TransformRegistry::new()),
            ValidationSuite::default(),
        ));
        let scheduler = SubscriptionScheduler::new(
            Arc::clone(&registry),
            Arc::new(upstream),
            ingestor,
            Duration::from_millis(100),
        );
        (scheduler, registry, manual)
    }

    fn polled() -> SubscriptionDescriptor {
        SubscriptionDescriptor::builder("sx-poll", "RUT", DataKind::Situation)
            .endpoint(RequestPurpose::Fetch, "http://provider/sx")
            .build()
            .unwrap()
    }

    fn pushed() -> SubscriptionDescriptor {
        SubscriptionDescriptor::builder("et-push", "RUT", DataKind::EstimatedTimetable)
            .mode(SubscriptionMode::Subscribe)
            .endpoint(RequestPurpose::Subscribe, "http://provider/subscribe")
            .endpoint(RequestPurpose::CheckStatus, "http://provider/status")
            .heartbeat_interval(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unregistered_cycle_skips() {
        let (scheduler, _, _) = scheduler(ScriptedUpstream {
            fetches: AtomicUsize::new(0),
            fail_fetch: false,
            started_at: None,
        });
        assert_eq!(scheduler.run_cycle("sx-poll").unwrap(), CycleOutcome::Skipped);
    }

    #[test]
    fn test_polled_cycle_fetches_and_ingests() {
        let (scheduler, registry, _) = scheduler(ScriptedUpstream {
            fetches: AtomicUsize::new(0),
            fail_fetch: false,
            started_at: None,
        });
        registry.register(polled()).unwrap();

        let CycleOutcome::Fetched(report) = scheduler.run_cycle("sx-poll").unwrap() else {
            panic!("expected a fetch");
        };
        assert_eq!(report.merge.inserted, 1);
        assert_eq!(registry.entry("sx-poll").unwrap().unwrap().state.hits, 1);
    }

    #[test]
    fn test_unreachable_fetch_is_reported_not_fatal() {
        let (scheduler, registry, _) = scheduler(ScriptedUpstream {
            fetches: AtomicUsize::new(0),
            fail_fetch: true,
            started_at: None,
        });
        registry.register(polled()).unwrap();

        let err = scheduler.run_cycle("sx-poll").unwrap_err();
        assert!(err.is_unreachable());
        // The next cycle is attempted as usual.
        assert!(scheduler.run_cycle("sx-poll").is_err());
    }

    #[test]
    fn test_status_check_detects_provider_restart() {
        let restarted = Utc::now() + ChronoDuration::hours(1);
        let (scheduler, registry, clock) = scheduler(ScriptedUpstream {
            fetches: AtomicUsize::new(0),
            fail_fetch: false,
            started_at: Some(restarted),
        });
        registry.register(pushed()).unwrap();
        registry.touch("et-push").unwrap();
        clock.set(restarted + ChronoDuration::seconds(5));

        let outcome = scheduler.run_cycle("et-push").unwrap();
        assert_eq!(outcome, CycleOutcome::StatusChecked { healthy: false });
        assert_eq!(registry.health("et-push").unwrap(), HealthVerdict::Stale);
    }

    #[test]
    fn test_pending_pushed_subscription_is_not_checked() {
        let (scheduler, registry, _) = scheduler(ScriptedUpstream {
            fetches: AtomicUsize::new(0),
            fail_fetch: false,
            started_at: None,
        });
        registry.mark_pending(pushed()).unwrap();
        assert_eq!(scheduler.run_cycle("et-push").unwrap(), CycleOutcome::Skipped);
    }

    #[test]
    fn test_schedule_and_unschedule() {
        let (scheduler, _, _) = scheduler(ScriptedUpstream {
            fetches: AtomicUsize::new(0),
            fail_fetch: false,
            started_at: None,
        });
        assert!(scheduler.schedule(&polled()));
        assert!(scheduler.schedule(&pushed()));
        assert_eq!(scheduler.scheduled(), vec!["et-push".to_string(), "sx-poll".to_string()]);

        assert!(scheduler.unschedule("sx-poll"));
        assert!(!scheduler.unschedule("sx-poll"));

        let mut without_status = pushed();
        without_status.endpoints.remove(&RequestPurpose::CheckStatus);
        assert!(!scheduler.schedule(&without_status));
        assert!(scheduler.scheduled().is_empty());
    }

    #[test]
    fn test_timer_fires_on_heartbeat() {
        let upstream = ScriptedUpstream {
            fetches: AtomicUsize::new(0),
            fail_fetch: false,
            started_at: None,
        };
        let (scheduler, registry, _) = scheduler(upstream);
        let mut descriptor = polled();
        descriptor.heartbeat_interval = Duration::from_millis(20);
        registry.register(descriptor.clone()).unwrap();
        scheduler.schedule(&descriptor);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while registry.entry("sx-poll").unwrap().unwrap().state.hits < 2 {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(5));
        }
        drop(scheduler);
    }
}
