//! Periodic health sweep and subscription re-establishment.
//!
//! The sweep itself only reads the registry and enqueues work. Handshakes with
//! providers run on a bounded pool of restart workers, so a provider that
//! hangs until its timeout never delays the sweep or other restarts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::{RegistryError, RelayError, RelayResult};
use crate::observability as events;

use super::descriptor::{RequestPurpose, SubscriptionDescriptor, SubscriptionMode};
use super::registry::{SubscriptionPhase, SubscriptionRegistry};
use super::upstream::UpstreamClient;

/// What one sweep found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub unhealthy: usize,
    /// Unhealthy subscriptions handed to the restart pool.
    pub restarts_queued: usize,
    /// Wanted but unregistered subscriptions handed to the restart pool.
    pub starts_queued: usize,
}

/// Cumulative restart counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartStats {
    pub succeeded: u64,
    pub failed: u64,
    /// Jobs dropped because the queue was full; the next sweep retries them.
    pub dropped: u64,
}

struct RestartJob {
    descriptor: SubscriptionDescriptor,
}

struct MonitorShared {
    registry: Arc<SubscriptionRegistry>,
    upstream: Arc<dyn UpstreamClient>,
    desired: RwLock<HashMap<String, SubscriptionDescriptor>>,
    in_flight: Mutex<HashSet<String>>,
    request_timeout: Duration,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl MonitorShared {
    fn desired(&self, id: &str) -> Option<SubscriptionDescriptor> {
        self.desired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn release(&self, id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Tears down whatever the provider still holds, then subscribes anew.
    fn establish(&self, descriptor: &SubscriptionDescriptor) -> RelayResult<()> {
        match descriptor.mode {
            SubscriptionMode::Subscribe => {
                if descriptor.has_endpoint(RequestPurpose::Delete) {
                    if let Err(e) = self.upstream.terminate(descriptor, self.request_timeout) {
                        debug!(
                            subscription_id = %descriptor.subscription_id,
                            error = %e,
                            "terminate before resubscribe failed"
                        );
                    }
                }
                // Pending first, so a confirmation racing the handshake promotes it.
                self.registry.mark_pending(descriptor.clone())?;
                self.upstream.subscribe(descriptor, self.request_timeout)?;
            }
            SubscriptionMode::RequestResponse => {
                self.registry.reactivate(descriptor.clone())?;
            }
        }
        Ok(())
    }

    fn run(&self, job: RestartJob) {
        let id = job.descriptor.subscription_id.clone();
        // Forgotten while queued.
        let Some(current) = self.desired(&id) else {
            self.release(&id);
            return;
        };
        let result = self.establish(&current);

        match result {
            Ok(()) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(event = events::RESTART_OK, subscription_id = %id, mode = ?current.mode, "subscription established");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if e.is_unreachable() {
                    info!(event = events::RESTART_FAILED, subscription_id = %id, error = %e, "provider unreachable");
                } else {
                    warn!(event = events::RESTART_FAILED, subscription_id = %id, error = %e, "re-establishment failed");
                }
            }
        }
        self.release(&id);
    }
}

#[derive(Clone)]
struct Sweeper {
    shared: Arc<MonitorShared>,
    jobs_tx: Sender<RestartJob>,
    queue_capacity: usize,
}

impl Sweeper {
    fn enqueue(&self, descriptor: SubscriptionDescriptor) -> bool {
        let id = descriptor.subscription_id.clone();
        {
            let mut in_flight = self.shared.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(id.clone()) {
                return false;
            }
        }
        match self.jobs_tx.try_send(RestartJob { descriptor }) {
            Ok(()) => {
                debug!(event = events::RESTART_QUEUED, subscription_id = %id, "restart queued");
                true
            }
            Err(TrySendError::Full(_)) => {
                self.shared.release(&id);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = events::RESTART_QUEUE_FULL,
                    subscription_id = %id,
                    capacity = self.queue_capacity,
                    "restart queue full, retrying next sweep"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.release(&id);
                false
            }
        }
    }

    fn sweep(&self) -> RelayResult<SweepReport> {
        let registry = &self.shared.registry;
        let desired: HashMap<String, SubscriptionDescriptor> = self
            .shared
            .desired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = SweepReport::default();
        for status in registry.snapshot()? {
            report.checked += 1;
            if status.healthy {
                continue;
            }
            report.unhealthy += 1;
            warn!(
                event = events::HEALTH_UNHEALTHY,
                subscription_id = %status.subscription_id,
                verdict = ?status.verdict,
                phase = %status.phase,
                "subscription unhealthy"
            );
            let Some(descriptor) = desired.get(&status.subscription_id) else {
                continue;
            };
            if !descriptor.active {
                continue;
            }
            if let Err(e) = registry.demote(&status.subscription_id) {
                warn!(
                    event = events::HEALTH_UNHEALTHY,
                    subscription_id = %status.subscription_id,
                    error = %e,
                    "demote failed, skipping restart this sweep"
                );
                continue;
            }
            if self.enqueue(descriptor.clone()) {
                report.restarts_queued += 1;
            }
        }

        for descriptor in desired.values().filter(|d| d.active) {
            match registry.is_registered(&descriptor.subscription_id) {
                Ok(false) if self.enqueue(descriptor.clone()) => report.starts_queued += 1,
                Ok(_) => {}
                Err(e) => warn!(
                    subscription_id = %descriptor.subscription_id,
                    error = %e,
                    "registry lookup failed during sweep"
                ),
            }
        }

        debug!(
            event = events::HEALTH_SWEEP,
            checked = report.checked,
            unhealthy = report.unhealthy,
            restarts = report.restarts_queued,
            starts = report.starts_queued,
            "health sweep done"
        );
        Ok(report)
    }
}

/// Watches subscription health and re-establishes failing subscriptions.
///
/// Only subscriptions handed to [`ensure`](Self::ensure) are restarted;
/// entries registered by other means are reported but left alone.
pub struct HealthMonitor {
    sweeper: Sweeper,
    sweep_interval: Duration,
    workers: Vec<JoinHandle<()>>,
    ticker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("sweep_interval", &self.sweep_interval)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates the monitor and its restart workers. Periodic sweeps begin
    /// with [`start`](Self::start).
    pub fn new(
        config: &HealthConfig,
        request_timeout: Duration,
        registry: Arc<SubscriptionRegistry>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        let queue_capacity = config.restart_queue_capacity.max(1);
        let (jobs_tx, jobs_rx) = bounded::<RestartJob>(queue_capacity);

        let shared = Arc::new(MonitorShared {
            registry,
            upstream,
            desired: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            request_timeout,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let workers = (0..config.restart_workers.max(1))
            .map(|idx| {
                let rx: Receiver<RestartJob> = jobs_rx.clone();
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("relay-restart-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            shared.run(job);
                        }
                    })
                    .expect("failed to spawn restart worker")
            })
            .collect();

        Self {
            sweeper: Sweeper {
                shared,
                jobs_tx,
                queue_capacity,
            },
            sweep_interval: config.sweep_interval,
            workers,
            ticker: Mutex::new(None),
        }
    }

    /// Starts periodic sweeps on a dedicated thread. Idempotent.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let sweeper = self.sweeper.clone();
        let interval = self.sweep_interval;
        let handle = thread::Builder::new()
            .name("relay-health-sweep".to_string())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    default(interval) => {
                        if let Err(e) = sweeper.sweep() {
                            warn!(event = events::HEALTH_SWEEP, error = %e, "health sweep failed");
                        }
                    }
                }
            })
            .expect("failed to spawn health sweep");
        *ticker = Some((stop_tx, handle));
    }

    /// Adds a subscription to the wanted set and queues its establishment.
    ///
    /// Returns whether a job was queued. Malformed descriptors are rejected
    /// and never registered. An id that is already wanted fails with
    /// [`RegistryError::AlreadyExists`] and the running subscription is left
    /// untouched.
    pub fn ensure(&self, descriptor: SubscriptionDescriptor) -> RelayResult<bool> {
        descriptor.validate().map_err(RelayError::from)?;
        let id = descriptor.subscription_id.clone();
        {
            let mut desired = self
                .sweeper
                .shared
                .desired
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if desired.contains_key(&id) {
                drop(desired);
                let phase = self
                    .sweeper
                    .shared
                    .registry
                    .phase(&id)?
                    .unwrap_or(SubscriptionPhase::Pending);
                return Err(RegistryError::AlreadyExists { id, phase }.into());
            }
            desired.insert(id, descriptor.clone());
        }
        Ok(descriptor.active && self.sweeper.enqueue(descriptor))
    }

    /// Stops restarting a subscription. The registry entry is left as is.
    pub fn forget(&self, id: &str) -> Option<SubscriptionDescriptor> {
        self.sweeper
            .shared
            .desired
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Descriptors the monitor keeps alive, ordered by id.
    #[must_use]
    pub fn desired(&self) -> Vec<SubscriptionDescriptor> {
        let mut out: Vec<SubscriptionDescriptor> = self
            .sweeper
            .shared
            .desired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        out
    }

    /// Runs one sweep on the calling thread.
    pub fn sweep_now(&self) -> RelayResult<SweepReport> {
        self.sweeper.sweep()
    }

    /// Waits until no restart job is queued or running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self
                .sweeper
                .shared
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[must_use]
    pub fn stats(&self) -> RestartStats {
        let shared = &self.sweeper.shared;
        RestartStats {
            succeeded: shared.succeeded.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        // Stop the ticker first: it holds a sender clone.
        let ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((stop_tx, handle)) = ticker {
            drop(stop_tx);
            let _ = handle.join();
        }

        let (dummy_tx, _) = bounded::<RestartJob>(1);
        drop(std::mem::replace(&mut self.sweeper.jobs_tx, dummy_tx));
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
