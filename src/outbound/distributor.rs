//! Push delivery of store changes to registered targets.
//!
//! A trigger only enqueues a job; delivery workers run the attempt:
//! build the change payload from the target's cursor, filter it, apply the
//! target's egress id policy, split it into bounded chunks and send each chunk
//! independently. Triggers for a target that is already queued coalesce, and
//! attempts for the same target never overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OutboundConfig;
use crate::entity::EntityStores;
use crate::error::{ConfigError, DeliveryError, RelayResult};
use crate::ingest::ChangeListener;
use crate::model::{DataKind, Payload};
use crate::observability as events;
use crate::time::Clock;
use crate::transform::TransformRegistry;

use super::split::split;
use super::target::{ChannelPolicy, OutboundTarget};
use super::transport::{ChannelProvider, DeliveryChannel, DeliveryContext, PayloadCodec};

/// What one delivery attempt did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub target_id: String,
    /// Changed records read from the store.
    pub built: usize,
    pub filtered_out: usize,
    /// Record count of each chunk, in send order.
    pub chunk_sizes: Vec<usize>,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    /// True when filtering left nothing to send.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.chunk_sizes.is_empty()
    }
}

/// Cumulative distributor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributorStats {
    pub attempts: u64,
    pub skipped_empty: u64,
    pub chunks_delivered: u64,
    pub chunks_failed: u64,
    /// Triggers rejected because the job queue was full.
    pub dropped_triggers: u64,
}

type ChannelCache = HashMap<(String, ChannelPolicy), Arc<dyn DeliveryChannel>>;

struct TargetSlot {
    target: Arc<OutboundTarget>,
    queued: AtomicBool,
    running: Mutex<()>,
}

struct DeliveryJob {
    target_id: String,
}

struct DistributorShared {
    stores: Arc<EntityStores>,
    transforms: Arc<TransformRegistry>,
    codec: Arc<dyn PayloadCodec>,
    provider: Arc<dyn ChannelProvider>,
    clock: Arc<dyn Clock>,
    max_elements: usize,
    delivery_timeout: Duration,
    targets: RwLock<HashMap<String, Arc<TargetSlot>>>,
    pending: AtomicUsize,
    attempts: AtomicU64,
    skipped_empty: AtomicU64,
    chunks_delivered: AtomicU64,
    chunks_failed: AtomicU64,
    dropped_triggers: AtomicU64,
}

impl DistributorShared {
    fn slot(&self, id: &str) -> Option<Arc<TargetSlot>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn run(&self, job: DeliveryJob, channels: &mut ChannelCache) {
        if let Some(slot) = self.slot(&job.target_id) {
            // Cleared before building, so changes merged from here on trigger again.
            slot.queued.store(false, Ordering::SeqCst);
            match self.attempt(&slot, channels) {
                Ok(report) => debug!(
                    target_id = %job.target_id,
                    delivered = report.delivered,
                    failed = report.failed,
                    "delivery attempt finished"
                ),
                Err(e) => debug!(target_id = %job.target_id, error = %e, "delivery attempt aborted"),
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn attempt(&self, slot: &TargetSlot, channels: &mut ChannelCache) -> RelayResult<DeliveryReport> {
        let _running = slot.running.lock().unwrap_or_else(PoisonError::into_inner);
        let target = &slot.target;
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let mut payload = match self.stores.changes_since(
            &target.kinds,
            &target.requestor_id(),
            target.dataset_id.as_deref(),
        ) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event = events::DELIVERY_BUILD_FAILED, target_id = %target.id, error = %e, "failed to build delivery");
                return Err(e.into());
            }
        };

        let mut report = DeliveryReport {
            target_id: target.id.clone(),
            built: payload.element_count(),
            ..DeliveryReport::default()
        };

        report.filtered_out = target.filter.apply(&mut payload);
        if payload.is_empty() {
            self.skipped_empty.fetch_add(1, Ordering::Relaxed);
            debug!(
                event = events::DELIVERY_SKIPPED_EMPTY,
                target_id = %target.id,
                built = report.built,
                "nothing to deliver"
            );
            return Ok(report);
        }

        self.transforms.egress(target.id_policy).apply(&mut payload);

        let chunks = split(payload, target.chunk_limit(self.max_elements));
        let chunk_count = chunks.len();
        if chunk_count > 1 {
            debug!(event = events::DELIVERY_SPLIT, target_id = %target.id, chunks = chunk_count, "payload split");
        }

        let produced_at = self.clock.now();
        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            report.chunk_sizes.push(chunk.element_count());
            let context = DeliveryContext {
                message_id: Uuid::new_v4(),
                target_id: target.id.clone(),
                dataset_id: target.dataset_id.clone(),
                id_policy: target.id_policy,
                chunk_index,
                chunk_count,
                produced_at,
            };
            match self.deliver_chunk(target, &chunk, &context, channels) {
                Ok(()) => {
                    report.delivered += 1;
                    self.chunks_delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        event = events::DELIVERY_CHUNK_OK,
                        target_id = %target.id,
                        chunk = chunk_index + 1,
                        chunks = chunk_count,
                        elements = chunk.element_count(),
                        "chunk delivered"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    self.chunks_failed.fetch_add(1, Ordering::Relaxed);
                    if e.is_unreachable() {
                        info!(
                            event = events::DELIVERY_CHUNK_UNREACHABLE,
                            target_id = %target.id,
                            address = %target.address,
                            chunk = chunk_index + 1,
                            "consumer unreachable"
                        );
                    } else {
                        warn!(
                            event = events::DELIVERY_CHUNK_FAILED,
                            target_id = %target.id,
                            address = %target.address,
                            chunk = chunk_index + 1,
                            error = %e,
                            "chunk delivery failed"
                        );
                    }
                }
            }
        }

        debug!(
            event = events::DELIVERY_DONE,
            target_id = %target.id,
            delivered = report.delivered,
            failed = report.failed,
            "delivery attempt done"
        );
        Ok(report)
    }

    fn deliver_chunk(
        &self,
        target: &OutboundTarget,
        chunk: &Payload,
        context: &DeliveryContext,
        channels: &mut ChannelCache,
    ) -> Result<(), DeliveryError> {
        let bytes = self.codec.encode(chunk, context)?;
        let key = (target.address.clone(), target.channel_policy);
        let channel = match channels.get(&key) {
            Some(channel) => Arc::clone(channel),
            None => {
                let channel = self.provider.channel(&target.address, target.channel_policy)?;
                channels.insert(key.clone(), Arc::clone(&channel));
                channel
            }
        };
        if let Err(e) = channel.send(&bytes, self.delivery_timeout) {
            channel.close();
            channels.remove(&key);
            return Err(e);
        }
        Ok(())
    }
}

/// Fans store changes out to push targets.
pub struct OutboundDistributor {
    shared: Arc<DistributorShared>,
    jobs_tx: Sender<DeliveryJob>,
    queue_capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for OutboundDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundDistributor")
            .field("queue_capacity", &self.queue_capacity)
            .field("workers", &self.workers.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl OutboundDistributor {
    pub fn new(
        config: &OutboundConfig,
        stores: Arc<EntityStores>,
        transforms: Arc<TransformRegistry>,
        codec: Arc<dyn PayloadCodec>,
        provider: Arc<dyn ChannelProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        let (jobs_tx, jobs_rx) = bounded::<DeliveryJob>(queue_capacity);

        let shared = Arc::new(DistributorShared {
            stores,
            transforms,
            codec,
            provider,
            clock,
            max_elements: config.max_elements_per_delivery.max(1),
            delivery_timeout: config.delivery_timeout,
            targets: RwLock::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
            skipped_empty: AtomicU64::new(0),
            chunks_delivered: AtomicU64::new(0),
            chunks_failed: AtomicU64::new(0),
            dropped_triggers: AtomicU64::new(0),
        });

        let workers = (0..config.workers.max(1))
            .map(|idx| {
                let rx: Receiver<DeliveryJob> = jobs_rx.clone();
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("relay-outbound-{idx}"))
                    .spawn(move || {
                        let mut channels = ChannelCache::new();
                        while let Ok(job) = rx.recv() {
                            shared.run(job, &mut channels);
                        }
                        for channel in channels.values() {
                            channel.close();
                        }
                    })
                    .expect("failed to spawn outbound worker")
            })
            .collect();

        Self {
            shared,
            jobs_tx,
            queue_capacity,
            workers,
        }
    }

    /// Registers or replaces a target. Returns true if it replaced one.
    pub fn add_target(&self, target: OutboundTarget) -> Result<bool, ConfigError> {
        target.validate()?;
        let id = target.id.clone();
        let slot = Arc::new(TargetSlot {
            target: Arc::new(target),
            queued: AtomicBool::new(false),
            running: Mutex::new(()),
        });
        Ok(self
            .shared
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot)
            .is_some())
    }

    /// Unregisters a target. Queued jobs for it are dropped.
    pub fn remove_target(&self, id: &str) -> Option<OutboundTarget> {
        self.shared
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .map(|slot| (*slot.target).clone())
    }

    /// Registered targets, ordered by id.
    #[must_use]
    pub fn targets(&self) -> Vec<OutboundTarget> {
        let mut out: Vec<OutboundTarget> = self
            .shared
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|slot| (*slot.target).clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Queues a delivery attempt and returns immediately.
    ///
    /// Returns false when an attempt for the target was already queued.
    pub fn trigger(&self, target_id: &str) -> Result<bool, DeliveryError> {
        let slot = self.shared.slot(target_id).ok_or_else(|| DeliveryError::UnknownTarget {
            id: target_id.to_string(),
        })?;
        if slot.queued.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let job = DeliveryJob {
            target_id: target_id.to_string(),
        };
        let err = match self.jobs_tx.try_send(job) {
            Ok(()) => {
                debug!(event = events::DELIVERY_QUEUED, target_id, "delivery queued");
                return Ok(true);
            }
            Err(TrySendError::Full(_)) => {
                self.shared.dropped_triggers.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = events::DELIVERY_QUEUE_FULL,
                    target_id,
                    capacity = self.queue_capacity,
                    "delivery queue full"
                );
                DeliveryError::QueueFull {
                    capacity: self.queue_capacity,
                }
            }
            Err(TrySendError::Disconnected(_)) => DeliveryError::Disconnected {
                path: "outbound_jobs".to_string(),
            },
        };
        slot.queued.store(false, Ordering::SeqCst);
        self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        Err(err)
    }

    /// Triggers every target interested in `kinds` of `dataset_id`.
    /// Returns the number of attempts queued.
    pub fn notify_change(&self, dataset_id: &str, kinds: &[DataKind]) -> usize {
        let interested: Vec<String> = self
            .shared
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| kinds.iter().any(|k| slot.target.wants(dataset_id, *k)))
            .map(|slot| slot.target.id.clone())
            .collect();
        interested
            .iter()
            .filter(|id| matches!(self.trigger(id), Ok(true)))
            .count()
    }

    /// Triggers every target; used for periodic flushes.
    pub fn trigger_all(&self) -> usize {
        let ids: Vec<String> = self
            .shared
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.iter().filter(|id| matches!(self.trigger(id), Ok(true))).count()
    }

    /// Runs a delivery attempt on the calling thread.
    pub fn deliver_now(&self, target_id: &str) -> RelayResult<DeliveryReport> {
        let slot = self.shared.slot(target_id).ok_or_else(|| DeliveryError::UnknownTarget {
            id: target_id.to_string(),
        })?;
        let mut channels = ChannelCache::new();
        let report = self.shared.attempt(&slot, &mut channels);
        for channel in channels.values() {
            channel.close();
        }
        report
    }

    /// Waits until no attempt is queued or running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[must_use]
    pub fn stats(&self) -> DistributorStats {
        let shared = &self.shared;
        DistributorStats {
            attempts: shared.attempts.load(Ordering::Relaxed),
            skipped_empty: shared.skipped_empty.load(Ordering::Relaxed),
            chunks_delivered: shared.chunks_delivered.load(Ordering::Relaxed),
            chunks_failed: shared.chunks_failed.load(Ordering::Relaxed),
            dropped_triggers: shared.dropped_triggers.load(Ordering::Relaxed),
        }
    }
}

impl ChangeListener for OutboundDistributor {
    fn on_change(&self, dataset_id: &str, kinds: &[DataKind]) {
        self.notify_change(dataset_id, kinds);
    }
}

impl Drop for OutboundDistributor {
    fn drop(&mut self) {
        let (dummy_tx, _) = bounded::<DeliveryJob>(1);
        drop(std::mem::replace(&mut self.jobs_tx, dummy_tx));
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
