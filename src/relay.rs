//! The assembled relay.
//!
//! [`Relay`] wires the registry, health monitor, scheduler, entity stores,
//! ingest path and outbound distributor together, and exposes the
//! administrative operations on top of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::entity::EntityStores;
use crate::error::{ConfigError, RegistryError, RelayResult};
use crate::ingest::{IngestReport, Ingestor};
use crate::model::{DataKind, IdPolicy, Payload};
use crate::outbound::{
    ChannelProvider, DeliveryReport, DistributorStats, JsonCodec, OutboundDistributor, OutboundTarget, PayloadCodec,
};
use crate::storage::InMemoryStore;
use crate::subscription::{
    HealthMonitor, RequestPurpose, RestartStats, SubscriptionDescriptor, SubscriptionMode, SubscriptionPhase,
    SubscriptionRegistry, SubscriptionScheduler, SubscriptionStatus, SweepReport, UpstreamClient,
};
use crate::time::{to_chrono, Clock, SystemClock};
use crate::transform::TransformRegistry;
use crate::validation::ValidationSuite;

/// A point-in-time view of the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub subscriptions: Vec<SubscriptionStatus>,
    /// Stored records per kind.
    pub elements: BTreeMap<DataKind, usize>,
    /// Updates discarded as stale, over all kinds.
    pub discarded_stale: u64,
    pub restarts: RestartStats,
    pub delivery: DistributorStats,
}

/// Builder for [`Relay`].
#[must_use]
pub struct RelayBuilder {
    config: RelayConfig,
    upstream: Option<Arc<dyn UpstreamClient>>,
    provider: Option<Arc<dyn ChannelProvider>>,
    codec: Option<Arc<dyn PayloadCodec>>,
    clock: Option<Arc<dyn Clock>>,
    transforms: Option<TransformRegistry>,
    validation: Option<ValidationSuite>,
}

impl RelayBuilder {
    fn new(config: RelayConfig) -> Self {
        Self {
            config,
            upstream: None,
            provider: None,
            codec: None,
            clock: None,
            transforms: None,
            validation: None,
        }
    }

    pub fn upstream(mut self, upstream: Arc<dyn UpstreamClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn channel_provider(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Defaults to [`JsonCodec`].
    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to [`TransformRegistry::with_defaults`]. Config presets are
    /// registered on top.
    pub fn transforms(mut self, transforms: TransformRegistry) -> Self {
        self.transforms = Some(transforms);
        self
    }

    /// Defaults to the built-in validators under the configured policy.
    pub fn validation(mut self, validation: ValidationSuite) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Validates the configuration, assembles the components, registers the
    /// configured targets and starts establishing the configured
    /// subscriptions. Periodic health sweeps begin with [`Relay::start`].
    pub fn build(self) -> RelayResult<Relay> {
        let config = self.config.validate()?;
        let upstream = self.upstream.ok_or_else(|| ConfigError::MissingField {
            field: "upstream client".to_string(),
        })?;
        let provider = self.provider.ok_or_else(|| ConfigError::MissingField {
            field: "channel provider".to_string(),
        })?;
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCodec::default()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut transforms = self.transforms.unwrap_or_else(TransformRegistry::with_defaults);
        for (name, specs) in &config.presets {
            transforms.register_preset(name.clone(), specs.clone())?;
        }
        let transforms = Arc::new(transforms);

        let registry = Arc::new(SubscriptionRegistry::with_backend(
            Arc::new(InMemoryStore::with_shards(config.store.shards)),
            Arc::clone(&clock),
            config.health.healthcheck_factor,
        ));
        let stores = Arc::new(EntityStores::new(config.store.shards, Arc::clone(&clock)));
        let validation = self
            .validation
            .unwrap_or_else(|| ValidationSuite::with_defaults(config.validation));

        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&stores),
            Arc::clone(&registry),
            Arc::clone(&transforms),
            validation,
        ));
        let distributor = Arc::new(OutboundDistributor::new(
            &config.outbound,
            Arc::clone(&stores),
            Arc::clone(&transforms),
            codec,
            provider,
            clock,
        ));
        ingestor.add_listener(distributor.clone());

        let request_timeout = config.upstream.request_timeout;
        let monitor = HealthMonitor::new(&config.health, request_timeout, Arc::clone(&registry), Arc::clone(&upstream));
        let scheduler = SubscriptionScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&upstream),
            Arc::clone(&ingestor),
            request_timeout,
        );

        for target in &config.targets {
            distributor.add_target(target.clone())?;
        }

        let relay = Relay {
            scheduler,
            monitor,
            distributor,
            ingestor,
            stores,
            registry,
            transforms,
            upstream,
            config,
        };
        for descriptor in relay.config.subscriptions.clone() {
            relay.start_subscription(descriptor)?;
        }
        info!(
            subscriptions = relay.config.subscriptions.len(),
            targets = relay.config.targets.len(),
            "relay assembled"
        );
        Ok(relay)
    }
}

/// A running relay.
///
/// Dropping it stops every timer, the health sweep and all workers.
pub struct Relay {
    // Field order is drop order: timers stop before the pools they feed.
    scheduler: SubscriptionScheduler,
    monitor: HealthMonitor,
    distributor: Arc<OutboundDistributor>,
    ingestor: Arc<Ingestor>,
    stores: Arc<EntityStores>,
    registry: Arc<SubscriptionRegistry>,
    transforms: Arc<TransformRegistry>,
    upstream: Arc<dyn UpstreamClient>,
    config: RelayConfig,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("scheduler", &self.scheduler)
            .field("monitor", &self.monitor)
            .field("distributor", &self.distributor)
            .finish_non_exhaustive()
    }
}

impl Relay {
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    /// Starts periodic health sweeps.
    pub fn start(&self) {
        self.monitor.start();
    }

    /// Establishes a subscription and keeps it alive.
    ///
    /// Descriptors with a missing endpoint or an unresolvable transformation
    /// chain are rejected before anything is registered. An id that is already
    /// running fails with [`RegistryError::AlreadyExists`]; a stopped one is
    /// started again.
    pub fn start_subscription(&self, descriptor: SubscriptionDescriptor) -> RelayResult<()> {
        descriptor.validate()?;
        self.transforms.build(&descriptor.transforms)?;
        let id = &descriptor.subscription_id;
        if self.registry.phase(id)? == Some(SubscriptionPhase::Active) {
            return Err(RegistryError::AlreadyExists {
                id: id.clone(),
                phase: SubscriptionPhase::Active,
            }
            .into());
        }
        self.ingestor.invalidate(&descriptor.subscription_id);
        self.monitor.ensure(descriptor.clone())?;
        self.scheduler.schedule(&descriptor);
        Ok(())
    }

    /// Stops a subscription but keeps it registered as pending, so it can be
    /// restarted without reconfiguration. Returns false for unknown ids.
    pub fn stop_subscription(&self, id: &str) -> RelayResult<bool> {
        let descriptor = match self.monitor.forget(id) {
            Some(descriptor) => Some(descriptor),
            None => self.registry.get(id)?,
        };
        self.scheduler.unschedule(id);

        if let Some(descriptor) = &descriptor {
            if descriptor.mode == SubscriptionMode::Subscribe && descriptor.has_endpoint(RequestPurpose::Delete) {
                if let Err(e) = self.upstream.terminate(descriptor, self.config.upstream.request_timeout) {
                    debug!(subscription_id = id, error = %e, "terminate on stop failed");
                }
            }
        }
        self.registry.demote(id)
    }

    /// Stops a subscription and removes every trace of it.
    pub fn remove_subscription(&self, id: &str) -> RelayResult<Option<SubscriptionDescriptor>> {
        self.stop_subscription(id)?;
        self.ingestor.invalidate(id);
        self.registry.destroy(id)
    }

    /// Ingests a payload pushed by a provider.
    pub fn ingest(&self, subscription_id: &str, payload: Payload) -> RelayResult<IngestReport> {
        self.ingestor.ingest(subscription_id, payload)
    }

    /// Registers or replaces a push target.
    pub fn add_target(&self, target: OutboundTarget) -> RelayResult<bool> {
        Ok(self.distributor.add_target(target)?)
    }

    pub fn remove_target(&self, id: &str) -> Option<OutboundTarget> {
        self.distributor.remove_target(id)
    }

    #[must_use]
    pub fn targets(&self) -> Vec<OutboundTarget> {
        self.distributor.targets()
    }

    /// Queues a delivery attempt for one target.
    pub fn trigger_delivery(&self, target_id: &str) -> RelayResult<bool> {
        Ok(self.distributor.trigger(target_id)?)
    }

    /// Runs a delivery attempt for one target on the calling thread.
    pub fn deliver_now(&self, target_id: &str) -> RelayResult<DeliveryReport> {
        self.distributor.deliver_now(target_id)
    }

    /// Queues a delivery attempt for every target.
    pub fn flush_outbound(&self) -> usize {
        self.distributor.trigger_all()
    }

    /// Changes of `kind` since `requestor_id` last polled, with ids
    /// resolved per `policy`.
    pub fn poll(
        &self,
        kind: DataKind,
        requestor_id: &str,
        dataset_id: Option<&str>,
        policy: IdPolicy,
    ) -> RelayResult<Payload> {
        let mut payload = self.stores.changes_since(&[kind], requestor_id, dataset_id)?;
        self.transforms.egress(policy).apply(&mut payload);
        Ok(payload)
    }

    /// Full current state of `kind`, with canonical ids.
    pub fn export(&self, kind: DataKind, dataset_id: Option<&str>) -> RelayResult<Payload> {
        let mut payload = self.stores.snapshot(&[kind], dataset_id)?;
        self.transforms.egress(IdPolicy::Default).apply(&mut payload);
        Ok(payload)
    }

    /// Removes every record of a dataset. Returns the number removed.
    pub fn flush_dataset(&self, dataset_id: &str) -> RelayResult<usize> {
        Ok(self.stores.clear_dataset(&DataKind::ALL, dataset_id)?)
    }

    /// Removes the records a subscription feeds: its kind in its dataset.
    pub fn flush_subscription(&self, id: &str) -> RelayResult<usize> {
        let descriptor = self
            .registry
            .get(id)?
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        Ok(self.stores.clear_dataset(&[descriptor.kind], &descriptor.dataset_id)?)
    }

    pub fn list_subscriptions(&self) -> RelayResult<Vec<SubscriptionStatus>> {
        self.registry.snapshot()
    }

    /// Runs one health sweep on the calling thread.
    pub fn sweep_now(&self) -> RelayResult<SweepReport> {
        self.monitor.sweep_now()
    }

    /// Drops change cursors idle longer than the configured timeout.
    pub fn expire_idle_cursors(&self) -> RelayResult<usize> {
        Ok(self
            .stores
            .expire_idle_cursors(to_chrono(self.config.store.cursor_idle_timeout))?)
    }

    pub fn stats(&self) -> RelayResult<RelayStats> {
        Ok(RelayStats {
            subscriptions: self.registry.snapshot()?,
            elements: self.stores.counts()?,
            discarded_stale: self.stores.situations.discarded()
                + self.stores.estimated_journeys.discarded()
                + self.stores.vehicle_activities.discarded()
                + self.stores.production_timetables.discarded(),
            restarts: self.monitor.stats(),
            delivery: self.distributor.stats(),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn stores(&self) -> &Arc<EntityStores> {
        &self.stores
    }

    #[must_use]
    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn distributor(&self) -> &Arc<OutboundDistributor> {
        &self.distributor
    }

    #[must_use]
    pub fn scheduler(&self) -> &SubscriptionScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
