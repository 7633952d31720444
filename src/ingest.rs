//! Inbound path: from a provider payload to merged records.
//!
//! `ingest` runs the same steps for pushed and polled data:
//! registry touch, validation, the subscription's transformation chain,
//! merge into the entity stores, object counting and change notification.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::entity::{EntityStores, MergeSummary};
use crate::error::{RegistryError, RelayResult};
use crate::model::{DataKind, Payload};
use crate::observability as events;
use crate::subscription::{SubscriptionDescriptor, SubscriptionRegistry};
use crate::transform::{AdapterSpec, TransformChain, TransformRegistry};
use crate::validation::{ValidationReport, ValidationSuite};

/// Notified after an ingest changed stored records.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, dataset_id: &str, kinds: &[DataKind]);
}

/// What one ingest did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub subscription_id: String,
    pub dataset_id: String,
    /// Records in the payload as received.
    pub received: usize,
    pub validation: ValidationReport,
    /// Values rewritten by the ingest chain.
    pub transformed: usize,
    pub merge: MergeSummary,
}

type CachedChain = (Vec<AdapterSpec>, Arc<TransformChain>);

pub struct Ingestor {
    stores: Arc<EntityStores>,
    registry: Arc<SubscriptionRegistry>,
    transforms: Arc<TransformRegistry>,
    validation: ValidationSuite,
    chains: RwLock<HashMap<String, CachedChain>>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    pub fn new(
        stores: Arc<EntityStores>,
        registry: Arc<SubscriptionRegistry>,
        transforms: Arc<TransformRegistry>,
        validation: ValidationSuite,
    ) -> Self {
        Self {
            stores,
            registry,
            transforms,
            validation,
            chains: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Accepts a payload delivered for `subscription_id`.
    ///
    /// Unknown subscriptions are rejected with `NotFound` and nothing is
    /// merged. An empty payload still counts as a heartbeat.
    pub fn ingest(&self, subscription_id: &str, mut payload: Payload) -> RelayResult<IngestReport> {
        let Some(descriptor) = self.registry.get(subscription_id)? else {
            warn!(
                event = events::INGEST_UNKNOWN_SUBSCRIPTION,
                subscription_id,
                elements = payload.element_count(),
                "payload for unknown subscription"
            );
            return Err(RegistryError::NotFound {
                id: subscription_id.to_string(),
            }
            .into());
        };
        self.registry.touch(subscription_id)?;

        let received = payload.element_count();
        let validation = self.validation.apply(subscription_id, &mut payload);
        let chain = self.chain_for(&descriptor)?;
        let transformed = chain.apply(&mut payload).total();
        let kinds = payload.kinds();

        let merge = self.stores.merge_payload(&descriptor.dataset_id, payload)?;
        self.registry.increment_object_counter(subscription_id, received)?;

        if merge.changed() > 0 {
            self.notify(&descriptor.dataset_id, &kinds);
        }

        let report = IngestReport {
            subscription_id: subscription_id.to_string(),
            dataset_id: descriptor.dataset_id,
            received,
            validation,
            transformed,
            merge,
        };
        if received > 0 {
            info!(
                event = events::INGEST_COMPLETE,
                subscription_id,
                dataset_id = %report.dataset_id,
                received,
                rejected = validation.rejected,
                transformed,
                inserted = merge.inserted,
                updated = merge.updated,
                discarded = merge.discarded,
                "payload ingested"
            );
        } else {
            debug!(event = events::INGEST_COMPLETE, subscription_id, "empty payload");
        }
        Ok(report)
    }

    /// Drops the cached chain so the next ingest rebuilds it.
    pub fn invalidate(&self, subscription_id: &str) {
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id);
    }

    fn chain_for(&self, descriptor: &SubscriptionDescriptor) -> RelayResult<Arc<TransformChain>> {
        let id = &descriptor.subscription_id;
        if let Some((specs, chain)) = self
            .chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            if *specs == descriptor.transforms {
                return Ok(Arc::clone(chain));
            }
        }
        let chain = Arc::new(self.transforms.build(&descriptor.transforms)?);
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), (descriptor.transforms.clone(), Arc::clone(&chain)));
        Ok(chain)
    }

    fn notify(&self, dataset_id: &str, kinds: &[DataKind]) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_change(dataset_id, kinds);
        }
    }
}
