//! Entity stores: the consolidated current state, one store per data kind.

mod cursor;
mod merge;
mod record;
mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;

use crate::model::{
    DataKind, EstimatedJourney, Payload, ProductionTimetable, Situation, VehicleActivity,
};
use crate::storage::StorageError;
use crate::time::Clock;

pub use cursor::ChangeCursor;
pub use merge::{accepts, merge_by_order, normalize_calls};
pub use record::TransitRecord;
pub use store::{EntityStore, MergeOutcome, RecordKey, StoredRecord};

/// Per-outcome counts of a batch merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub discarded: usize,
    pub ignored: usize,
}

impl MergeSummary {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Discarded => self.discarded += 1,
            MergeOutcome::Ignored => self.ignored += 1,
        }
    }

    /// Records that changed the store.
    #[must_use]
    pub const fn changed(&self) -> usize {
        self.inserted + self.updated
    }

    fn add(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.discarded += other.discarded;
        self.ignored += other.ignored;
    }
}

/// The four entity stores behind one handle.
#[derive(Debug)]
pub struct EntityStores {
    pub situations: EntityStore<Situation>,
    pub estimated_journeys: EntityStore<EstimatedJourney>,
    pub vehicle_activities: EntityStore<VehicleActivity>,
    pub production_timetables: EntityStore<ProductionTimetable>,
}

fn merge_all<R: TransitRecord>(
    store: &EntityStore<R>,
    dataset_id: &str,
    records: Vec<R>,
) -> Result<MergeSummary, StorageError> {
    let mut summary = MergeSummary::default();
    for record in records {
        summary.record(store.merge(dataset_id, Some(record))?);
    }
    Ok(summary)
}

impl EntityStores {
    /// In-memory stores sharing one clock.
    #[must_use]
    pub fn new(shards: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            situations: EntityStore::with_shards(shards, Arc::clone(&clock)),
            estimated_journeys: EntityStore::with_shards(shards, Arc::clone(&clock)),
            vehicle_activities: EntityStore::with_shards(shards, Arc::clone(&clock)),
            production_timetables: EntityStore::with_shards(shards, clock),
        }
    }

    /// Merges every record of a payload into its kind's store.
    pub fn merge_payload(&self, dataset_id: &str, mut payload: Payload) -> Result<MergeSummary, StorageError> {
        let mut summary = MergeSummary::default();
        summary.add(merge_all(&self.situations, dataset_id, Situation::take_from(&mut payload))?);
        summary.add(merge_all(
            &self.vehicle_activities,
            dataset_id,
            VehicleActivity::take_from(&mut payload),
        )?);
        summary.add(merge_all(
            &self.estimated_journeys,
            dataset_id,
            EstimatedJourney::take_from(&mut payload),
        )?);
        summary.add(merge_all(
            &self.production_timetables,
            dataset_id,
            ProductionTimetable::take_from(&mut payload),
        )?);
        Ok(summary)
    }

    /// Changes since `requestor_id` last polled, for the given kinds.
    pub fn changes_since(
        &self,
        kinds: &[DataKind],
        requestor_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Payload, StorageError> {
        let mut payload = Payload::default();
        for kind in kinds {
            match kind {
                DataKind::Situation => Situation::extend_into(
                    self.situations.get_changes_since(requestor_id, dataset_id)?,
                    &mut payload,
                ),
                DataKind::EstimatedTimetable => EstimatedJourney::extend_into(
                    self.estimated_journeys.get_changes_since(requestor_id, dataset_id)?,
                    &mut payload,
                ),
                DataKind::VehicleMonitoring => VehicleActivity::extend_into(
                    self.vehicle_activities.get_changes_since(requestor_id, dataset_id)?,
                    &mut payload,
                ),
                DataKind::ProductionTimetable => ProductionTimetable::extend_into(
                    self.production_timetables.get_changes_since(requestor_id, dataset_id)?,
                    &mut payload,
                ),
            }
        }
        Ok(payload)
    }

    /// Full current state for the given kinds.
    pub fn snapshot(&self, kinds: &[DataKind], dataset_id: Option<&str>) -> Result<Payload, StorageError> {
        let mut payload = Payload::default();
        for kind in kinds {
            match kind {
                DataKind::Situation => {
                    Situation::extend_into(self.situations.get_all(dataset_id)?, &mut payload);
                }
                DataKind::EstimatedTimetable => {
                    EstimatedJourney::extend_into(self.estimated_journeys.get_all(dataset_id)?, &mut payload);
                }
                DataKind::VehicleMonitoring => {
                    VehicleActivity::extend_into(self.vehicle_activities.get_all(dataset_id)?, &mut payload);
                }
                DataKind::ProductionTimetable => {
                    ProductionTimetable::extend_into(self.production_timetables.get_all(dataset_id)?, &mut payload);
                }
            }
        }
        Ok(payload)
    }

    /// Removes every record of a dataset from the given kinds' stores.
    pub fn clear_dataset(&self, kinds: &[DataKind], dataset_id: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for kind in kinds {
            removed += match kind {
                DataKind::Situation => self.situations.clear_by_dataset(dataset_id)?,
                DataKind::EstimatedTimetable => self.estimated_journeys.clear_by_dataset(dataset_id)?,
                DataKind::VehicleMonitoring => self.vehicle_activities.clear_by_dataset(dataset_id)?,
                DataKind::ProductionTimetable => self.production_timetables.clear_by_dataset(dataset_id)?,
            };
        }
        Ok(removed)
    }

    /// Record counts per kind.
    pub fn counts(&self) -> Result<BTreeMap<DataKind, usize>, StorageError> {
        let mut out = BTreeMap::new();
        out.insert(DataKind::Situation, self.situations.len()?);
        out.insert(DataKind::EstimatedTimetable, self.estimated_journeys.len()?);
        out.insert(DataKind::VehicleMonitoring, self.vehicle_activities.len()?);
        out.insert(DataKind::ProductionTimetable, self.production_timetables.len()?);
        Ok(out)
    }

    /// Drops idle cursors in every store.
    pub fn expire_idle_cursors(&self, max_idle: Duration) -> Result<usize, StorageError> {
        Ok(self.situations.expire_idle_cursors(max_idle)?
            + self.estimated_journeys.expire_idle_cursors(max_idle)?
            + self.vehicle_activities.expire_idle_cursors(max_idle)?
            + self.production_timetables.expire_idle_cursors(max_idle)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::ObjectRef;
    use crate::time::ManualClock;

    fn stores() -> EntityStores {
        EntityStores::new(4, Arc::new(ManualClock::new(Utc::now())))
    }

    fn mixed_payload() -> Payload {
        let mut payload = Payload::default();
        payload.situations.push(Situation {
            situation_number: "SX-1".to_string(),
            recorded_at: Some(Utc::now()),
            ..Situation::default()
        });
        payload.vehicle_activities.push(VehicleActivity {
            vehicle_ref: ObjectRef::new("bus-7"),
            recorded_at: Some(Utc::now()),
            ..VehicleActivity::default()
        });
        payload.estimated_journeys.push(EstimatedJourney {
            journey_ref: "J1".to_string(),
            ..EstimatedJourney::default()
        });
        payload
    }

    #[test]
    fn test_merge_payload_routes_by_kind() {
        let stores = stores();
        let summary = stores.merge_payload("RUT", mixed_payload()).unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.changed(), 3);

        let counts = stores.counts().unwrap();
        assert_eq!(counts[&DataKind::Situation], 1);
        assert_eq!(counts[&DataKind::VehicleMonitoring], 1);
        assert_eq!(counts[&DataKind::EstimatedTimetable], 1);
        assert_eq!(counts[&DataKind::ProductionTimetable], 0);
    }

    #[test]
    fn test_changes_since_only_requested_kinds() {
        let stores = stores();
        stores.merge_payload("RUT", mixed_payload()).unwrap();

        let delta = stores
            .changes_since(&[DataKind::Situation], "consumer", None)
            .unwrap();
        assert_eq!(delta.element_count(), 1);

        // Cursors are per kind: the journey feed is still unread.
        let delta = stores
            .changes_since(&DataKind::ALL, "consumer", None)
            .unwrap();
        assert_eq!(delta.situations.len(), 0);
        assert_eq!(delta.vehicle_activities.len(), 1);
        assert_eq!(delta.estimated_journeys.len(), 1);
    }

    #[test]
    fn test_clear_dataset_across_kinds() {
        let stores = stores();
        stores.merge_payload("RUT", mixed_payload()).unwrap();
        stores.merge_payload("ATB", mixed_payload()).unwrap();

        assert_eq!(stores.clear_dataset(&DataKind::ALL, "RUT").unwrap(), 3);
        assert_eq!(stores.snapshot(&DataKind::ALL, None).unwrap().element_count(), 3);
    }
}
