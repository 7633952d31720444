use serde::{Deserialize, Serialize};

use super::kind::DataKind;
use super::reference::{IdField, ObjectRef};
use super::records::{EstimatedJourney, ProductionTimetable, Situation, VehicleActivity};

/// A bundle of records of any kind, as received from upstream or delivered
/// downstream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub situations: Vec<Situation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub estimated_journeys: Vec<EstimatedJourney>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vehicle_activities: Vec<VehicleActivity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub production_timetables: Vec<ProductionTimetable>,
}

impl Payload {
    /// True when the payload carries no records of any kind.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.situations.is_empty()
            && self.estimated_journeys.is_empty()
            && self.vehicle_activities.is_empty()
            && self.production_timetables.is_empty()
    }

    /// Number of top-level records across all kinds.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.situations.len()
            + self.estimated_journeys.len()
            + self.vehicle_activities.len()
            + self.production_timetables.len()
    }

    /// Number of records of one kind.
    #[must_use]
    pub fn count_of(&self, kind: DataKind) -> usize {
        match kind {
            DataKind::Situation => self.situations.len(),
            DataKind::EstimatedTimetable => self.estimated_journeys.len(),
            DataKind::VehicleMonitoring => self.vehicle_activities.len(),
            DataKind::ProductionTimetable => self.production_timetables.len(),
        }
    }

    /// Kinds that have at least one record, in delivery order.
    #[must_use]
    pub fn kinds(&self) -> Vec<DataKind> {
        DataKind::ALL
            .into_iter()
            .filter(|kind| self.count_of(*kind) > 0)
            .collect()
    }

    /// Moves every record of `other` into `self`.
    pub fn append(&mut self, mut other: Self) {
        self.situations.append(&mut other.situations);
        self.estimated_journeys.append(&mut other.estimated_journeys);
        self.vehicle_activities.append(&mut other.vehicle_activities);
        self.production_timetables
            .append(&mut other.production_timetables);
    }

    /// Visits every identifier reference in every record.
    pub fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        for s in &mut self.situations {
            s.visit_refs_mut(f);
        }
        for j in &mut self.estimated_journeys {
            j.visit_refs_mut(f);
        }
        for v in &mut self.vehicle_activities {
            v.visit_refs_mut(f);
        }
        for p in &mut self.production_timetables {
            p.visit_refs_mut(f);
        }
    }
}
