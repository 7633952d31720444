//! The per-kind record contract used by [`EntityStore`](super::EntityStore).

use chrono::{DateTime, Utc};

use crate::model::{
    DataKind, EstimatedJourney, IdField, ObjectRef, Payload, ProductionTimetable, Situation,
    VehicleActivity,
};

use super::merge::{merge_by_order, normalize_calls};

/// A record kind that can live in an entity store.
pub trait TransitRecord: Clone + PartialEq + Send + Sync + 'static {
    /// The data kind this record belongs to.
    const KIND: DataKind;

    /// Provider-assigned reference, unique within a dataset. `None` or empty
    /// means the record cannot be keyed and is ignored.
    fn reference(&self) -> Option<&str>;

    /// Recency timestamp, if the provider sent one.
    fn recorded_at(&self) -> Option<DateTime<Utc>>;

    /// Prepares a record for first insertion.
    fn normalize(&mut self) {}

    /// Folds an accepted, newer update into the stored record.
    ///
    /// The default replaces the record wholesale.
    fn absorb(&mut self, incoming: Self) {
        *self = incoming;
    }

    /// Records of this kind inside a payload.
    fn slice_of(payload: &Payload) -> &[Self];

    /// Moves all records of this kind out of a payload.
    fn take_from(payload: &mut Payload) -> Vec<Self>;

    /// Appends records of this kind to a payload.
    fn extend_into(records: Vec<Self>, payload: &mut Payload);

    /// Visits every identifier reference in the record.
    fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef));
}

fn non_empty(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl TransitRecord for Situation {
    const KIND: DataKind = DataKind::Situation;

    fn reference(&self) -> Option<&str> {
        non_empty(&self.situation_number)
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    fn slice_of(payload: &Payload) -> &[Self] {
        &payload.situations
    }

    fn take_from(payload: &mut Payload) -> Vec<Self> {
        std::mem::take(&mut payload.situations)
    }

    fn extend_into(records: Vec<Self>, payload: &mut Payload) {
        payload.situations.extend(records);
    }

    fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        Situation::visit_refs_mut(self, f);
    }
}

impl TransitRecord for EstimatedJourney {
    const KIND: DataKind = DataKind::EstimatedTimetable;

    fn reference(&self) -> Option<&str> {
        non_empty(&self.journey_ref)
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    fn normalize(&mut self) {
        self.calls = normalize_calls(std::mem::take(&mut self.calls));
    }

    fn absorb(&mut self, incoming: Self) {
        let stored_calls = std::mem::take(&mut self.calls);
        *self = incoming;
        self.calls = merge_by_order(stored_calls, std::mem::take(&mut self.calls));
    }

    fn slice_of(payload: &Payload) -> &[Self] {
        &payload.estimated_journeys
    }

    fn take_from(payload: &mut Payload) -> Vec<Self> {
        std::mem::take(&mut payload.estimated_journeys)
    }

    fn extend_into(records: Vec<Self>, payload: &mut Payload) {
        payload.estimated_journeys.extend(records);
    }

    fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        EstimatedJourney::visit_refs_mut(self, f);
    }
}

impl TransitRecord for VehicleActivity {
    const KIND: DataKind = DataKind::VehicleMonitoring;

    fn reference(&self) -> Option<&str> {
        non_empty(self.vehicle_ref.current())
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    fn slice_of(payload: &Payload) -> &[Self] {
        &payload.vehicle_activities
    }

    fn take_from(payload: &mut Payload) -> Vec<Self> {
        std::mem::take(&mut payload.vehicle_activities)
    }

    fn extend_into(records: Vec<Self>, payload: &mut Payload) {
        payload.vehicle_activities.extend(records);
    }

    fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        VehicleActivity::visit_refs_mut(self, f);
    }
}

impl TransitRecord for ProductionTimetable {
    const KIND: DataKind = DataKind::ProductionTimetable;

    fn reference(&self) -> Option<&str> {
        non_empty(&self.journey_ref)
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    fn normalize(&mut self) {
        self.calls = normalize_calls(std::mem::take(&mut self.calls));
    }

    fn absorb(&mut self, incoming: Self) {
        let stored_calls = std::mem::take(&mut self.calls);
        *self = incoming;
        self.calls = merge_by_order(stored_calls, std::mem::take(&mut self.calls));
    }

    fn slice_of(payload: &Payload) -> &[Self] {
        &payload.production_timetables
    }

    fn take_from(payload: &mut Payload) -> Vec<Self> {
        std::mem::take(&mut payload.production_timetables)
    }

    fn extend_into(records: Vec<Self>, payload: &mut Payload) {
        payload.production_timetables.extend(records);
    }

    fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        ProductionTimetable::visit_refs_mut(self, f);
    }
}
