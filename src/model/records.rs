//! Canonical record shapes for the four data kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reference::{IdField, ObjectRef};

/// Whether a call has already happened or is still predicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Recorded,
    #[default]
    Estimated,
}

/// One stop visit within a journey, addressed by `order`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Call {
    pub order: u32,
    pub stop_ref: ObjectRef,
    #[serde(default)]
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aimed_arrival: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aimed_departure: Option<DateTime<Utc>>,
    /// Actual arrival for recorded calls, expected arrival for estimated calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival: Option<DateTime<Utc>>,
    /// Actual departure for recorded calls, expected departure for estimated calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
}

impl Call {
    /// An estimated call with both expected times set to `time`.
    #[must_use]
    pub fn estimated(order: u32, stop_ref: impl Into<ObjectRef>, time: DateTime<Utc>) -> Self {
        Self {
            order,
            stop_ref: stop_ref.into(),
            status: CallStatus::Estimated,
            aimed_arrival: Some(time),
            aimed_departure: Some(time),
            arrival: Some(time),
            departure: Some(time),
            cancelled: false,
        }
    }

    /// A recorded call with actual times.
    #[must_use]
    pub fn recorded(
        order: u32,
        stop_ref: impl Into<ObjectRef>,
        arrival: Option<DateTime<Utc>>,
        departure: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            order,
            stop_ref: stop_ref.into(),
            status: CallStatus::Recorded,
            aimed_arrival: arrival,
            aimed_departure: departure,
            arrival,
            departure,
            cancelled: false,
        }
    }
}

/// A validity window of a situation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityPeriod {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// A disruption/deviation message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Situation {
    pub situation_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub validity: Vec<ValidityPeriod>,
    #[serde(default)]
    pub affected_lines: Vec<ObjectRef>,
    #[serde(default)]
    pub affected_stops: Vec<ObjectRef>,
}

impl Situation {
    pub(crate) fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        if let Some(r) = self.participant_ref.as_mut() {
            f(IdField::ParticipantRef, r);
        }
        for r in &mut self.affected_lines {
            f(IdField::LineRef, r);
        }
        for r in &mut self.affected_stops {
            f(IdField::StopRef, r);
        }
    }
}

/// A journey with predicted (and already recorded) calls.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EstimatedJourney {
    /// Provider-assigned journey reference; the store key within a dataset.
    pub journey_ref: String,
    pub line_ref: ObjectRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_complete_stop_sequence: bool,
    #[serde(default)]
    pub cancellation: bool,
    #[serde(default)]
    pub calls: Vec<Call>,
}

impl EstimatedJourney {
    pub(crate) fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        f(IdField::LineRef, &mut self.line_ref);
        if let Some(r) = self.vehicle_ref.as_mut() {
            f(IdField::VehicleRef, r);
        }
        if let Some(r) = self.operator_ref.as_mut() {
            f(IdField::OperatorRef, r);
        }
        if let Some(r) = self.data_source.as_mut() {
            f(IdField::DataSource, r);
        }
        for call in &mut self.calls {
            f(IdField::StopRef, &mut call.stop_ref);
        }
    }
}

/// Geographic position in WGS84.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// A vehicle's current activity and position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleActivity {
    pub vehicle_ref: ObjectRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journey_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<i64>,
}

impl VehicleActivity {
    pub(crate) fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        f(IdField::VehicleRef, &mut self.vehicle_ref);
        if let Some(r) = self.line_ref.as_mut() {
            f(IdField::LineRef, r);
        }
        if let Some(r) = self.operator_ref.as_mut() {
            f(IdField::OperatorRef, r);
        }
        if let Some(r) = self.data_source.as_mut() {
            f(IdField::DataSource, r);
        }
    }
}

/// A planned journey of the production timetable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductionTimetable {
    pub journey_ref: String,
    pub line_ref: ObjectRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calls: Vec<Call>,
}

impl ProductionTimetable {
    pub(crate) fn visit_refs_mut(&mut self, f: &mut dyn FnMut(IdField, &mut ObjectRef)) {
        f(IdField::LineRef, &mut self.line_ref);
        if let Some(r) = self.operator_ref.as_mut() {
            f(IdField::OperatorRef, r);
        }
        if let Some(r) = self.data_source.as_mut() {
            f(IdField::DataSource, r);
        }
        for call in &mut self.calls {
            f(IdField::StopRef, &mut call.stop_ref);
        }
    }
}
