//! Canonical in-memory record shapes.
//!
//! Records are decoded from provider payloads by an external codec and carry
//! identifiers as [`ObjectRef`]s, so ingest-time normalization can be undone
//! for consumers that ask for original ids.

mod kind;
mod payload;
mod records;
mod reference;

pub use kind::DataKind;
pub use payload::Payload;
pub use records::{
    Call, CallStatus, EstimatedJourney, Location, ProductionTimetable, Situation, ValidityPeriod,
    VehicleActivity,
};
pub use reference::{IdField, IdPolicy, ObjectRef};
