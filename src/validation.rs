//! Inbound record validation.
//!
//! Validators only report violations. What to do with a violating record is
//! a [`ValidationPolicy`] decision taken by the suite, outside merge logic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::TransitRecord;
use crate::model::{
    CallStatus, EstimatedJourney, Payload, ProductionTimetable, Situation, VehicleActivity,
};
use crate::observability as events;

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: &'static str,
    pub message: String,
}

/// What to do with a record that has violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationPolicy {
    /// Log the violations and merge the record anyway.
    #[default]
    AcceptWithWarning,
    /// Drop the record before merge.
    Reject,
}

/// Checks one record of kind `R`.
pub trait Validator<R>: Send + Sync {
    fn validate(&self, record: &R) -> Vec<Violation>;
}

/// Situation progress must be `open` or `closed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressValidator;

impl Validator<Situation> for ProgressValidator {
    fn validate(&self, record: &Situation) -> Vec<Violation> {
        match record.progress.as_deref() {
            None | Some("open" | "closed") => Vec::new(),
            Some(other) => vec![Violation {
                rule: "situation_progress",
                message: format!(
                    "situation {} has progress '{other}', expected open or closed",
                    record.situation_number
                ),
            }],
        }
    }
}

/// An estimated call must not be expected to depart before it arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectedDepartureValidator;

impl Validator<EstimatedJourney> for ExpectedDepartureValidator {
    fn validate(&self, record: &EstimatedJourney) -> Vec<Violation> {
        record
            .calls
            .iter()
            .filter(|c| c.status == CallStatus::Estimated)
            .filter_map(|c| match (c.arrival, c.departure) {
                (Some(arrival), Some(departure)) if departure < arrival => Some(Violation {
                    rule: "expected_departure_after_arrival",
                    message: format!(
                        "journey {} call {}: departure {departure} before arrival {arrival}",
                        record.journey_ref, c.order
                    ),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Outcome of validating a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Records with at least one violation.
    pub flagged: usize,
    pub violations: usize,
    /// Records removed under [`ValidationPolicy::Reject`].
    pub rejected: usize,
}

/// Validators for every kind plus the policy applied to violators.
#[derive(Clone, Default)]
pub struct ValidationSuite {
    pub policy: ValidationPolicy,
    pub situations: Vec<Arc<dyn Validator<Situation>>>,
    pub estimated_journeys: Vec<Arc<dyn Validator<EstimatedJourney>>>,
    pub vehicle_activities: Vec<Arc<dyn Validator<VehicleActivity>>>,
    pub production_timetables: Vec<Arc<dyn Validator<ProductionTimetable>>>,
}

impl std::fmt::Debug for ValidationSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationSuite")
            .field("policy", &self.policy)
            .field("situations", &self.situations.len())
            .field("estimated_journeys", &self.estimated_journeys.len())
            .field("vehicle_activities", &self.vehicle_activities.len())
            .field("production_timetables", &self.production_timetables.len())
            .finish()
    }
}

impl ValidationSuite {
    /// The built-in validators under `policy`.
    #[must_use]
    pub fn with_defaults(policy: ValidationPolicy) -> Self {
        Self {
            policy,
            situations: vec![Arc::new(ProgressValidator)],
            estimated_journeys: vec![Arc::new(ExpectedDepartureValidator)],
            ..Self::default()
        }
    }

    /// Validates every record, dropping violators if the policy says so.
    pub fn apply(&self, subscription_id: &str, payload: &mut Payload) -> ValidationReport {
        let mut report = ValidationReport::default();
        check(self.policy, subscription_id, &self.situations, &mut payload.situations, &mut report);
        check(
            self.policy,
            subscription_id,
            &self.estimated_journeys,
            &mut payload.estimated_journeys,
            &mut report,
        );
        check(
            self.policy,
            subscription_id,
            &self.vehicle_activities,
            &mut payload.vehicle_activities,
            &mut report,
        );
        check(
            self.policy,
            subscription_id,
            &self.production_timetables,
            &mut payload.production_timetables,
            &mut report,
        );
        report
    }
}

fn check<R: TransitRecord>(
    policy: ValidationPolicy,
    subscription_id: &str,
    validators: &[Arc<dyn Validator<R>>],
    records: &mut Vec<R>,
    report: &mut ValidationReport,
) {
    if validators.is_empty() {
        return;
    }
    records.retain(|record| {
        let violations: Vec<Violation> = validators.iter().flat_map(|v| v.validate(record)).collect();
        if violations.is_empty() {
            return true;
        }
        report.flagged += 1;
        report.violations += violations.len();
        let reject = policy == ValidationPolicy::Reject;
        if reject {
            report.rejected += 1;
        }
        warn!(
            event = events::VALIDATION_VIOLATIONS,
            subscription_id,
            kind = %R::KIND,
            reference = record.reference().unwrap_or(""),
            rules = ?violations.iter().map(|v| v.rule).collect::<Vec<_>>(),
            first = %violations[0].message,
            rejected = reject,
            "validation violations"
        );
        !reject
    });
}
