//! Structural post-processors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::model::{CallStatus, IdPolicy, ObjectRef, Payload};
use crate::observability as events;

use super::adapter::StructuralFn;

fn clamp(value: &mut Option<DateTime<Utc>>, latest: &mut Option<DateTime<Utc>>) -> bool {
    let Some(time) = *value else {
        return false;
    };
    match *latest {
        Some(floor) if time < floor => {
            *value = Some(floor);
            true
        }
        _ => {
            *latest = Some(time);
            false
        }
    }
}

/// Makes arrival and departure times non-decreasing along each estimated
/// journey, walking recorded calls before estimated ones. Earlier times are
/// raised to the latest time seen so far. Returns the number of corrections.
pub fn ensure_increasing_times(payload: &mut Payload) -> usize {
    let mut total = 0;
    for journey in &mut payload.estimated_journeys {
        let mut latest = None;
        let mut runtimes = 0;
        let mut dwelltimes = 0;
        for status in [CallStatus::Recorded, CallStatus::Estimated] {
            for call in journey.calls.iter_mut().filter(|c| c.status == status) {
                if clamp(&mut call.arrival, &mut latest) {
                    runtimes += 1;
                }
                if clamp(&mut call.departure, &mut latest) {
                    dwelltimes += 1;
                }
            }
        }
        if runtimes + dwelltimes > 0 {
            warn!(
                event = events::TIMES_CORRECTED,
                line = %journey.line_ref.original,
                vehicle = journey.vehicle_ref.as_ref().map_or("", |v| v.original.as_str()),
                dwelltimes,
                runtimes,
                "fixed decreasing call times"
            );
        }
        total += runtimes + dwelltimes;
    }
    total
}

fn operator_matches(operator: Option<&ObjectRef>, ignore: &HashSet<String>) -> bool {
    operator.is_some_and(|op| ignore.iter().any(|i| op.matches(i)))
}

/// Drops records run by ignored operators and remaps operator references.
///
/// Applies to estimated journeys, vehicle activities and production
/// timetables. Returns dropped records plus remapped references.
#[must_use]
pub fn operator_filter(ignore: HashSet<String>, remap: HashMap<String, String>) -> StructuralFn {
    Arc::new(move |payload: &mut Payload| {
        let before = payload.element_count();
        payload
            .estimated_journeys
            .retain(|j| !operator_matches(j.operator_ref.as_ref(), &ignore));
        payload
            .vehicle_activities
            .retain(|v| !operator_matches(v.operator_ref.as_ref(), &ignore));
        payload
            .production_timetables
            .retain(|p| !operator_matches(p.operator_ref.as_ref(), &ignore));
        let mut changed = before - payload.element_count();

        let mut remap_ref = |operator: Option<&mut ObjectRef>| {
            if let Some(op) = operator {
                if let Some(target) = remap.get(op.current()) {
                    if target != op.current() {
                        op.set_mapped(target.clone());
                        changed += 1;
                    }
                }
            }
        };
        for j in &mut payload.estimated_journeys {
            remap_ref(j.operator_ref.as_mut());
        }
        for v in &mut payload.vehicle_activities {
            remap_ref(v.operator_ref.as_mut());
        }
        for p in &mut payload.production_timetables {
            remap_ref(p.operator_ref.as_mut());
        }
        changed
    })
}

/// Collapses every identifier to the form `policy` asks for.
///
/// After this pass each reference carries a single value, so the payload can
/// be handed to a codec that knows nothing about mappings.
#[must_use]
pub fn apply_id_policy(policy: IdPolicy) -> StructuralFn {
    Arc::new(move |payload: &mut Payload| {
        let mut changed = 0;
        payload.visit_refs_mut(&mut |_, reference| {
            if reference.mapped.is_some() {
                if reference.resolve(policy) != reference.original {
                    changed += 1;
                }
                reference.collapse(policy);
            }
        });
        changed
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{Call, EstimatedJourney, VehicleActivity};

    fn journey_with(calls: Vec<Call>) -> Payload {
        let mut payload = Payload::default();
        payload.estimated_journeys.push(EstimatedJourney {
            journey_ref: "J".to_string(),
            line_ref: ObjectRef::new("L"),
            calls,
            ..EstimatedJourney::default()
        });
        payload
    }

    #[test]
    fn test_clamps_decreasing_times() {
        let t0 = Utc::now();
        let mut payload = journey_with(vec![
            Call::recorded(0, "A", Some(t0), Some(t0 + Duration::minutes(2))),
            Call::estimated(1, "B", t0 + Duration::minutes(1)),
            Call::estimated(2, "C", t0 + Duration::minutes(5)),
        ]);

        assert_eq!(ensure_increasing_times(&mut payload), 2);

        let calls = &payload.estimated_journeys[0].calls;
        assert_eq!(calls[1].arrival, Some(t0 + Duration::minutes(2)));
        assert_eq!(calls[1].departure, Some(t0 + Duration::minutes(2)));
        assert_eq!(calls[2].arrival, Some(t0 + Duration::minutes(5)));
    }

    #[test]
    fn test_second_pass_finds_nothing() {
        let t0 = Utc::now();
        let mut payload = journey_with(vec![
            Call::estimated(0, "A", t0 + Duration::minutes(10)),
            Call::estimated(1, "B", t0),
            Call::estimated(2, "C", t0 + Duration::minutes(3)),
        ]);
        assert!(ensure_increasing_times(&mut payload) > 0);
        assert_eq!(ensure_increasing_times(&mut payload), 0);
    }

    #[test]
    fn test_recorded_calls_walk_first() {
        let t0 = Utc::now();
        // Estimated call listed first, but recorded calls precede it in time order.
        let mut payload = journey_with(vec![
            Call::estimated(1, "B", t0),
            Call::recorded(0, "A", Some(t0 + Duration::minutes(1)), None),
        ]);
        assert_eq!(ensure_increasing_times(&mut payload), 2);
        assert_eq!(
            payload.estimated_journeys[0].calls[0].arrival,
            Some(t0 + Duration::minutes(1))
        );
    }

    #[test]
    fn test_operator_filter_drops_and_remaps() {
        let mut payload = Payload::default();
        for (vehicle, operator) in [("1", "BN"), ("2", "NG"), ("3", "XYZ")] {
            payload.vehicle_activities.push(VehicleActivity {
                vehicle_ref: ObjectRef::new(vehicle),
                operator_ref: Some(ObjectRef::new(operator)),
                ..VehicleActivity::default()
            });
        }

        let process = operator_filter(
            HashSet::from(["BN".to_string()]),
            HashMap::from([("NG".to_string(), "NSB".to_string())]),
        );
        assert_eq!(process(&mut payload), 2);

        let operators: Vec<&str> = payload
            .vehicle_activities
            .iter()
            .filter_map(|v| v.operator_ref.as_ref().map(ObjectRef::current))
            .collect();
        assert_eq!(operators, vec!["NSB", "XYZ"]);
    }

    #[test]
    fn test_apply_id_policy_collapses() {
        let mut mapped = ObjectRef::new("9");
        mapped.set_mapped("ATB:Line:9".to_string());
        let mut payload = Payload::default();
        payload.vehicle_activities.push(VehicleActivity {
            vehicle_ref: ObjectRef::new("v"),
            line_ref: Some(mapped),
            ..VehicleActivity::default()
        });

        let mut original = payload.clone();
        apply_id_policy(IdPolicy::Default)(&mut payload);
        apply_id_policy(IdPolicy::OriginalId)(&mut original);

        assert_eq!(
            payload.vehicle_activities[0].line_ref,
            Some(ObjectRef::new("ATB:Line:9"))
        );
        assert_eq!(original.vehicle_activities[0].line_ref, Some(ObjectRef::new("9")));
    }
}
