use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{ObjectRef, Payload};

/// Per-target content restriction.
///
/// An empty set lets everything through. A non-empty set keeps only records
/// that carry a matching reference, in either its original or mapped form.
/// Situations are judged on their affected lines only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilter {
    pub line_refs: BTreeSet<String>,
    pub vehicle_refs: BTreeSet<String>,
}

impl ContentFilter {
    #[must_use]
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            line_refs: lines.into_iter().map(Into::into).collect(),
            vehicle_refs: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.line_refs.is_empty() && self.vehicle_refs.is_empty()
    }

    /// Removes non-matching records. Returns how many were removed.
    pub fn apply(&self, payload: &mut Payload) -> usize {
        if self.is_open() {
            return 0;
        }
        let before = payload.element_count();
        payload
            .situations
            .retain(|s| self.line_refs.is_empty() || s.affected_lines.iter().any(|l| self.line(l)));
        payload
            .estimated_journeys
            .retain(|j| self.line(&j.line_ref) && self.vehicle(j.vehicle_ref.as_ref()));
        payload
            .vehicle_activities
            .retain(|v| self.optional_line(v.line_ref.as_ref()) && self.vehicle(Some(&v.vehicle_ref)));
        payload
            .production_timetables
            .retain(|p| self.line(&p.line_ref) && self.vehicle(None));
        before - payload.element_count()
    }

    fn line(&self, reference: &ObjectRef) -> bool {
        self.line_refs.is_empty() || self.line_refs.iter().any(|l| reference.matches(l))
    }

    fn optional_line(&self, reference: Option<&ObjectRef>) -> bool {
        self.line_refs.is_empty() || reference.is_some_and(|r| self.line(r))
    }

    fn vehicle(&self, reference: Option<&ObjectRef>) -> bool {
        self.vehicle_refs.is_empty()
            || reference.is_some_and(|r| self.vehicle_refs.iter().any(|v| r.matches(v)))
    }
}
