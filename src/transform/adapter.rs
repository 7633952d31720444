//! Adapter values and ordered chains of them.

use std::fmt;
use std::sync::Arc;

use crate::model::{IdField, Payload};

/// A pure rewrite of one identifier string.
pub type ScalarFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A pass over a whole payload. Returns how many values it changed.
pub type StructuralFn = Arc<dyn Fn(&mut Payload) -> usize + Send + Sync>;

/// One link of a transformation chain.
#[derive(Clone)]
pub enum Adapter {
    /// Rewrites every identifier of the listed fields.
    Scalar {
        name: String,
        fields: Vec<IdField>,
        rewrite: ScalarFn,
    },
    /// Rewrites a payload as a whole.
    Structural {
        name: String,
        process: StructuralFn,
    },
}

impl Adapter {
    pub fn scalar(name: impl Into<String>, fields: Vec<IdField>, rewrite: ScalarFn) -> Self {
        Self::Scalar {
            name: name.into(),
            fields,
            rewrite,
        }
    }

    pub fn structural(name: impl Into<String>, process: StructuralFn) -> Self {
        Self::Structural {
            name: name.into(),
            process,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Scalar { name, .. } | Self::Structural { name, .. } => name,
        }
    }

    /// Applies the adapter. Returns the number of values changed.
    pub fn apply(&self, payload: &mut Payload) -> usize {
        match self {
            Self::Scalar { fields, rewrite, .. } => {
                let mut changed = 0;
                payload.visit_refs_mut(&mut |field, reference| {
                    if !fields.contains(&field) {
                        return;
                    }
                    let next = rewrite(reference.current());
                    if next != reference.current() {
                        reference.set_mapped(next);
                        changed += 1;
                    }
                });
                changed
            }
            Self::Structural { process, .. } => process(payload),
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar { name, fields, .. } => f
                .debug_struct("Scalar")
                .field("name", name)
                .field("fields", fields)
                .finish_non_exhaustive(),
            Self::Structural { name, .. } => f
                .debug_struct("Structural")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// Outcome of running a chain over a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// Changed values per adapter, in chain order.
    pub per_adapter: Vec<(String, usize)>,
}

impl ChainReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.per_adapter.iter().map(|(_, n)| n).sum()
    }
}

/// An ordered list of adapters, applied first to last.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    adapters: Vec<Adapter>,
}

impl TransformChain {
    #[must_use]
    pub fn new(adapters: Vec<Adapter>) -> Self {
        Self { adapters }
    }

    pub fn push(&mut self, adapter: Adapter) {
        self.adapters.push(adapter);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.iter().map(Adapter::name)
    }

    pub fn apply(&self, payload: &mut Payload) -> ChainReport {
        ChainReport {
            per_adapter: self
                .adapters
                .iter()
                .map(|adapter| (adapter.name().to_string(), adapter.apply(payload)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectRef, VehicleActivity};

    fn upper() -> ScalarFn {
        Arc::new(|value: &str| value.to_uppercase())
    }

    #[test]
    fn test_scalar_only_touches_listed_fields() {
        let mut payload = Payload::default();
        payload.vehicle_activities.push(VehicleActivity {
            vehicle_ref: ObjectRef::new("bus"),
            line_ref: Some(ObjectRef::new("line")),
            ..VehicleActivity::default()
        });

        let chain = TransformChain::new(vec![Adapter::scalar("upper", vec![IdField::LineRef], upper())]);
        let report = chain.apply(&mut payload);

        assert_eq!(report.total(), 1);
        let vehicle = &payload.vehicle_activities[0];
        assert_eq!(vehicle.vehicle_ref.current(), "bus");
        assert_eq!(vehicle.line_ref.as_ref().map(ObjectRef::current), Some("LINE"));
        assert_eq!(vehicle.line_ref.as_ref().map(|r| r.original.as_str()), Some("line"));
    }

    #[test]
    fn test_structural_count_reported() {
        let mut payload = Payload::default();
        let chain = TransformChain::new(vec![Adapter::structural(
            "noop",
            Arc::new(|_: &mut Payload| 7),
        )]);
        assert_eq!(chain.apply(&mut payload).per_adapter, vec![("noop".to_string(), 7)]);
    }
}
