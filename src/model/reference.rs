use std::fmt;

use serde::{Deserialize, Serialize};

/// Which form of an identifier a consumer wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdPolicy {
    /// The provider's own identifier, as received.
    OriginalId,
    /// The canonical (mapped) identifier.
    #[default]
    Default,
}

/// Identifier fields that transformation adapters can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdField {
    StopRef,
    LineRef,
    VehicleRef,
    OperatorRef,
    DataSource,
    ParticipantRef,
}

/// An identifier that remembers the provider's original value alongside the
/// canonical value produced by ingest-time rewriting.
///
/// Rewriters always read [`ObjectRef::current`], so applying the same
/// idempotent rewriter twice leaves the reference unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ObjectRef {
    pub original: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped: Option<String>,
}

impl ObjectRef {
    /// Creates an unmapped reference.
    #[must_use]
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            mapped: None,
        }
    }

    /// The canonical value if mapped, else the original.
    #[must_use]
    pub fn current(&self) -> &str {
        self.mapped.as_deref().unwrap_or(&self.original)
    }

    /// Records a rewritten value. Rewriting back to the original clears the mapping.
    pub fn set_mapped(&mut self, value: String) {
        if value == self.original {
            self.mapped = None;
        } else {
            self.mapped = Some(value);
        }
    }

    /// The value a consumer with `policy` should see.
    #[must_use]
    pub fn resolve(&self, policy: IdPolicy) -> &str {
        match policy {
            IdPolicy::OriginalId => &self.original,
            IdPolicy::Default => self.current(),
        }
    }

    /// Replaces this reference by its resolved form, dropping the other form.
    pub fn collapse(&mut self, policy: IdPolicy) {
        let value = self.resolve(policy).to_string();
        *self = Self::new(value);
    }

    /// True if either form equals `value`.
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        self.original == value || self.mapped.as_deref() == Some(value)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.current())
    }
}

impl From<&str> for ObjectRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ObjectRef {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
