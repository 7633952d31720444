//! Configuration-driven chain assembly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{IdField, IdPolicy};

use super::adapter::{Adapter, TransformChain};
use super::processors::{apply_id_policy, ensure_increasing_times, operator_filter};
use super::scalar::{alias, prefix_codespace};

fn default_prefix_fields() -> Vec<IdField> {
    vec![IdField::StopRef, IdField::LineRef, IdField::VehicleRef]
}

/// A serializable description of one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterSpec {
    PrefixCodespace {
        codespace: String,
        #[serde(default = "default_prefix_fields")]
        fields: Vec<IdField>,
    },
    Alias {
        fields: Vec<IdField>,
        aliases: HashMap<String, String>,
    },
    OperatorFilter {
        #[serde(default)]
        ignore: Vec<String>,
        #[serde(default)]
        remap: HashMap<String, String>,
    },
    EnsureIncreasingTimes,
    ApplyIdPolicy {
        policy: IdPolicy,
    },
    /// A named chain registered with the [`TransformRegistry`].
    Preset {
        name: String,
    },
}

/// Resolves adapter specs, including named presets, into chains.
#[derive(Debug, Clone, Default)]
pub struct TransformRegistry {
    presets: HashMap<String, Vec<AdapterSpec>>,
}

impl TransformRegistry {
    /// A registry without presets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in presets.
    ///
    /// `bane-nor-et` remaps the NG and FLY operator codes used by the national
    /// rail feed to NSB and FLT.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.presets.insert(
            "bane-nor-et".to_string(),
            vec![AdapterSpec::OperatorFilter {
                ignore: Vec::new(),
                remap: HashMap::from([
                    ("NG".to_string(), "NSB".to_string()),
                    ("FLY".to_string(), "FLT".to_string()),
                ]),
            }],
        );
        registry.presets.insert(
            "increasing-times".to_string(),
            vec![AdapterSpec::EnsureIncreasingTimes],
        );
        registry
    }

    /// Registers or replaces a preset. Presets may not reference other presets.
    pub fn register_preset(&mut self, name: impl Into<String>, specs: Vec<AdapterSpec>) -> Result<(), ConfigError> {
        let name = name.into();
        if specs.iter().any(|s| matches!(s, AdapterSpec::Preset { .. })) {
            return Err(ConfigError::InvalidValue {
                field: format!("presets.{name}"),
                reason: "presets cannot reference other presets".to_string(),
            });
        }
        self.presets.insert(name, specs);
        Ok(())
    }

    #[must_use]
    pub fn has_preset(&self, name: &str) -> bool {
        self.presets.contains_key(name)
    }

    /// Builds a chain from specs, expanding presets in place.
    pub fn build(&self, specs: &[AdapterSpec]) -> Result<TransformChain, ConfigError> {
        let mut chain = TransformChain::default();
        for spec in specs {
            match spec {
                AdapterSpec::Preset { name } => {
                    let preset = self
                        .presets
                        .get(name)
                        .ok_or_else(|| ConfigError::UnknownPreset { name: name.clone() })?;
                    for inner in preset {
                        chain.push(build_one(inner)?);
                    }
                }
                other => chain.push(build_one(other)?),
            }
        }
        Ok(chain)
    }

    /// The outbound chain for consumers with `policy`.
    #[must_use]
    pub fn egress(&self, policy: IdPolicy) -> TransformChain {
        TransformChain::new(vec![Adapter::structural(
            format!("apply-id-policy:{policy:?}"),
            apply_id_policy(policy),
        )])
    }
}

fn build_one(spec: &AdapterSpec) -> Result<Adapter, ConfigError> {
    Ok(match spec {
        AdapterSpec::PrefixCodespace { codespace, fields } => Adapter::scalar(
            format!("prefix-codespace:{codespace}"),
            fields.clone(),
            prefix_codespace(codespace)?,
        ),
        AdapterSpec::Alias { fields, aliases } => {
            Adapter::scalar("alias", fields.clone(), alias(aliases.clone())?)
        }
        AdapterSpec::OperatorFilter { ignore, remap } => Adapter::structural(
            "operator-filter",
            operator_filter(ignore.iter().cloned().collect::<HashSet<_>>(), remap.clone()),
        ),
        AdapterSpec::EnsureIncreasingTimes => {
            Adapter::structural("ensure-increasing-times", Arc::new(ensure_increasing_times))
        }
        AdapterSpec::ApplyIdPolicy { policy } => Adapter::structural(
            format!("apply-id-policy:{policy:?}"),
            apply_id_policy(*policy),
        ),
        AdapterSpec::Preset { name } => {
            return Err(ConfigError::InvalidValue {
                field: "preset".to_string(),
                reason: format!("nested preset '{name}'"),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectRef, Payload, VehicleActivity};

    #[test]
    fn test_specs_deserialize_from_json() {
        let json = r#"[
            {"type": "prefix_codespace", "codespace": "RUT"},
            {"type": "preset", "name": "bane-nor-et"},
            {"type": "ensure_increasing_times"}
        ]"#;
        let specs: Vec<AdapterSpec> = serde_json::from_str(json).unwrap();
        let chain = TransformRegistry::with_defaults().build(&specs).unwrap();
        let names: Vec<&str> = chain.names().collect();
        assert_eq!(
            names,
            vec!["prefix-codespace:RUT", "operator-filter", "ensure-increasing-times"]
        );
    }

    #[test]
    fn test_unknown_preset() {
        let err = TransformRegistry::new()
            .build(&[AdapterSpec::Preset {
                name: "nope".to_string(),
            }])
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPreset { .. }));
    }

    #[test]
    fn test_nested_preset_rejected() {
        let mut registry = TransformRegistry::new();
        let result = registry.register_preset(
            "outer",
            vec![AdapterSpec::Preset {
                name: "inner".to_string(),
            }],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ingest_chain_is_idempotent() {
        let registry = TransformRegistry::with_defaults();
        let chain = registry
            .build(&[
                AdapterSpec::PrefixCodespace {
                    codespace: "ATB".to_string(),
                    fields: default_prefix_fields(),
                },
                AdapterSpec::Preset {
                    name: "bane-nor-et".to_string(),
                },
            ])
            .unwrap();

        let mut payload = Payload::default();
        payload.vehicle_activities.push(VehicleActivity {
            vehicle_ref: ObjectRef::new("55"),
            line_ref: Some(ObjectRef::new("Line:3")),
            operator_ref: Some(ObjectRef::new("NG")),
            ..VehicleActivity::default()
        });

        assert_eq!(chain.apply(&mut payload).total(), 3);
        let once = payload.clone();
        assert_eq!(chain.apply(&mut payload).total(), 0);
        assert_eq!(payload, once);
    }

    #[test]
    fn test_egress_restores_original_ids() {
        let registry = TransformRegistry::with_defaults();
        let ingest = registry
            .build(&[AdapterSpec::PrefixCodespace {
                codespace: "ATB".to_string(),
                fields: vec![IdField::LineRef],
            }])
            .unwrap();

        let mut payload = Payload::default();
        payload.vehicle_activities.push(VehicleActivity {
            vehicle_ref: ObjectRef::new("55"),
            line_ref: Some(ObjectRef::new("Line:3")),
            ..VehicleActivity::default()
        });
        ingest.apply(&mut payload);

        let mut original = payload.clone();
        registry.egress(IdPolicy::OriginalId).apply(&mut original);
        registry.egress(IdPolicy::Default).apply(&mut payload);

        assert_eq!(original.vehicle_activities[0].line_ref, Some(ObjectRef::new("Line:3")));
        assert_eq!(payload.vehicle_activities[0].line_ref, Some(ObjectRef::new("ATB:Line:3")));
    }
}
