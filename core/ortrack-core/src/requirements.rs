//! Per-procedure manifest of required item names and counts.
//!
//! Stored form is `{"instruments": {"Scalpel": 2}, "trays": {"Basic Tray": 1}}`.
//! Older operation types list names instead (`{"instruments": ["Scalpel", "Clamp"]}`);
//! each occurrence of a name counts as one required instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, TrackError};
use crate::types::ItemKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct RequirementSpec {
    pub instruments: BTreeMap<String, u32>,
    pub trays: BTreeMap<String, u32>,
}

impl RequirementSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ItemKind, name: &str, count: u32) -> Self {
        self.required_mut(kind).insert(name.to_string(), count);
        self
    }

    pub fn required(&self, kind: ItemKind) -> &BTreeMap<String, u32> {
        match kind {
            ItemKind::Instrument => &self.instruments,
            ItemKind::Tray => &self.trays,
        }
    }

    fn required_mut(&mut self, kind: ItemKind) -> &mut BTreeMap<String, u32> {
        match kind {
            ItemKind::Instrument => &mut self.instruments,
            ItemKind::Tray => &mut self.trays,
        }
    }

    pub fn count(&self, kind: ItemKind, name: &str) -> Option<u32> {
        self.required(kind).get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty() && self.trays.is_empty()
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            _ => {
                return Err(TrackError::InvalidRequirement(
                    "requirements must be a JSON object".to_string(),
                ))
            }
        };

        Ok(Self {
            instruments: parse_counts(object.get("instruments"), "instruments")?,
            trays: parse_counts(object.get("trays"), "trays")?,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "instruments": self.instruments,
            "trays": self.trays,
        })
    }
}

impl TryFrom<Value> for RequirementSpec {
    type Error = TrackError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(&value)
    }
}

fn parse_counts(value: Option<&Value>, field: &str) -> Result<BTreeMap<String, u32>> {
    let mut counts = BTreeMap::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(entries)) => {
            for (name, count) in entries {
                let count = count
                    .as_u64()
                    .and_then(|count| u32::try_from(count).ok())
                    .ok_or_else(|| {
                        TrackError::InvalidRequirement(format!(
                            "{}.{} must be a non-negative integer, got {}",
                            field, name, count
                        ))
                    })?;
                counts.insert(name.clone(), count);
            }
        }
        Some(Value::Array(names)) => {
            for name in names {
                let name = name.as_str().ok_or_else(|| {
                    TrackError::InvalidRequirement(format!(
                        "{} list entries must be names, got {}",
                        field, name
                    ))
                })?;
                *counts.entry(name.to_string()).or_insert(0) += 1;
            }
        }
        Some(other) => {
            return Err(TrackError::InvalidRequirement(format!(
                "{} must be an object of counts or a list of names, got {}",
                field, other
            )))
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_count_map() {
        let spec = RequirementSpec::from_value(&json!({
            "instruments": {"Scalpel": 2},
            "trays": {"Basic Tray": 1}
        }))
        .expect("parse");
        assert_eq!(spec.count(ItemKind::Instrument, "Scalpel"), Some(2));
        assert_eq!(spec.count(ItemKind::Tray, "Basic Tray"), Some(1));
    }

    #[test]
    fn parses_legacy_name_lists() {
        let spec = RequirementSpec::from_value(&json!({
            "instruments": ["Scalpel", "Clamp", "Scalpel"],
            "trays": ["Basic Tray"]
        }))
        .expect("parse");
        assert_eq!(spec.count(ItemKind::Instrument, "Scalpel"), Some(2));
        assert_eq!(spec.count(ItemKind::Instrument, "Clamp"), Some(1));
        assert_eq!(spec.count(ItemKind::Tray, "Basic Tray"), Some(1));
    }

    #[test]
    fn missing_groups_and_null_are_empty() {
        assert!(RequirementSpec::from_value(&json!({})).expect("parse").is_empty());
        assert!(RequirementSpec::from_value(&Value::Null).expect("parse").is_empty());
    }

    #[test]
    fn rejects_negative_counts() {
        let err = RequirementSpec::from_value(&json!({"instruments": {"Scalpel": -1}}))
            .expect_err("negative count");
        assert!(matches!(err, TrackError::InvalidRequirement(_)));
    }

    #[test]
    fn rejects_fractional_counts() {
        assert!(RequirementSpec::from_value(&json!({"trays": {"Basic Tray": 1.5}})).is_err());
    }

    #[test]
    fn deserializes_through_serde() {
        let spec: RequirementSpec =
            serde_json::from_str(r#"{"instruments": ["Clamp"]}"#).expect("deserialize");
        assert_eq!(spec, RequirementSpec::new().with(ItemKind::Instrument, "Clamp", 1));
    }

    #[test]
    fn to_value_uses_count_map_form() {
        let spec = RequirementSpec::new().with(ItemKind::Tray, "Basic Tray", 1);
        assert_eq!(
            spec.to_value(),
            json!({"instruments": {}, "trays": {"Basic Tray": 1}})
        );
    }
}
