use super::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Separator between the owning component (or feature view) and the
/// feature name in a fully-qualified feature name
pub const FEATURE_NAME_SEPARATOR: char = ':';

/// A single feature value. `Absent` is an explicit "no value" and is
/// distinct from a feature that was never fetched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Float(f64),
    Text(String),
    FloatList(Vec<f64>),
    #[default]
    Absent,
}

impl FeatureValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FeatureValue::Absent)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Decode a JSON cell coming back from a store or an inference backend.
    /// Shapes other than number, string, list of numbers and null become
    /// `Absent`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FeatureValue::Absent,
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(FeatureValue::Float)
                .unwrap_or(FeatureValue::Absent),
            serde_json::Value::Bool(b) => FeatureValue::Float(if *b { 1.0 } else { 0.0 }),
            serde_json::Value::String(s) => FeatureValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                let floats: Option<Vec<f64>> = items.iter().map(|item| item.as_f64()).collect();
                match floats {
                    Some(floats) => FeatureValue::FloatList(floats),
                    None => {
                        warn!("dropping non-numeric list feature value");
                        FeatureValue::Absent
                    }
                }
            }
            serde_json::Value::Object(_) => {
                warn!("dropping object feature value");
                FeatureValue::Absent
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FeatureValue::Float(v) => serde_json::json!(v),
            FeatureValue::Text(s) => serde_json::Value::String(s.clone()),
            FeatureValue::FloatList(values) => serde_json::json!(values),
            FeatureValue::Absent => serde_json::Value::Null,
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Float(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Text(v)
    }
}

impl From<Vec<f64>> for FeatureValue {
    fn from(v: Vec<f64>) -> Self {
        FeatureValue::FloatList(v)
    }
}

/// Prefix `feature` with `component:` unless it already carries it
pub fn qualify_feature_name(component: &str, feature: &str) -> String {
    match feature.split_once(FEATURE_NAME_SEPARATOR) {
        Some((prefix, _)) if prefix == component => feature.to_string(),
        _ => format!("{}{}{}", component, FEATURE_NAME_SEPARATOR, feature),
    }
}

/// Component (or feature view) that owns a qualified feature name
pub fn feature_owner(feature_name: &str) -> Option<&str> {
    feature_name
        .split_once(FEATURE_NAME_SEPARATOR)
        .map(|(owner, _)| owner)
}

/// One identifier's feature bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureData {
    pub identifier: Identifier,
    pub features: BTreeMap<String, FeatureValue>,
}

impl FeatureData {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }

    /// Rewrite every feature name to `<component>:<name>`
    pub fn qualified(self, component: &str) -> Self {
        let features = self
            .features
            .into_iter()
            .map(|(name, value)| (qualify_feature_name(component, &name), value))
            .collect();
        Self {
            identifier: self.identifier,
            features,
        }
    }
}

/// Identifier -> feature bag for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureMap {
    entries: HashMap<Identifier, FeatureData>,
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every identifier x feature name combination, all absent
    pub fn with_absent<'a, I, N>(identifiers: I, feature_names: N) -> Self
    where
        I: IntoIterator<Item = &'a Identifier>,
        N: IntoIterator<Item = &'a String> + Clone,
    {
        let mut map = Self::new();
        map.fill_absent(identifiers, feature_names);
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identifier: &Identifier) -> Option<&FeatureData> {
        self.entries.get(identifier)
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.entries.contains_key(identifier)
    }

    /// `None` when the feature was never fetched for this identifier
    pub fn feature(&self, identifier: &Identifier, name: &str) -> Option<&FeatureValue> {
        self.entries.get(identifier).and_then(|data| data.get(name))
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &Identifier> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, &FeatureData)> {
        self.entries.iter()
    }

    /// Write every feature of `data`; existing values for the same names
    /// are replaced.
    pub fn apply(&mut self, data: FeatureData) {
        let entry = self
            .entries
            .entry(data.identifier.clone())
            .or_insert_with(|| FeatureData::new(data.identifier.clone()));
        entry.features.extend(data.features);
    }

    pub fn set(&mut self, identifier: &Identifier, name: impl Into<String>, value: FeatureValue) {
        self.entries
            .entry(identifier.clone())
            .or_insert_with(|| FeatureData::new(identifier.clone()))
            .features
            .insert(name.into(), value);
    }

    /// Apply every entry of `other` on top of this map
    pub fn overlay(&mut self, other: &FeatureMap) {
        for data in other.entries.values() {
            self.apply(data.clone());
        }
    }

    /// Ensure each identifier has an entry and each name a value, without
    /// touching values that are already present.
    pub fn fill_absent<'a, I, N>(&mut self, identifiers: I, feature_names: N)
    where
        I: IntoIterator<Item = &'a Identifier>,
        N: IntoIterator<Item = &'a String> + Clone,
    {
        for identifier in identifiers {
            let entry = self
                .entries
                .entry(identifier.clone())
                .or_insert_with(|| FeatureData::new(identifier.clone()));
            for name in feature_names.clone() {
                entry
                    .features
                    .entry(name.clone())
                    .or_insert(FeatureValue::Absent);
            }
        }
    }
}
