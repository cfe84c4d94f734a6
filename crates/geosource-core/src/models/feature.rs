use serde::{Deserialize, Serialize};
use std::fmt;

use super::geometry::Geometry;
use super::value::Value;

/// Backend-assigned feature identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    Integer(i64),
    Text(String),
}

impl FeatureId {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureId::Integer(i) => Some(*i),
            FeatureId::Text(s) => s.parse().ok(),
        }
    }

    /// The identifier as an attribute value, for binding into native queries
    pub fn to_value(&self) -> Value {
        match self {
            FeatureId::Integer(i) => Value::Integer(*i),
            FeatureId::Text(s) => Value::Text(s.clone()),
        }
    }

    /// Identifier from an attribute value; null and binary values have no id form
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(FeatureId::Integer(*i)),
            Value::Float(f) if f.fract() == 0.0 => Some(FeatureId::Integer(*f as i64)),
            Value::Text(s) => Some(FeatureId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Integer(i) => write!(f, "{i}"),
            FeatureId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FeatureId {
    fn from(v: i64) -> Self {
        FeatureId::Integer(v)
    }
}

impl From<&str> for FeatureId {
    fn from(v: &str) -> Self {
        FeatureId::Text(v.to_string())
    }
}

/// Ordered mapping from field name to value.
///
/// Names keep their original case; lookups compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeTable {
    entries: Vec<(String, Value)>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Insert or replace a value; replacing keeps the original position and spelling
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|idx| &self.entries[idx].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    /// Keep only the named fields, in the order given
    pub fn project(&self, names: &[String]) -> AttributeTable {
        let mut out = AttributeTable::with_capacity(names.len());
        for name in names {
            if let Some(idx) = self.position(name) {
                let (key, value) = &self.entries[idx];
                out.entries.push((key.clone(), value.clone()));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Render as a JSON object, preserving field order
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> =
            self.entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        serde_json::Value::Object(map)
    }
}

impl FromIterator<(String, Value)> for AttributeTable {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut table = AttributeTable::new();
        for (k, v) in iter {
            table.set(k, v);
        }
        table
    }
}

impl IntoIterator for AttributeTable {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A feature: identifier, optional geometry and attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: Option<Geometry>,
    pub attributes: AttributeTable,
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, geometry: Option<Geometry>) -> Self {
        Self { id: id.into(), geometry, attributes: AttributeTable::new() }
    }

    /// Builder-style attribute insert
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.set(name, value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}
