use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute path under which a record's version tag is exported.
pub const VERSION_ATTRIBUTE: &str = "attributes.semconv_version";

/// Identifier of a named set of attribute-path conventions (e.g. `"1.32"`).
///
/// Versions are opaque: their ordering comes from configuration, not from
/// parsing the string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(String);

impl SchemaVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SchemaVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identity of a stored record. Stores page through records in
/// ascending id order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttributeValue {
    /// Compare two values. Integers and floats compare numerically; values of
    /// unrelated kinds are unordered.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        use AttributeValue::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (String(a), String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Flat attribute map keyed by dotted attribute path.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A stored trade-event record.
///
/// The version tag is held apart from the attribute map so that every record
/// carries exactly one tag at any instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub version: SchemaVersion,
    /// Event time in milliseconds since the Unix epoch.
    pub observed_at: u64,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, version: impl Into<SchemaVersion>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            observed_at: 0,
            attributes: Attributes::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, path: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(path.into(), value.into());
        self
    }

    pub fn observed_at(mut self, millis: u64) -> Self {
        self.observed_at = millis;
        self
    }

    pub fn get(&self, path: &str) -> Option<&AttributeValue> {
        self.attributes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.attributes.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_compare_across_kinds() {
        let int = AttributeValue::Int(3);
        let float = AttributeValue::Float(3.5);
        assert_eq!(int.compare(&float), Some(Ordering::Less));
        assert_eq!(float.compare(&int), Some(Ordering::Greater));
        assert_eq!(
            AttributeValue::Int(2).compare(&AttributeValue::Float(2.0)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn unrelated_kinds_are_unordered() {
        let s = AttributeValue::from("7");
        assert_eq!(s.compare(&AttributeValue::Int(7)), None);
        assert_eq!(AttributeValue::Bool(true).compare(&AttributeValue::Null), None);
    }

    #[test]
    fn record_builder_sets_attributes() {
        let record = Record::new("r1", "1.25")
            .with("attributes.trade_id", "123")
            .with("attributes.amount", 42i64)
            .observed_at(1_000);

        assert_eq!(record.version.as_str(), "1.25");
        assert_eq!(record.observed_at, 1_000);
        assert_eq!(record.get("attributes.trade_id"), Some(&AttributeValue::from("123")));
        assert!(record.contains("attributes.amount"));
        assert!(!record.contains("attributes.missing"));
    }
}
