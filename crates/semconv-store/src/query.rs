use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{AttributeValue, Record, RecordId, SchemaVersion};

/// The attribute a predicate reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeRef {
    /// A single attribute path.
    Path(String),
    /// The first of several paths that is present on the record. Used to read
    /// an attribute from both its old and new locations.
    Coalesce(Vec<String>),
}

impl AttributeRef {
    pub fn path(path: impl Into<String>) -> Self {
        Self::Path(path.into())
    }

    /// Every path this reference may read.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Path(p) => vec![p.as_str()],
            Self::Coalesce(ps) => ps.iter().map(String::as_str).collect(),
        }
    }

    /// Resolve the reference against a record.
    pub fn read<'r>(&self, record: &'r Record) -> Option<&'r AttributeValue> {
        match self {
            Self::Path(p) => record.get(p),
            Self::Coalesce(ps) => ps.iter().find_map(|p| record.get(p)),
        }
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => f.write_str(p),
            Self::Coalesce(ps) => write!(f, "coalesce({})", ps.join(", ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// The attribute is present; the predicate value is ignored.
    Exists,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Exists => "exists",
        }
    }
}

/// A single attribute condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub attribute: AttributeRef,
    pub op: Operator,
    pub value: AttributeValue,
}

impl Predicate {
    pub fn new(attribute: AttributeRef, op: Operator, value: impl Into<AttributeValue>) -> Self {
        Self {
            attribute,
            op,
            value: value.into(),
        }
    }

    pub fn equals(path: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::new(AttributeRef::path(path), Operator::Eq, value)
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::new(AttributeRef::path(path), Operator::Exists, AttributeValue::Null)
    }

    /// Evaluate the predicate. A missing attribute only satisfies `Ne`.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = match self.attribute.read(record) {
            Some(v) => v,
            None => return self.op == Operator::Ne,
        };
        let ord = actual.compare(&self.value);
        match self.op {
            Operator::Exists => true,
            Operator::Eq => ord == Some(Ordering::Equal),
            Operator::Ne => ord != Some(Ordering::Equal),
            Operator::Gt => ord == Some(Ordering::Greater),
            Operator::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            Operator::Lt => ord == Some(Ordering::Less),
            Operator::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Operator::Exists => write!(f, "{} exists", self.attribute),
            op => write!(f, "{} {} {}", self.attribute, op.symbol(), self.value),
        }
    }
}

/// A conjunction of predicates expressed in the attribute paths of `version`.
///
/// Queries are never mutated in place; rewrites produce new queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub predicates: Vec<Predicate>,
    pub version: SchemaVersion,
}

impl Query {
    pub fn new(version: impl Into<SchemaVersion>) -> Self {
        Self {
            predicates: Vec::new(),
            version: version.into(),
        }
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }

    /// The attributes and operators of this query, without values.
    pub fn shape(&self) -> QueryShape {
        QueryShape(
            self.predicates
                .iter()
                .map(|p| (p.attribute.clone(), p.op))
                .collect(),
        )
    }
}

/// Value-independent fingerprint of a query; two queries differing only in
/// their predicate values share a shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryShape(pub Vec<(AttributeRef, Operator)>);

/// Half-open `[start, end)` range over `Record::observed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl TimeRange {
    pub fn contains(&self, millis: u64) -> bool {
        self.start.map_or(true, |s| millis >= s) && self.end.map_or(true, |e| millis < e)
    }
}

/// Selection of records for a scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Accepted version tags. Empty accepts every version.
    pub versions: Vec<SchemaVersion>,
    pub time_range: Option<TimeRange>,
    pub predicates: Vec<Predicate>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_query(query: &Query) -> Self {
        Self {
            predicates: query.predicates.clone(),
            ..Self::default()
        }
    }

    pub fn with_versions(mut self, versions: impl IntoIterator<Item = SchemaVersion>) -> Self {
        self.versions = versions.into_iter().collect();
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        (self.versions.is_empty() || self.versions.contains(&record.version))
            && self
                .time_range
                .map_or(true, |r| r.contains(record.observed_at))
            && self.predicates.iter().all(|p| p.matches(record))
    }
}

/// Identifier of a persisted query definition.
pub type SavedQueryId = RecordId;

/// A persisted query definition (dashboard panel, monitor, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedQuery {
    pub id: SavedQueryId,
    pub name: String,
    pub query: Query,
}

impl SavedQuery {
    pub fn new(id: impl Into<SavedQueryId>, name: impl Into<String>, query: Query) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            query,
        }
    }

    pub fn version(&self) -> &SchemaVersion {
        &self.query.version
    }
}
