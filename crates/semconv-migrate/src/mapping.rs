use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use semconv_store::SchemaVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered pair of versions identifying a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingKey {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
}

impl MappingKey {
    pub fn new(from: impl Into<SchemaVersion>, to: impl Into<SchemaVersion>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.from, self.to)
    }
}

/// A rename table that cannot be turned into a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMapping {
    /// Two old paths rename to the same new path, so the reverse lookup
    /// would be ambiguous.
    #[error("paths {first} and {second} both rename to {target}")]
    DuplicateTarget {
        first: String,
        second: String,
        target: String,
    },
    #[error("empty attribute path in rename table")]
    EmptyPath,
    /// The payload could not be read as a rename table at all.
    #[error("malformed rename table: {0}")]
    Malformed(String),
}

/// Which way a rewrite runs through a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Old paths to new paths.
    Forward,
    /// New paths back to old paths.
    Backward,
}

/// Immutable attribute-rename table between two schema versions.
///
/// Once published by the catalog a mapping is never mutated; a refresh
/// publishes a new value with a higher revision.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeMapping {
    key: MappingKey,
    forward: BTreeMap<String, String>,
    reverse: BTreeMap<String, String>,
    revision: u64,
    fetched_at: DateTime<Utc>,
}

impl AttributeMapping {
    /// Build a mapping from an `old_path → new_path` table. Identity entries
    /// are dropped.
    pub fn new(
        key: MappingKey,
        renames: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, InvalidMapping> {
        let mut forward = BTreeMap::new();
        let mut reverse: BTreeMap<String, String> = BTreeMap::new();
        for (old, new) in renames {
            if old.is_empty() || new.is_empty() {
                return Err(InvalidMapping::EmptyPath);
            }
            if old == new {
                continue;
            }
            if let Some(first) = reverse.get(&new) {
                if first != &old {
                    return Err(InvalidMapping::DuplicateTarget {
                        first: first.clone(),
                        second: old,
                        target: new,
                    });
                }
            }
            reverse.insert(new.clone(), old.clone());
            forward.insert(old, new);
        }
        Ok(Self {
            key,
            forward,
            reverse,
            revision: 0,
            fetched_at: Utc::now(),
        })
    }

    /// Same mapping stamped with the catalog revision it was published under.
    pub(crate) fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn key(&self) -> &MappingKey {
        &self.key
    }

    /// Source version.
    pub fn source_version(&self) -> &SchemaVersion {
        &self.key.from
    }

    /// Target version.
    pub fn target_version(&self) -> &SchemaVersion {
        &self.key.to
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// New path for an old path.
    pub fn forward(&self, old_path: &str) -> Option<&str> {
        self.forward.get(old_path).map(String::as_str)
    }

    /// Old path for a new path.
    pub fn reverse(&self, new_path: &str) -> Option<&str> {
        self.reverse.get(new_path).map(String::as_str)
    }

    pub fn lookup(&self, path: &str, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Forward => self.forward(path),
            Direction::Backward => self.reverse(path),
        }
    }

    /// `old_path → new_path` entries in path order.
    pub fn renames(&self) -> impl Iterator<Item = (&str, &str)> {
        self.forward.iter().map(|(o, n)| (o.as_str(), n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
