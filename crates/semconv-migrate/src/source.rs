//! Where rename tables come from.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use semconv_store::SchemaVersion;
use thiserror::Error;

use crate::mapping::MappingKey;

/// `old_path → new_path` rename table as delivered by a schema source.
pub type Renames = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The source could not be reached or did not answer. Worth retrying.
    #[error("schema source unavailable: {0}")]
    Unavailable(String),
    /// The source has no rename table for this pair.
    #[error("no rename table for {0}")]
    NotFound(MappingKey),
    /// The source answered with something that is not a rename table.
    #[error("malformed rename table for {key}: {reason}")]
    Malformed { key: MappingKey, reason: String },
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// External provider of attribute-rename tables between schema versions.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch(&self, from: &SchemaVersion, to: &SchemaVersion) -> Result<Renames, SourceError>;
}

/// Rename tables held in memory, typically loaded from configuration.
///
/// A pair with no entry resolves to an empty table when both versions are
/// the same, and to `NotFound` otherwise.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaSource {
    tables: HashMap<MappingKey, Renames>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renames<O, N>(
        mut self,
        from: impl Into<SchemaVersion>,
        to: impl Into<SchemaVersion>,
        renames: impl IntoIterator<Item = (O, N)>,
    ) -> Self
    where
        O: Into<String>,
        N: Into<String>,
    {
        self.insert(
            MappingKey::new(from, to),
            renames
                .into_iter()
                .map(|(o, n)| (o.into(), n.into()))
                .collect(),
        );
        self
    }

    pub fn insert(&mut self, key: MappingKey, renames: Renames) {
        self.tables.insert(key, renames);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn fetch(&self, from: &SchemaVersion, to: &SchemaVersion) -> Result<Renames, SourceError> {
        let key = MappingKey::new(from.clone(), to.clone());
        match self.tables.get(&key) {
            Some(renames) => Ok(renames.clone()),
            None if from == to => Ok(Renames::new()),
            None => Err(SourceError::NotFound(key)),
        }
    }
}

/// Rename tables stored as JSON objects at `<root>/<from>/<to>.json`.
///
/// ```text
/// schemas/
/// └── 1.25/
///     └── 1.32.json   {"attributes.custom.trade_type": "attributes.trade.type"}
/// ```
#[derive(Debug, Clone)]
pub struct DirectorySchemaSource {
    root: PathBuf,
}

impl DirectorySchemaSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, from: &SchemaVersion, to: &SchemaVersion) -> PathBuf {
        self.root
            .join(from.as_str())
            .join(format!("{}.json", to.as_str()))
    }
}

#[async_trait]
impl SchemaSource for DirectorySchemaSource {
    async fn fetch(&self, from: &SchemaVersion, to: &SchemaVersion) -> Result<Renames, SourceError> {
        let key = MappingKey::new(from.clone(), to.clone());
        let path = self.table_path(from, to);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if from == to {
                    return Ok(Renames::new());
                }
                return Err(SourceError::NotFound(key));
            }
            Err(e) => {
                return Err(SourceError::Unavailable(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| SourceError::Malformed {
            key,
            reason: e.to_string(),
        })
    }
}
