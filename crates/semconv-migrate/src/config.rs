//! Engine configuration, loaded from `semconv.toml`.
//!
//! ```toml
//! [versions]
//! supported = ["1.25", "1.32"]
//! default = "1.32"
//!
//! [migration]
//! workers = 8
//!
//! [[mappings]]
//! from = "1.25"
//! to = "1.32"
//! [mappings.renames]
//! "attributes.custom.trade_type" = "attributes.trade.type"
//! ```
//!
//! Every section is optional except `[versions]`; missing keys take the
//! defaults below.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use semconv_store::SchemaVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogConfig;
use crate::coordinator::CoordinatorConfig;
use crate::mapping::{AttributeMapping, MappingKey};
use crate::resolver::{ResolverConfig, ResolverMode};
use crate::retry::Backoff;
use crate::saved_queries::SavedQueryMode;
use crate::source::{DirectorySchemaSource, SchemaSource, StaticSchemaSource};
use crate::version::{VersionError, VersionSet};

/// Default config file name looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "semconv.toml";

/// One problem found by [`EngineConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Config key the issue is about, e.g. `migration.workers`.
    pub key: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn at(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "[{key}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", join_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionsConfig {
    /// Supported versions, oldest first. This order is the version order.
    #[serde(default)]
    pub supported: Vec<SchemaVersion>,
    /// Current version. Defaults to the last supported one.
    pub default: Option<SchemaVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    pub max_fetch_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Read rename tables from `<schema_dir>/<from>/<to>.json` instead of
    /// the `[[mappings]]` tables below.
    pub schema_dir: Option<PathBuf>,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            max_fetch_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            fetch_timeout_ms: 5_000,
            schema_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    pub workers: usize,
    pub page_size: usize,
    pub write_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub failure_ratio_threshold: f64,
    pub failure_ratio_min_scanned: u64,
    pub operation_timeout_ms: u64,
    pub drain_on_cancel: bool,
    pub retained_jobs: usize,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            workers: 4,
            page_size: 256,
            write_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            failure_ratio_threshold: 0.05,
            failure_ratio_min_scanned: 100,
            operation_timeout_ms: 10_000,
            drain_on_cancel: true,
            retained_jobs: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub mode: ResolverMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedQueriesSection {
    pub mode: SavedQueryMode,
}

/// A rename table declared inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub versions: VersionsConfig,
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub migration: MigrationSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub saved_queries: SavedQueriesSection,
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
}

impl EngineConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), versions = config.versions.supported.len(), "config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Check the whole config and report every problem found, not just the
    /// first.
    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        let supported: HashSet<&SchemaVersion> = self.versions.supported.iter().collect();

        if self.versions.supported.is_empty() {
            issues.push(ValidationIssue::at(
                "versions.supported",
                "at least one schema version must be supported",
            ));
        }
        if supported.len() != self.versions.supported.len() {
            issues.push(ValidationIssue::at("versions.supported", "duplicate schema version"));
        }
        if let Some(default) = &self.versions.default {
            if !supported.contains(default) {
                issues.push(ValidationIssue::at(
                    "versions.default",
                    format!("default version {default} is not in versions.supported"),
                ));
            }
        }

        if self.catalog.max_fetch_attempts == 0 {
            issues.push(ValidationIssue::at("catalog.max_fetch_attempts", "must be > 0"));
        }
        if self.catalog.initial_backoff_ms > self.catalog.max_backoff_ms {
            issues.push(ValidationIssue::at(
                "catalog.initial_backoff_ms",
                "must not exceed catalog.max_backoff_ms",
            ));
        }
        if self.catalog.fetch_timeout_ms == 0 {
            issues.push(ValidationIssue::at("catalog.fetch_timeout_ms", "must be > 0"));
        }

        let m = &self.migration;
        if m.workers == 0 {
            issues.push(ValidationIssue::at("migration.workers", "must be > 0"));
        }
        if m.page_size == 0 {
            issues.push(ValidationIssue::at("migration.page_size", "must be > 0"));
        }
        if m.write_attempts == 0 {
            issues.push(ValidationIssue::at("migration.write_attempts", "must be > 0"));
        }
        if m.initial_backoff_ms > m.max_backoff_ms {
            issues.push(ValidationIssue::at(
                "migration.initial_backoff_ms",
                "must not exceed migration.max_backoff_ms",
            ));
        }
        if !(m.failure_ratio_threshold > 0.0 && m.failure_ratio_threshold <= 1.0) {
            issues.push(ValidationIssue::at(
                "migration.failure_ratio_threshold",
                format!("must be in (0, 1], got {}", m.failure_ratio_threshold),
            ));
        }
        if m.operation_timeout_ms == 0 {
            issues.push(ValidationIssue::at("migration.operation_timeout_ms", "must be > 0"));
        }

        let mut pairs = HashSet::new();
        for (i, entry) in self.mappings.iter().enumerate() {
            let key = format!("mappings[{i}]");
            for version in [&entry.from, &entry.to] {
                if !supported.contains(version) {
                    issues.push(ValidationIssue::at(
                        key.clone(),
                        format!("version {version} is not in versions.supported"),
                    ));
                }
            }
            let pair = MappingKey::new(entry.from.clone(), entry.to.clone());
            if let Err(e) = AttributeMapping::new(pair.clone(), entry.renames.clone()) {
                issues.push(ValidationIssue::at(key.clone(), e.to_string()));
            }
            if !pairs.insert(pair) {
                issues.push(ValidationIssue::at(
                    key,
                    format!("duplicate mapping {}→{}", entry.from, entry.to),
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    pub fn default_version(&self) -> Option<&SchemaVersion> {
        self.versions
            .default
            .as_ref()
            .or_else(|| self.versions.supported.last())
    }

    pub fn version_set(&self) -> Result<VersionSet, VersionError> {
        let default = self
            .default_version()
            .cloned()
            .ok_or_else(|| VersionError::Unsupported(SchemaVersion::new("")))?;
        VersionSet::new(self.versions.supported.iter().cloned(), default)
    }

    pub fn catalog_config(&self) -> CatalogConfig {
        CatalogConfig {
            max_fetch_attempts: self.catalog.max_fetch_attempts,
            backoff: Backoff::new(
                Duration::from_millis(self.catalog.initial_backoff_ms),
                Duration::from_millis(self.catalog.max_backoff_ms),
            ),
            fetch_timeout: Duration::from_millis(self.catalog.fetch_timeout_ms),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let m = &self.migration;
        CoordinatorConfig {
            workers: m.workers,
            page_size: m.page_size,
            write_attempts: m.write_attempts,
            write_backoff: Backoff::new(
                Duration::from_millis(m.initial_backoff_ms),
                Duration::from_millis(m.max_backoff_ms),
            ),
            failure_ratio_threshold: m.failure_ratio_threshold,
            failure_ratio_min_scanned: m.failure_ratio_min_scanned,
            operation_timeout: Duration::from_millis(m.operation_timeout_ms),
            drain_on_cancel: m.drain_on_cancel,
            retained_jobs: m.retained_jobs,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            mode: self.resolver.mode,
            operation_timeout: Duration::from_millis(self.migration.operation_timeout_ms),
        }
    }

    /// The schema source this config describes: a directory of JSON tables
    /// when `catalog.schema_dir` is set, the inline `[[mappings]]` otherwise.
    pub fn schema_source(&self) -> Arc<dyn SchemaSource> {
        match &self.catalog.schema_dir {
            Some(dir) => Arc::new(DirectorySchemaSource::new(dir)),
            None => Arc::new(self.static_source()),
        }
    }

    pub fn static_source(&self) -> StaticSchemaSource {
        let mut source = StaticSchemaSource::new();
        for entry in &self.mappings {
            source.insert(
                MappingKey::new(entry.from.clone(), entry.to.clone()),
                entry.renames.clone(),
            );
        }
        source
    }
}
