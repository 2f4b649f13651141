use semconv_store::SchemaVersion;
use thiserror::Error;

/// A version tag outside the configured supported set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("unsupported schema version {0}")]
    Unsupported(SchemaVersion),
}

/// The supported schema versions, in configured order, plus the default
/// (current) version.
///
/// Configured order is the only ordering versions have; version strings are
/// never parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSet {
    supported: Vec<SchemaVersion>,
    default: SchemaVersion,
}

impl VersionSet {
    /// Build a version set. Fails if `default` is not one of `supported`.
    /// Duplicate entries keep their first position.
    pub fn new(
        supported: impl IntoIterator<Item = SchemaVersion>,
        default: SchemaVersion,
    ) -> Result<Self, VersionError> {
        let mut ordered: Vec<SchemaVersion> = Vec::new();
        for v in supported {
            if !ordered.contains(&v) {
                ordered.push(v);
            }
        }
        if !ordered.contains(&default) {
            return Err(VersionError::Unsupported(default));
        }
        Ok(Self {
            supported: ordered,
            default,
        })
    }

    pub fn supported(&self) -> &[SchemaVersion] {
        &self.supported
    }

    pub fn default_version(&self) -> &SchemaVersion {
        &self.default
    }

    pub fn contains(&self, version: &SchemaVersion) -> bool {
        self.supported.contains(version)
    }

    pub fn check(&self, version: &SchemaVersion) -> Result<(), VersionError> {
        if self.contains(version) {
            Ok(())
        } else {
            Err(VersionError::Unsupported(version.clone()))
        }
    }

    /// Position of `version` in configured order.
    pub fn position(&self, version: &SchemaVersion) -> Option<usize> {
        self.supported.iter().position(|v| v == version)
    }

    /// Supported versions configured before `target`, nearest first.
    pub fn preceding(&self, target: &SchemaVersion) -> Vec<SchemaVersion> {
        match self.position(target) {
            Some(idx) => self.supported[..idx].iter().rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Map an incoming version tag onto a supported one: supported tags pass
    /// through, anything else becomes the default version.
    pub fn normalize(&self, version: Option<&SchemaVersion>) -> SchemaVersion {
        match version {
            Some(v) if self.contains(v) => v.clone(),
            Some(v) => {
                tracing::warn!(
                    version = %v,
                    default = %self.default,
                    "unsupported schema version on ingest, using default"
                );
                self.default.clone()
            }
            None => self.default.clone(),
        }
    }
}
