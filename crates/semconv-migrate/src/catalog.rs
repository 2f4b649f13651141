//! Cache of attribute mappings with per-key fetch coalescing.
//!
//! Published mappings live in a copy-on-write snapshot: readers clone an
//! `Arc` of the current map and never observe a half-applied update. A
//! separate in-flight table holds one shared future per key being fetched so
//! concurrent misses for the same pair trigger a single external call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use semconv_store::SchemaVersion;
use thiserror::Error;

use crate::audit::{self, AuditEvent, AuditSink};
use crate::mapping::{AttributeMapping, InvalidMapping, MappingKey};
use crate::retry::{retry, Backoff, Retried};
use crate::source::{SchemaSource, SourceError};
use crate::version::{VersionError, VersionSet};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error(transparent)]
    Unsupported(#[from] VersionError),
    /// The schema source failed on every attempt. Callers may retry later.
    #[error("fetching mapping {from}→{to} failed after {attempts} attempt(s): {reason}")]
    SchemaFetch {
        from: SchemaVersion,
        to: SchemaVersion,
        attempts: u32,
        reason: String,
    },
    /// The source has no rename table for this pair. Retrying will not help.
    #[error("no rename table for {from}→{to}")]
    NotFound { from: SchemaVersion, to: SchemaVersion },
    #[error("invalid mapping {key}: {source}")]
    Invalid {
        key: MappingKey,
        #[source]
        source: InvalidMapping,
    },
}

impl MappingError {
    /// Only fetch failures are worth retrying. Version, missing-table and
    /// payload errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SchemaFetch { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub max_fetch_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound on a single fetch attempt.
    pub fetch_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_fetch_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_millis(2_000)),
            fetch_timeout: Duration::from_millis(5_000),
        }
    }
}

type FetchResult = Result<Arc<AttributeMapping>, MappingError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
type Snapshot = Arc<HashMap<MappingKey, Arc<AttributeMapping>>>;

struct CatalogInner {
    versions: VersionSet,
    source: Arc<dyn SchemaSource>,
    audit: Arc<dyn AuditSink>,
    config: CatalogConfig,
    published: RwLock<Snapshot>,
    in_flight: Mutex<HashMap<MappingKey, SharedFetch>>,
    revision: AtomicU64,
}

/// Resolves `(from, to)` version pairs to [`AttributeMapping`]s.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct MappingCatalog {
    inner: Arc<CatalogInner>,
}

impl MappingCatalog {
    pub fn new(
        versions: VersionSet,
        source: Arc<dyn SchemaSource>,
        audit: Arc<dyn AuditSink>,
        config: CatalogConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                versions,
                source,
                audit,
                config,
                published: RwLock::new(Arc::new(HashMap::new())),
                in_flight: Mutex::new(HashMap::new()),
                revision: AtomicU64::new(0),
            }),
        }
    }

    pub fn versions(&self) -> &VersionSet {
        &self.inner.versions
    }

    /// Return the mapping for `(from, to)`, fetching it at most once no
    /// matter how many callers miss concurrently. Failed fetches are not
    /// cached.
    pub async fn get_mapping(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
    ) -> Result<Arc<AttributeMapping>, MappingError> {
        self.inner.versions.check(from)?;
        self.inner.versions.check(to)?;
        let key = MappingKey::new(from.clone(), to.clone());

        if let Some(mapping) = self.inner.cached(&key) {
            return Ok(mapping);
        }

        let fetch = {
            let mut in_flight = self.inner.in_flight.lock();
            // Re-check under the lock: a fetch may have published and left
            // the in-flight table since the first look.
            if let Some(mapping) = self.inner.cached(&key) {
                return Ok(mapping);
            }
            match in_flight.get(&key) {
                Some(fetch) => {
                    tracing::debug!(%key, "joining in-flight mapping fetch");
                    fetch.clone()
                }
                None => {
                    let fetch = CatalogInner::fetch_and_publish(Arc::clone(&self.inner), key.clone())
                        .boxed()
                        .shared();
                    in_flight.insert(key, fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Fetch `(from, to)` again and replace the cached entry wholesale. Holders
    /// of the previous mapping keep their copy.
    pub async fn refresh(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
    ) -> Result<Arc<AttributeMapping>, MappingError> {
        self.inner.versions.check(from)?;
        self.inner.versions.check(to)?;
        let key = MappingKey::new(from.clone(), to.clone());
        let mapping = self.inner.fetch(&key).await?;
        self.inner.publish(Arc::clone(&mapping));
        Ok(mapping)
    }

    /// The published mapping for a pair, without fetching.
    pub fn cached(&self, from: &SchemaVersion, to: &SchemaVersion) -> Option<Arc<AttributeMapping>> {
        self.inner
            .cached(&MappingKey::new(from.clone(), to.clone()))
    }

    /// Keys of every published mapping, sorted.
    pub fn cached_pairs(&self) -> Vec<MappingKey> {
        let snapshot = Arc::clone(&self.inner.published.read());
        let mut keys: Vec<MappingKey> = snapshot.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl CatalogInner {
    fn cached(&self, key: &MappingKey) -> Option<Arc<AttributeMapping>> {
        self.published.read().get(key).cloned()
    }

    fn publish(&self, mapping: Arc<AttributeMapping>) {
        let mut published = self.published.write();
        let mut next = HashMap::clone(&published);
        next.insert(mapping.key().clone(), mapping);
        *published = Arc::new(next);
    }

    async fn fetch_and_publish(self: Arc<Self>, key: MappingKey) -> FetchResult {
        let result = self.fetch(&key).await;
        if let Ok(mapping) = &result {
            self.publish(Arc::clone(mapping));
        }
        // Removed after publishing so late callers always find one or the other.
        self.in_flight.lock().remove(&key);
        result
    }

    async fn fetch(&self, key: &MappingKey) -> FetchResult {
        let started = Instant::now();
        let source = &self.source;
        let timeout = self.config.fetch_timeout;

        let Retried { result, attempts } = retry(
            self.config.backoff,
            self.config.max_fetch_attempts,
            SourceError::is_retryable,
            move |attempt| async move {
                tracing::debug!(%key, attempt, "fetching rename table");
                match tokio::time::timeout(timeout, source.fetch(&key.from, &key.to)).await {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Unavailable(format!(
                        "fetch timed out after {timeout:?}"
                    ))),
                }
            },
        )
        .await;

        let renames = result.map_err(|e| {
            tracing::warn!(%key, attempts, err = %e, "mapping fetch failed");
            match e {
                SourceError::Malformed { reason, .. } => MappingError::Invalid {
                    key: key.clone(),
                    source: InvalidMapping::Malformed(reason),
                },
                SourceError::NotFound(_) => MappingError::NotFound {
                    from: key.from.clone(),
                    to: key.to.clone(),
                },
                other => MappingError::SchemaFetch {
                    from: key.from.clone(),
                    to: key.to.clone(),
                    attempts,
                    reason: other.to_string(),
                },
            }
        })?;

        let mapping = AttributeMapping::new(key.clone(), renames).map_err(|source| {
            tracing::warn!(%key, err = %source, "rejecting invalid rename table");
            MappingError::Invalid {
                key: key.clone(),
                source,
            }
        })?;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mapping = Arc::new(mapping.with_revision(revision));

        tracing::info!(
            %key,
            revision,
            renames = mapping.len(),
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mapping fetched"
        );
        audit::emit(
            &self.audit,
            AuditEvent::MappingFetched {
                from: key.from.clone(),
                to: key.to.clone(),
                revision,
                renames: mapping.len(),
                attempts,
                at: Utc::now(),
            },
        );
        Ok(mapping)
    }
}
