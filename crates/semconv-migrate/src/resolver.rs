//! Query resolution across old and new attribute locations.
//!
//! While a migration is in progress, records are split between schema
//! versions. The resolver first runs a query as written, in canonical paths,
//! and then (when that finds nothing, or always in [`ResolverMode::BothPhases`])
//! runs it again rewritten to the paths of every earlier supported version
//! that has a rename table to the target.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use semconv_store::{
    AttributeRef, Predicate, Query, QueryShape, Record, RecordStore, SchemaVersion, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{MappingCatalog, MappingError};
use crate::mapping::{AttributeMapping, Direction};
use crate::remap::remap_query;
use crate::version::VersionError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverMode {
    /// Only query old locations when the canonical query finds nothing.
    #[default]
    ShortCircuit,
    /// Always query both and merge.
    BothPhases,
}

/// Which phase produced a record, or a whole resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Primary,
    Fallback,
    /// Both phases contributed records.
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRecord {
    pub record: Record,
    pub source: ResolutionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// Unique by record id.
    pub records: Vec<ResolvedRecord>,
    pub source: ResolutionSource,
}

impl Resolution {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    /// The store failed. Fallback is never used to paper over this.
    #[error("query execution failed: {0}")]
    QueryExecution(#[from] StoreError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Version(#[from] VersionError),
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub mode: ResolverMode,
    /// Upper bound on each store query.
    pub operation_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: ResolverMode::ShortCircuit,
            operation_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RewriteKey {
    shape: QueryShape,
    source: SchemaVersion,
    target: SchemaVersion,
}

/// Rewritten attribute refs of one query shape, valid for a single mapping
/// revision.
#[derive(Debug, Clone)]
struct CachedRewrite {
    revision: u64,
    attributes: Arc<Vec<AttributeRef>>,
}

/// Hit and miss counts of the rewrite cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct QueryResolver {
    store: Arc<dyn RecordStore>,
    catalog: MappingCatalog,
    config: ResolverConfig,
    rewrites: Mutex<HashMap<RewriteKey, CachedRewrite>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryResolver {
    pub fn new(store: Arc<dyn RecordStore>, catalog: MappingCatalog, config: ResolverConfig) -> Self {
        Self {
            store,
            catalog,
            config,
            rewrites: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ResolverMode {
        self.config.mode
    }

    /// Resolve with the configured mode.
    pub async fn resolve(&self, query: &Query, target: &SchemaVersion) -> Result<Resolution, ResolveError> {
        self.resolve_with(query, target, self.config.mode).await
    }

    /// Resolve `query`, expressed in the canonical paths of `target`.
    pub async fn resolve_with(
        &self,
        query: &Query,
        target: &SchemaVersion,
        mode: ResolverMode,
    ) -> Result<Resolution, ResolveError> {
        self.catalog.versions().check(target)?;

        let primary = self.execute(query).await?;
        tracing::debug!(%target, records = primary.len(), "primary phase done");
        if mode == ResolverMode::ShortCircuit && !primary.is_empty() {
            return Ok(Resolution {
                records: tag(primary, ResolutionSource::Primary),
                source: ResolutionSource::Primary,
            });
        }

        let mut fallback = Vec::new();
        for version in self.catalog.versions().preceding(target) {
            // Mappings are not transitive: a version with no direct table to
            // the target has no fallback locations.
            let mapping = match self.catalog.get_mapping(&version, target).await {
                Ok(mapping) => mapping,
                Err(MappingError::NotFound { .. }) => {
                    tracing::debug!(%target, from = %version, "no rename table, skipping fallback");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let rewritten = self.fallback_query(query, &mapping);
            let found = self.execute(&rewritten).await?;
            tracing::debug!(%target, from = %version, records = found.len(), "fallback phase done");
            fallback.extend(found);
        }

        Ok(merge(primary, fallback))
    }

    /// Cache statistics. Exposed for diagnostics.
    pub fn rewrite_cache_stats(&self) -> RewriteCacheStats {
        RewriteCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.rewrites.lock().len(),
        }
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let timeout = self.config.operation_timeout;
        tokio::time::timeout(timeout, self.store.query(query))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }

    /// Backward rewrite of `query` through `mapping`, reusing the attribute
    /// refs computed for an earlier query of the same shape when the mapping
    /// has not been republished since.
    fn fallback_query(&self, query: &Query, mapping: &AttributeMapping) -> Query {
        let key = RewriteKey {
            shape: query.shape(),
            source: mapping.source_version().clone(),
            target: mapping.target_version().clone(),
        };

        let cached = self
            .rewrites
            .lock()
            .get(&key)
            .filter(|entry| entry.revision == mapping.revision())
            .map(|entry| Arc::clone(&entry.attributes));

        let attributes = match cached {
            Some(attributes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                attributes
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let rewritten = remap_query(query, mapping, Direction::Backward);
                let attributes: Arc<Vec<AttributeRef>> =
                    Arc::new(rewritten.predicates.into_iter().map(|p| p.attribute).collect());
                self.rewrites.lock().insert(
                    key,
                    CachedRewrite {
                        revision: mapping.revision(),
                        attributes: Arc::clone(&attributes),
                    },
                );
                attributes
            }
        };

        Query {
            predicates: query
                .predicates
                .iter()
                .zip(attributes.iter())
                .map(|(p, attribute)| Predicate {
                    attribute: attribute.clone(),
                    ..p.clone()
                })
                .collect(),
            version: mapping.source_version().clone(),
        }
    }
}

fn tag(records: Vec<Record>, source: ResolutionSource) -> Vec<ResolvedRecord> {
    records
        .into_iter()
        .map(|record| ResolvedRecord { record, source })
        .collect()
}

/// Dedupe by record id. Primary copies win over fallback copies of the same
/// record.
fn merge(primary: Vec<Record>, fallback: Vec<Record>) -> Resolution {
    let mut seen: HashSet<_> = primary.iter().map(|r| r.id.clone()).collect();
    let from_primary = !primary.is_empty();
    let mut records = tag(primary, ResolutionSource::Primary);
    let mut from_fallback = false;
    for record in fallback {
        if seen.insert(record.id.clone()) {
            from_fallback = true;
            records.push(ResolvedRecord {
                record,
                source: ResolutionSource::Fallback,
            });
        }
    }
    let source = match (from_primary, from_fallback) {
        (true, true) => ResolutionSource::Merged,
        (false, true) => ResolutionSource::Fallback,
        _ => ResolutionSource::Primary,
    };
    Resolution { records, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullSink;
    use crate::catalog::CatalogConfig;
    use crate::source::StaticSchemaSource;
    use crate::version::VersionSet;
    use semconv_store::MemoryStore;

    fn resolver(store: Arc<MemoryStore>, mode: ResolverMode) -> QueryResolver {
        let catalog = MappingCatalog::new(
            VersionSet::new(["1.25".into(), "1.32".into()], "1.32".into()).unwrap(),
            Arc::new(StaticSchemaSource::new().with_renames(
                "1.25",
                "1.32",
                [("attributes.custom.trade_type", "attributes.trade.type")],
            )),
            Arc::new(NullSink),
            CatalogConfig::default(),
        );
        QueryResolver::new(
            store,
            catalog,
            ResolverConfig {
                mode,
                ..ResolverConfig::default()
            },
        )
    }

    fn arbitrage() -> Query {
        Query::new("1.32").with(Predicate::equals("attributes.trade.type", "arbitrage"))
    }

    #[test]
    fn merge_prefers_primary_copies() {
        let primary = vec![Record::new("a", "1.32").with("attributes.trade.type", "arbitrage")];
        let fallback = vec![
            Record::new("a", "1.25").with("attributes.custom.trade_type", "arbitrage"),
            Record::new("b", "1.25").with("attributes.custom.trade_type", "arbitrage"),
        ];
        let merged = merge(primary, fallback);
        assert_eq!(merged.source, ResolutionSource::Merged);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.records[0].record.version.as_str(), "1.32");
        assert_eq!(merged.records[0].source, ResolutionSource::Primary);
        assert_eq!(merged.records[1].source, ResolutionSource::Fallback);
    }

    #[test]
    fn merge_of_nothing_is_primary() {
        let merged = merge(Vec::new(), Vec::new());
        assert!(merged.is_empty());
        assert_eq!(merged.source, ResolutionSource::Primary);
    }

    #[tokio::test]
    async fn short_circuits_on_primary_hit() {
        let store = Arc::new(MemoryStore::with_records([
            Record::new("a", "1.32").with("attributes.trade.type", "arbitrage"),
            Record::new("b", "1.25").with("attributes.custom.trade_type", "arbitrage"),
        ]));
        let resolver = resolver(store, ResolverMode::ShortCircuit);
        let out = resolver.resolve(&arbitrage(), &"1.32".into()).await.unwrap();
        assert_eq!(out.source, ResolutionSource::Primary);
        assert_eq!(out.len(), 1);
        assert_eq!(resolver.rewrite_cache_stats().misses, 0);
    }

    #[tokio::test]
    async fn both_phases_merge() {
        let store = Arc::new(MemoryStore::with_records([
            Record::new("a", "1.32").with("attributes.trade.type", "arbitrage"),
            Record::new("b", "1.25").with("attributes.custom.trade_type", "arbitrage"),
        ]));
        let resolver = resolver(store, ResolverMode::BothPhases);
        let out = resolver.resolve(&arbitrage(), &"1.32".into()).await.unwrap();
        assert_eq!(out.source, ResolutionSource::Merged);
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn repeated_shapes_hit_the_rewrite_cache() {
        let store = Arc::new(MemoryStore::with_records([
            Record::new("b", "1.25").with("attributes.custom.trade_type", "swap"),
        ]));
        let resolver = resolver(store, ResolverMode::ShortCircuit);

        let first = resolver.resolve(&arbitrage(), &"1.32".into()).await.unwrap();
        assert!(first.is_empty());

        let swap = Query::new("1.32").with(Predicate::equals("attributes.trade.type", "swap"));
        let second = resolver.resolve(&swap, &"1.32".into()).await.unwrap();
        assert_eq!(second.source, ResolutionSource::Fallback);
        assert_eq!(second.len(), 1);

        let stats = resolver.rewrite_cache_stats();
        assert_eq!((stats.misses, stats.hits, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn versions_without_a_table_are_skipped() {
        let store = Arc::new(MemoryStore::with_records([
            Record::new("b", "1.25").with("attributes.custom.trade_type", "arbitrage"),
        ]));
        let catalog = MappingCatalog::new(
            VersionSet::new(["1.21".into(), "1.25".into(), "1.32".into()], "1.32".into()).unwrap(),
            Arc::new(StaticSchemaSource::new().with_renames(
                "1.25",
                "1.32",
                [("attributes.custom.trade_type", "attributes.trade.type")],
            )),
            Arc::new(NullSink),
            CatalogConfig::default(),
        );
        let resolver = QueryResolver::new(store, catalog, ResolverConfig::default());

        let out = resolver.resolve(&arbitrage(), &"1.32".into()).await.unwrap();
        assert_eq!(out.source, ResolutionSource::Fallback);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_target_is_rejected() {
        let resolver = resolver(Arc::new(MemoryStore::new()), ResolverMode::ShortCircuit);
        let err = resolver.resolve(&arbitrage(), &"9.99".into()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Version(VersionError::Unsupported(_))));
    }
}
