//! The [`Engine`] facade: one entry point over the catalog, the migration
//! coordinator, the query resolver and the saved-query updater.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use semconv_store::{
    MemoryStore, Query, Record, RecordFilter, RecordStore, SavedQueryStore, SchemaVersion,
    StoreError, VersionCount,
};
use thiserror::Error;
use tracing::{Instrument, Span};

use crate::audit::{AuditSink, TracingSink};
use crate::catalog::{MappingCatalog, MappingError};
use crate::config::{ConfigError, EngineConfig};
use crate::coordinator::{
    JobHandle, JobStatus, MigrationCoordinator, MigrationError, MigrationReport,
};
use crate::mapping::AttributeMapping;
use crate::resolver::{QueryResolver, ResolveError, Resolution, ResolverMode};
use crate::saved_queries::{SavedQueryError, SavedQueryMode, SavedQueryUpdater};
use crate::source::SchemaSource;
use crate::version::{VersionError, VersionSet};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("no {0} configured")]
    Missing(&'static str),
}

/// Run `fut` inside `span`, logging how long it took and whether it failed.
async fn instrumented<T, E, F>(span: Span, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    async move {
        let start = Instant::now();
        let out = fut.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &out {
            Ok(_) => tracing::debug!(elapsed_ms, "done"),
            Err(e) => tracing::warn!(elapsed_ms, err = %e, "failed"),
        }
        out
    }
    .instrument(span)
    .await
}

/// Builder for [`Engine`].
///
/// ```
/// use std::sync::Arc;
/// use semconv_migrate::{Engine, EngineConfig};
/// use semconv_store::MemoryStore;
///
/// let config = EngineConfig::from_toml(r#"
///     [versions]
///     supported = ["1.25", "1.32"]
/// "#).unwrap();
/// let engine = Engine::builder(config)
///     .memory_store(Arc::new(MemoryStore::new()))
///     .build()
///     .unwrap();
/// assert_eq!(engine.versions().default_version().as_str(), "1.32");
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    records: Option<Arc<dyn RecordStore>>,
    saved_queries: Option<Arc<dyn SavedQueryStore>>,
    source: Option<Arc<dyn SchemaSource>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl EngineBuilder {
    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    pub fn saved_query_store(mut self, store: Arc<dyn SavedQueryStore>) -> Self {
        self.saved_queries = Some(store);
        self
    }

    /// Use one store for both records and saved queries.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: RecordStore + SavedQueryStore + 'static,
    {
        let records: Arc<dyn RecordStore> = store.clone();
        self.record_store(records).saved_query_store(store)
    }

    pub fn memory_store(self, store: Arc<MemoryStore>) -> Self {
        self.store(store)
    }

    /// Override the schema source described by the config.
    pub fn schema_source(mut self, source: Arc<dyn SchemaSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Defaults to [`TracingSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate().map_err(ConfigError::Invalid)?;
        let records = self.records.ok_or(EngineError::Missing("record store"))?;
        let saved_queries = self
            .saved_queries
            .ok_or(EngineError::Missing("saved-query store"))?;
        let source = self.source.unwrap_or_else(|| self.config.schema_source());
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingSink));
        let versions = self.config.version_set()?;

        let catalog = MappingCatalog::new(versions, source, Arc::clone(&audit), self.config.catalog_config());
        let coordinator = MigrationCoordinator::new(
            Arc::clone(&records),
            catalog.clone(),
            audit,
            self.config.coordinator_config(),
        );
        let resolver = QueryResolver::new(Arc::clone(&records), catalog.clone(), self.config.resolver_config());
        let updater = SavedQueryUpdater::new(saved_queries, catalog.clone(), self.config.saved_queries.mode);

        tracing::info!(
            versions = ?catalog.versions().supported(),
            default = %catalog.versions().default_version(),
            "engine ready"
        );
        Ok(Engine {
            records,
            catalog,
            coordinator,
            resolver,
            updater,
        })
    }
}

/// Schema-version migration and dual-location query resolution over a
/// record store.
pub struct Engine {
    records: Arc<dyn RecordStore>,
    catalog: MappingCatalog,
    coordinator: MigrationCoordinator,
    resolver: QueryResolver,
    updater: SavedQueryUpdater,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            records: None,
            saved_queries: None,
            source: None,
            audit: None,
        }
    }

    pub fn versions(&self) -> &VersionSet {
        self.catalog.versions()
    }

    pub fn catalog(&self) -> &MappingCatalog {
        &self.catalog
    }

    pub fn resolver(&self) -> &QueryResolver {
        &self.resolver
    }

    pub async fn get_mapping(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
    ) -> Result<Arc<AttributeMapping>, MappingError> {
        instrumented(
            tracing::info_span!("get_mapping", %from, %to),
            self.catalog.get_mapping(from, to),
        )
        .await
    }

    pub async fn refresh_mapping(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
    ) -> Result<Arc<AttributeMapping>, MappingError> {
        instrumented(
            tracing::info_span!("refresh_mapping", %from, %to),
            self.catalog.refresh(from, to),
        )
        .await
    }

    pub async fn start_migration(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
        filter: RecordFilter,
    ) -> Result<JobHandle, MigrationError> {
        instrumented(
            tracing::info_span!("start_migration", %from, %to),
            self.coordinator.start_migration(from, to, filter),
        )
        .await
    }

    /// Start a migration and wait for it to finish.
    pub async fn migrate(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
        filter: RecordFilter,
    ) -> Result<MigrationReport, MigrationError> {
        let handle = self.start_migration(from, to, filter).await?;
        self.wait_for_job(handle).await
    }

    pub fn job_status(&self, handle: JobHandle) -> Result<JobStatus, MigrationError> {
        self.coordinator.status(handle)
    }

    pub fn jobs(&self) -> Vec<JobStatus> {
        self.coordinator.jobs()
    }

    /// Drop a finished job from the coordinator, returning its final status.
    pub fn forget_job(&self, handle: JobHandle) -> Result<JobStatus, MigrationError> {
        self.coordinator.forget(handle)
    }

    pub fn cancel_migration(&self, handle: JobHandle) -> Result<(), MigrationError> {
        let _span = tracing::info_span!("cancel_migration", job_id = %handle.id()).entered();
        self.coordinator.cancel(handle)
    }

    pub async fn wait_for_job(&self, handle: JobHandle) -> Result<MigrationReport, MigrationError> {
        instrumented(
            tracing::info_span!("wait_for_job", job_id = %handle.id()),
            self.coordinator.wait(handle),
        )
        .await
    }

    pub async fn resolve_query(
        &self,
        query: &Query,
        target: &SchemaVersion,
    ) -> Result<Resolution, ResolveError> {
        self.resolve_query_with(query, target, self.resolver.mode())
            .await
    }

    pub async fn resolve_query_with(
        &self,
        query: &Query,
        target: &SchemaVersion,
        mode: ResolverMode,
    ) -> Result<Resolution, ResolveError> {
        instrumented(
            tracing::info_span!("resolve_query", %target, ?mode, predicates = query.predicates.len()),
            self.resolver.resolve_with(query, target, mode),
        )
        .await
    }

    pub async fn update_saved_queries(&self, to: &SchemaVersion) -> Result<usize, SavedQueryError> {
        self.update_saved_queries_with(to, self.updater.mode())
            .await
    }

    pub async fn update_saved_queries_with(
        &self,
        to: &SchemaVersion,
        mode: SavedQueryMode,
    ) -> Result<usize, SavedQueryError> {
        instrumented(
            tracing::info_span!("update_saved_queries", %to, ?mode),
            self.updater.update_all_with(to, mode),
        )
        .await
    }

    /// Store an incoming record. An unsupported version tag is replaced with
    /// the default version.
    pub async fn ingest(&self, record: Record) -> Result<Record, StoreError> {
        let record = self.normalize(record);
        instrumented(
            tracing::debug_span!("ingest", id = %record.id, version = %record.version),
            self.records.insert(record.clone()),
        )
        .await?;
        Ok(record)
    }

    /// Store a batch of incoming records, normalizing each version tag.
    pub async fn ingest_batch(&self, records: Vec<Record>) -> Result<usize, StoreError> {
        let records: Vec<Record> = records.into_iter().map(|r| self.normalize(r)).collect();
        instrumented(
            tracing::info_span!("ingest_batch", records = records.len()),
            self.records.insert_batch(records),
        )
        .await
    }

    pub async fn version_counts(&self) -> Result<Vec<VersionCount>, StoreError> {
        self.records.version_counts().await
    }

    fn normalize(&self, mut record: Record) -> Record {
        record.version = self.catalog.versions().normalize(Some(&record.version));
        record
    }
}
