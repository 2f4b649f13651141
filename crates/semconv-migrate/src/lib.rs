//! # semconv-migrate
//!
//! Schema-version migration and dual-location query resolution for
//! trade-event records stored through [`semconv-store`](semconv_store).
//!
//! When an attribute is renamed between semantic-convention versions
//! (`attributes.custom.trade_type` → `attributes.trade.type`), stored records,
//! saved queries and live queries all have to follow. This crate does that
//! without downtime.
//!
//! ## How It Works
//!
//! 1. The [`MappingCatalog`] resolves a `(from, to)` version pair to an
//!    [`AttributeMapping`], fetching each pair from a [`SchemaSource`] once
//!    and caching it.
//! 2. The [`MigrationCoordinator`] rewrites stored records page by page on a
//!    fixed worker pool. Single write failures are counted, not fatal.
//! 3. While records are split between versions, the [`QueryResolver`] runs a
//!    query against the new paths and falls back to the old ones.
//! 4. The [`SavedQueryUpdater`] moves persisted queries to the new paths.
//!
//! ## Key Concepts
//!
//! - **Explicit value wins**: when a record holds both the old and the new
//!   path of a rename, the value already at the destination is kept.
//! - **Compare-on-version writes**: a record changed underneath a migration
//!   is skipped rather than overwritten.
//! - **Single-flight**: concurrent misses for one pair cause one fetch.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use semconv_migrate::{Engine, EngineConfig, NullSink};
//! use semconv_store::{MemoryStore, Predicate, Query, Record, RecordFilter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = EngineConfig::from_toml(r#"
//!     [versions]
//!     supported = ["1.25", "1.32"]
//!
//!     [[mappings]]
//!     from = "1.25"
//!     to = "1.32"
//!     [mappings.renames]
//!     "attributes.custom.trade_type" = "attributes.trade.type"
//! "#).unwrap();
//!
//! let engine = Engine::builder(config)
//!     .memory_store(Arc::new(MemoryStore::new()))
//!     .audit_sink(Arc::new(NullSink))
//!     .build()
//!     .unwrap();
//!
//! engine
//!     .ingest(Record::new("t1", "1.25").with("attributes.custom.trade_type", "arbitrage"))
//!     .await
//!     .unwrap();
//!
//! // Not migrated yet: found through the old location.
//! let query = Query::new("1.32").with(Predicate::equals("attributes.trade.type", "arbitrage"));
//! let found = engine.resolve_query(&query, &"1.32".into()).await.unwrap();
//! assert_eq!(found.len(), 1);
//!
//! let report = engine
//!     .migrate(&"1.25".into(), &"1.32".into(), RecordFilter::all())
//!     .await
//!     .unwrap();
//! assert_eq!(report.progress.migrated, 1);
//! # }
//! ```

mod audit;
mod catalog;
mod config;
mod coordinator;
mod engine;
mod mapping;
mod remap;
mod resolver;
mod retry;
mod saved_queries;
mod source;
mod version;

pub use audit::{AuditEvent, AuditSink, MemorySink, NullSink, SinkError, TracingSink};
pub use catalog::{CatalogConfig, MappingCatalog, MappingError};
pub use config::{
    CatalogSection, ConfigError, EngineConfig, MappingEntry, MigrationSection, ResolverSection,
    SavedQueriesSection, ValidationIssue, VersionsConfig, DEFAULT_CONFIG_FILE,
};
pub use coordinator::{
    AbortReason, CoordinatorConfig, JobHandle, JobState, JobStatus, MigrationAbortError,
    MigrationCoordinator, MigrationError, MigrationReport, Progress,
};
pub use engine::{Engine, EngineBuilder, EngineError};
pub use mapping::{AttributeMapping, Direction, InvalidMapping, MappingKey};
pub use remap::{coalesce_query, remap_backward, remap_forward, remap_query};
pub use resolver::{
    QueryResolver, Resolution, ResolutionSource, ResolveError, ResolvedRecord, ResolverConfig,
    ResolverMode, RewriteCacheStats,
};
pub use retry::Backoff;
pub use saved_queries::{SavedQueryError, SavedQueryMode, SavedQueryUpdater};
pub use source::{DirectorySchemaSource, Renames, SchemaSource, SourceError, StaticSchemaSource};
pub use version::{VersionError, VersionSet};
