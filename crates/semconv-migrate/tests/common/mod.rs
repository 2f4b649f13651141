//! Shared fixtures: a store with injectable faults and a counting schema
//! source.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use semconv_migrate::{
    Engine, EngineConfig, NullSink, Renames, SchemaSource, SourceError, StaticSchemaSource,
};
use semconv_store::{
    MemoryStore, Record, RecordFilter, RecordId, RecordStore, SavedQuery, SavedQueryStore,
    SchemaVersion, StoreError, UpdateOutcome, VersionCount,
};

pub const OLD: &str = "1.25";
pub const NEW: &str = "1.32";

pub fn config_toml(extra: &str) -> String {
    format!(
        r#"
        [versions]
        supported = ["1.21", "1.25", "1.32"]
        default = "1.32"

        [catalog]
        initial_backoff_ms = 1
        max_backoff_ms = 5

        [migration]
        workers = 4
        page_size = 50
        initial_backoff_ms = 1
        max_backoff_ms = 5
        failure_ratio_min_scanned = 100

        [[mappings]]
        from = "1.25"
        to = "1.32"
        [mappings.renames]
        "attributes.custom.trade_type" = "attributes.trade.type"
        "attributes.custom.chain_id" = "attributes.chain.id"

        [[mappings]]
        from = "1.21"
        to = "1.32"
        [mappings.renames]
        "trade_type" = "attributes.trade.type"

        {extra}
        "#
    )
}

pub fn config(extra: &str) -> EngineConfig {
    EngineConfig::from_toml(&config_toml(extra)).unwrap()
}

pub fn engine_over<S>(store: Arc<S>, extra: &str) -> Engine
where
    S: RecordStore + SavedQueryStore + 'static,
{
    engine_with(store, config(extra))
}

pub fn engine_with<S>(store: Arc<S>, config: EngineConfig) -> Engine
where
    S: RecordStore + SavedQueryStore + 'static,
{
    Engine::builder(config)
        .store(store)
        .audit_sink(Arc::new(NullSink))
        .build()
        .unwrap()
}

pub fn old_trade(i: usize) -> Record {
    Record::new(format!("trade-{i:05}"), OLD)
        .with("attributes.custom.trade_type", if i % 2 == 0 { "arbitrage" } else { "swap" })
        .with("attributes.trade_id", format!("{i}"))
        .observed_at(1_000 + i as u64)
}

pub fn old_trades(n: usize) -> Vec<Record> {
    (0..n).map(old_trade).collect()
}

/// A [`MemoryStore`] with injectable failures.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    failing_writes: HashSet<RecordId>,
    write_delay: Option<Duration>,
    pub scans_unavailable: AtomicBool,
    pub writes_unavailable: AtomicBool,
    pub write_calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            inner: MemoryStore::with_records(records),
            ..Self::default()
        }
    }

    /// Every write to these ids fails with a per-record error.
    pub fn failing_writes(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.failing_writes = ids.into_iter().collect();
        self
    }

    pub fn write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn scan(
        &self,
        filter: &RecordFilter,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        if self.scans_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.scan(filter, after, limit).await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, record: Record) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn update_if_version(
        &self,
        record: &Record,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.writes_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        if self.failing_writes.contains(&record.id) {
            return Err(StoreError::Write {
                id: record.id.clone(),
                reason: "simulated write failure".into(),
            });
        }
        self.inner.update_if_version(record, expected).await
    }

    async fn version_counts(&self) -> Result<Vec<VersionCount>, StoreError> {
        self.inner.version_counts().await
    }
}

#[async_trait]
impl SavedQueryStore for FaultyStore {
    async fn list_saved_queries(&self) -> Result<Vec<SavedQuery>, StoreError> {
        self.inner.list_saved_queries().await
    }

    async fn save_query(&self, query: SavedQuery) -> Result<(), StoreError> {
        self.inner.save_query(query).await
    }

    async fn update_saved_query_if_version(
        &self,
        query: &SavedQuery,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError> {
        self.inner.update_saved_query_if_version(query, expected).await
    }
}

/// Wraps a static source, counting calls and taking `delay` per fetch.
pub struct CountingSource {
    inner: StaticSchemaSource,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl CountingSource {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: StaticSchemaSource::new().with_renames(
                OLD,
                NEW,
                [("attributes.custom.trade_type", "attributes.trade.type")],
            ),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaSource for CountingSource {
    async fn fetch(&self, from: &SchemaVersion, to: &SchemaVersion) -> Result<Renames, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(from, to).await
    }
}
