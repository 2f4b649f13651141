use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::query::{RecordFilter, SavedQuery, SavedQueryId};
use crate::record::{Record, RecordId, SchemaVersion};
use crate::traits::{RecordStore, SavedQueryStore, StoreError, UpdateOutcome, VersionCount};

/// In-memory storage backend.
///
/// Records and saved queries live in `BTreeMap`s behind `RwLock`s, so scans
/// come out in id order for free. Nothing touches disk; use it for tests and
/// prototyping.
///
/// # Example
///
/// ```
/// use semconv_store::{MemoryStore, Record, RecordStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.insert(Record::new("r1", "1.25").with("attributes.trade_id", "123")).await.unwrap();
///
/// let record = store.get(&"r1".into()).await.unwrap().unwrap();
/// assert_eq!(record.version.as_str(), "1.25");
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<RecordId, Record>>,
    saved: RwLock<BTreeMap<SavedQueryId, SavedQuery>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write();
            for r in records {
                map.insert(r.id.clone(), r);
            }
        }
        store
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Copy of every stored record, in id order.
    pub fn snapshot(&self) -> Vec<Record> {
        self.records.read().values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn scan(
        &self,
        filter: &RecordFilter,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let records = self.records.read();
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(records
            .range::<RecordId, _>((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn exists(&self, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.records.read().contains_key(id))
    }

    async fn insert(&self, record: Record) -> Result<(), StoreError> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_if_version(
        &self,
        record: &Record,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(&record.id) {
            None => Err(StoreError::NotFound(record.id.clone())),
            Some(stored) if &stored.version != expected => Ok(UpdateOutcome::VersionConflict),
            Some(stored) => {
                *stored = record.clone();
                Ok(UpdateOutcome::Applied)
            }
        }
    }

    async fn version_counts(&self) -> Result<Vec<VersionCount>, StoreError> {
        let mut counts: BTreeMap<SchemaVersion, u64> = BTreeMap::new();
        for r in self.records.read().values() {
            *counts.entry(r.version.clone()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(version, records)| VersionCount { version, records })
            .collect())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .count() as u64)
    }
}

#[async_trait]
impl SavedQueryStore for MemoryStore {
    async fn list_saved_queries(&self) -> Result<Vec<SavedQuery>, StoreError> {
        Ok(self.saved.read().values().cloned().collect())
    }

    async fn save_query(&self, query: SavedQuery) -> Result<(), StoreError> {
        self.saved.write().insert(query.id.clone(), query);
        Ok(())
    }

    async fn update_saved_query_if_version(
        &self,
        query: &SavedQuery,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut saved = self.saved.write();
        match saved.get_mut(&query.id) {
            None => Err(StoreError::NotFound(query.id.clone())),
            Some(stored) if stored.version() != expected => Ok(UpdateOutcome::VersionConflict),
            Some(stored) => {
                *stored = query.clone();
                Ok(UpdateOutcome::Applied)
            }
        }
    }

    async fn get_saved_query(&self, id: &SavedQueryId) -> Result<Option<SavedQuery>, StoreError> {
        Ok(self.saved.read().get(id).cloned())
    }
}
