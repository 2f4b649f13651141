use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::{Query, RecordFilter, SavedQuery, SavedQueryId};
use crate::record::{Record, RecordId, SchemaVersion};

/// Errors reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The backend cannot be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A single write was rejected.
    #[error("write rejected for {id}: {reason}")]
    Write { id: RecordId, reason: String },
    /// A read or query failed.
    #[error("query failed: {0}")]
    Query(String),
    /// Stored bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    #[error("{0} not found")]
    NotFound(RecordId),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// True when the error means the whole store is unreachable, as opposed
    /// to a single operation failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result of a compare-on-version update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The stored item carried the expected version and was replaced.
    Applied,
    /// The stored item's version no longer matches; nothing was written.
    VersionConflict,
}

/// Number of stored records carrying one version tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCount {
    pub version: SchemaVersion,
    pub records: u64,
}

/// Core trait for record persistence.
///
/// Every backend implements this trait. Scans page through records in
/// ascending id order; `after` is the exclusive cursor returned by the last
/// record of the previous page.
///
/// Writes of a single record are atomic: readers observe either the old or
/// the new record, never a mix of attributes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read up to `limit` records matching `filter` with ids greater than `after`.
    async fn scan(
        &self,
        filter: &RecordFilter,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// Retrieve a record by id.
    async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError>;

    /// Check if a record exists.
    async fn exists(&self, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.get(id).await?.is_some())
    }

    /// Insert or replace a record.
    async fn insert(&self, record: Record) -> Result<(), StoreError>;

    /// Insert or replace several records. Backends with transactions apply
    /// the whole batch atomically. Returns the number of records written.
    async fn insert_batch(&self, records: Vec<Record>) -> Result<usize, StoreError> {
        let n = records.len();
        for record in records {
            self.insert(record).await?;
        }
        Ok(n)
    }

    /// Replace a stored record only if its version tag still equals `expected`.
    ///
    /// Returns `StoreError::NotFound` when no record with that id exists.
    async fn update_if_version(
        &self,
        record: &Record,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Count records per version tag.
    async fn version_counts(&self) -> Result<Vec<VersionCount>, StoreError>;

    /// Execute a query: every record matching all of its predicates, whatever
    /// the record's version.
    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        const PAGE: usize = 512;

        let filter = RecordFilter::for_query(query);
        let mut out = Vec::new();
        let mut after: Option<RecordId> = None;
        loop {
            let page = self.scan(&filter, after.as_ref(), PAGE).await?;
            let done = page.len() < PAGE;
            after = page.last().map(|r| r.id.clone());
            out.extend(page);
            if done {
                return Ok(out);
            }
        }
    }

    /// Count records matching `filter`.
    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        const PAGE: usize = 1024;

        let mut total = 0u64;
        let mut after: Option<RecordId> = None;
        loop {
            let page = self.scan(filter, after.as_ref(), PAGE).await?;
            total += page.len() as u64;
            if page.len() < PAGE {
                return Ok(total);
            }
            after = page.last().map(|r| r.id.clone());
        }
    }
}

/// Persistence for saved query definitions.
#[async_trait]
pub trait SavedQueryStore: Send + Sync {
    /// List every saved query, ordered by id.
    async fn list_saved_queries(&self) -> Result<Vec<SavedQuery>, StoreError>;

    /// Insert or replace a saved query.
    async fn save_query(&self, query: SavedQuery) -> Result<(), StoreError>;

    /// Replace a saved query only if its stored version still equals `expected`.
    async fn update_saved_query_if_version(
        &self,
        query: &SavedQuery,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn get_saved_query(&self, id: &SavedQueryId) -> Result<Option<SavedQuery>, StoreError> {
        Ok(self
            .list_saved_queries()
            .await?
            .into_iter()
            .find(|q| &q.id == id))
    }
}
