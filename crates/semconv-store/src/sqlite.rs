//! SQLite persistence backend using rusqlite.
//!
//! Records live in a single `records` table keyed by id, with the version tag
//! and observation time in their own columns so scans can filter on them in
//! SQL. Attribute maps and saved-query bodies are stored as postcard blobs.
//! Uses WAL mode by default.
//!
//! rusqlite is blocking, so every call runs on tokio's blocking pool.
//!
//! # Example
//!
//! ```no_run
//! use semconv_store::{Record, RecordStore, SqliteStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = SqliteStore::open("trades.db").unwrap();
//! store.insert(Record::new("r1", "1.25")).await.unwrap();
//! assert!(store.exists(&"r1".into()).await.unwrap());
//! # }
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;

use crate::query::{Query, RecordFilter, SavedQuery, SavedQueryId};
use crate::record::{Attributes, Record, RecordId, SchemaVersion};
use crate::traits::{RecordStore, SavedQueryStore, StoreError, UpdateOutcome, VersionCount};

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-Ahead Logging; readers don't block the migration's writers.
    Wal,
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Error type for the SQLite backend.
#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postcard error: {0}")]
    Codec(String),
    #[error("sqlite lock poisoned")]
    LockPoisoned,
}

impl SqliteError {
    fn is_unavailable(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
            ),
            Self::LockPoisoned => true,
            _ => false,
        }
    }
}

impl From<SqliteError> for StoreError {
    fn from(e: SqliteError) -> Self {
        if e.is_unavailable() {
            return StoreError::Unavailable(e.to_string());
        }
        match e {
            SqliteError::Codec(c) => StoreError::Codec(c),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Turn a generic failure into a write rejection for `id`. Unavailability is
/// kept as is so callers can tell a dead store from a bad record.
fn write_error(id: &RecordId) -> impl FnOnce(StoreError) -> StoreError + '_ {
    move |e| match e {
        StoreError::Query(reason) => StoreError::Write {
            id: id.clone(),
            reason,
        },
        other => other,
    }
}

/// SQLite persistence backend.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex` shared with the blocking
/// pool. Creates the schema automatically on first open. Each statement runs
/// while holding the lock, which makes compare-on-version updates atomic.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path with default config.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteError> {
        Self::open_with_config(path, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, &config)?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, &SqliteConfig::default())?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection, config: &SqliteConfig) -> Result<(), SqliteError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
        ))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), SqliteError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id          TEXT PRIMARY KEY,
                version     TEXT NOT NULL,
                observed_at INTEGER NOT NULL DEFAULT 0,
                attributes  BLOB NOT NULL,
                updated_at  INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_records_version
                ON records(version, id);

            CREATE TABLE IF NOT EXISTS saved_queries (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                version     TEXT NOT NULL,
                body        BLOB NOT NULL,
                updated_at  INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, SqliteError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| SqliteError::LockPoisoned)?;
            f(&guard)
        })
        .await;
        match joined {
            Ok(result) => result.map_err(StoreError::from),
            Err(e) => Err(StoreError::Unavailable(format!("sqlite task failed: {e}"))),
        }
    }

    /// Get the database file size in bytes (0 for in-memory).
    pub async fn file_size(&self) -> Result<u64, StoreError> {
        self.blocking(|conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok((page_count * page_size) as u64)
        })
        .await
    }

    /// Get the current journal mode.
    pub async fn journal_mode(&self) -> Result<String, StoreError> {
        self.blocking(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .await
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, SqliteError> {
    postcard::to_allocvec(value).map_err(|e| SqliteError::Codec(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, SqliteError> {
    postcard::from_bytes(bytes).map_err(|e| SqliteError::Codec(e.to_string()))
}

type RawRecord = (String, String, i64, Vec<u8>);

fn decode_record((id, version, observed_at, blob): RawRecord) -> Result<Record, SqliteError> {
    let attributes: Attributes = decode(&blob)?;
    Ok(Record {
        id: RecordId::new(id),
        version: SchemaVersion::new(version),
        observed_at: observed_at.max(0) as u64,
        attributes,
    })
}

/// Select one batch of candidate rows. Version and time conditions are pushed
/// into SQL; attribute predicates are checked by the caller.
fn select_batch(
    conn: &Connection,
    filter: &RecordFilter,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<RawRecord>, SqliteError> {
    let mut sql = String::from("SELECT id, version, observed_at, attributes FROM records WHERE 1 = 1");
    let mut args: Vec<Value> = Vec::new();

    if let Some(after) = after {
        sql.push_str(" AND id > ?");
        args.push(Value::Text(after.to_string()));
    }
    if !filter.versions.is_empty() {
        let marks = vec!["?"; filter.versions.len()].join(", ");
        sql.push_str(&format!(" AND version IN ({marks})"));
        args.extend(filter.versions.iter().map(|v| Value::Text(v.to_string())));
    }
    if let Some(range) = filter.time_range {
        if let Some(start) = range.start {
            sql.push_str(" AND observed_at >= ?");
            args.push(Value::Integer(start as i64));
        }
        if let Some(end) = range.end {
            sql.push_str(" AND observed_at < ?");
            args.push(Value::Integer(end as i64));
        }
    }
    sql.push_str(" ORDER BY id LIMIT ?");
    args.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<Result<Vec<RawRecord>, _>>()?;
    Ok(rows)
}

fn upsert_record(conn: &Connection, record: &Record, now: i64) -> Result<(), SqliteError> {
    let blob = encode(&record.attributes)?;
    conn.execute(
        "INSERT INTO records (id, version, observed_at, attributes, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id)
         DO UPDATE SET version = excluded.version,
                       observed_at = excluded.observed_at,
                       attributes = excluded.attributes,
                       updated_at = excluded.updated_at",
        params![
            record.id.as_str(),
            record.version.as_str(),
            record.observed_at as i64,
            blob,
            now
        ],
    )?;
    Ok(())
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn scan(
        &self,
        filter: &RecordFilter,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = filter.clone();
        let mut cursor = after.map(|id| id.as_str().to_string());
        self.blocking(move |conn| {
            let mut out = Vec::with_capacity(limit);
            loop {
                let batch = select_batch(conn, &filter, cursor.as_deref(), limit)?;
                let exhausted = batch.len() < limit;
                for raw in batch {
                    cursor = Some(raw.0.clone());
                    let record = decode_record(raw)?;
                    if filter.predicates.iter().all(|p| p.matches(&record)) {
                        out.push(record);
                        if out.len() == limit {
                            return Ok(out);
                        }
                    }
                }
                if exhausted {
                    return Ok(out);
                }
            }
        })
        .await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        let id = id.as_str().to_string();
        self.blocking(move |conn| {
            let raw: Option<RawRecord> = conn
                .query_row(
                    "SELECT id, version, observed_at, attributes FROM records WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            raw.map(decode_record).transpose()
        })
        .await
    }

    async fn exists(&self, id: &RecordId) -> Result<bool, StoreError> {
        let id = id.as_str().to_string();
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn insert(&self, record: Record) -> Result<(), StoreError> {
        let id = record.id.clone();
        self.blocking(move |conn| upsert_record(conn, &record, Self::now_ms()))
            .await
            .map_err(write_error(&id))
    }

    async fn insert_batch(&self, records: Vec<Record>) -> Result<usize, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let now = Self::now_ms();
            for record in &records {
                upsert_record(&tx, record, now)?;
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    async fn update_if_version(
        &self,
        record: &Record,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError> {
        let record = record.clone();
        let expected = expected.clone();
        let id = record.id.clone();
        self.blocking(move |conn| {
            let blob = encode(&record.attributes)?;
            let changed = conn.execute(
                "UPDATE records
                 SET version = ?1, observed_at = ?2, attributes = ?3, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    record.version.as_str(),
                    record.observed_at as i64,
                    blob,
                    Self::now_ms(),
                    record.id.as_str(),
                    expected.as_str()
                ],
            )?;
            if changed > 0 {
                return Ok(Some(UpdateOutcome::Applied));
            }
            let present: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE id = ?1",
                params![record.id.as_str()],
                |row| row.get(0),
            )?;
            Ok((present > 0).then_some(UpdateOutcome::VersionConflict))
        })
        .await
        .map_err(write_error(&id))?
        .ok_or(StoreError::NotFound(id))
    }

    async fn version_counts(&self) -> Result<Vec<VersionCount>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT version, COUNT(*) FROM records GROUP BY version ORDER BY version")?;
            let counts = stmt
                .query_map([], |row| {
                    let version: String = row.get(0)?;
                    let records: i64 = row.get(1)?;
                    Ok(VersionCount {
                        version: SchemaVersion::new(version),
                        records: records as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(counts)
        })
        .await
    }
}

type RawSavedQuery = (String, String, Vec<u8>);

fn decode_saved((id, name, body): RawSavedQuery) -> Result<SavedQuery, SqliteError> {
    let query: Query = decode(&body)?;
    Ok(SavedQuery::new(id, name, query))
}

#[async_trait]
impl SavedQueryStore for SqliteStore {
    async fn list_saved_queries(&self) -> Result<Vec<SavedQuery>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, body FROM saved_queries ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<RawSavedQuery>, _>>()?;
            rows.into_iter().map(decode_saved).collect()
        })
        .await
    }

    async fn save_query(&self, query: SavedQuery) -> Result<(), StoreError> {
        let id = query.id.clone();
        self.blocking(move |conn| {
            let body = encode(&query.query)?;
            conn.execute(
                "INSERT INTO saved_queries (id, name, version, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id)
                 DO UPDATE SET name = excluded.name, version = excluded.version,
                               body = excluded.body, updated_at = excluded.updated_at",
                params![
                    query.id.as_str(),
                    query.name,
                    query.version().as_str(),
                    body,
                    Self::now_ms()
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(write_error(&id))
    }

    async fn update_saved_query_if_version(
        &self,
        query: &SavedQuery,
        expected: &SchemaVersion,
    ) -> Result<UpdateOutcome, StoreError> {
        let query = query.clone();
        let expected = expected.clone();
        let id = query.id.clone();
        self.blocking(move |conn| {
            let body = encode(&query.query)?;
            let changed = conn.execute(
                "UPDATE saved_queries
                 SET name = ?1, version = ?2, body = ?3, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    query.name,
                    query.version().as_str(),
                    body,
                    Self::now_ms(),
                    query.id.as_str(),
                    expected.as_str()
                ],
            )?;
            if changed > 0 {
                return Ok(Some(UpdateOutcome::Applied));
            }
            let present: i64 = conn.query_row(
                "SELECT COUNT(*) FROM saved_queries WHERE id = ?1",
                params![query.id.as_str()],
                |row| row.get(0),
            )?;
            Ok((present > 0).then_some(UpdateOutcome::VersionConflict))
        })
        .await
        .map_err(write_error(&id))?
        .ok_or(StoreError::NotFound(id))
    }

    async fn get_saved_query(&self, id: &SavedQueryId) -> Result<Option<SavedQuery>, StoreError> {
        let id = id.as_str().to_string();
        self.blocking(move |conn| {
            let raw: Option<RawSavedQuery> = conn
                .query_row(
                    "SELECT id, name, body FROM saved_queries WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            raw.map(decode_saved).transpose()
        })
        .await
    }
}
