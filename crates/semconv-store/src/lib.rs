//! # semconv-store
//!
//! Record and saved-query storage for semconv-kit.
//!
//! Defines the data model shared by the migration engine (versioned records,
//! attribute predicates, queries) and the async storage abstraction it runs
//! against. Backends page through records in id order and support an atomic
//! compare-on-version update, which is what makes concurrent migration safe.
//!
//! ## Quick Start
//!
//! ```
//! use semconv_store::{MemoryStore, Predicate, Query, Record, RecordStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryStore::new();
//! store
//!     .insert(Record::new("t1", "1.32").with("attributes.trade.type", "arbitrage"))
//!     .await
//!     .unwrap();
//!
//! let query = Query::new("1.32").with(Predicate::equals("attributes.trade.type", "arbitrage"));
//! assert_eq!(store.query(&query).await.unwrap().len(), 1);
//! # }
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature flag | Use case |
//! |---------|-------------|----------|
//! | [`MemoryStore`] | *(always available)* | Testing, prototyping |
//! | `SqliteStore` | `sqlite` | Single-node durable storage, the CLI |

mod memory;
mod query;
mod record;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use query::{
    AttributeRef, Operator, Predicate, Query, QueryShape, RecordFilter, SavedQuery, SavedQueryId,
    TimeRange,
};
pub use record::{AttributeValue, Attributes, Record, RecordId, SchemaVersion, VERSION_ATTRIBUTE};
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, SqliteConfig, SqliteError, SqliteStore};
pub use traits::*;
