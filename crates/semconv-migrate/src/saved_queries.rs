//! Rewriting persisted query definitions to a new schema version.

use std::sync::Arc;

use semconv_store::{SavedQuery, SavedQueryStore, SchemaVersion, StoreError, UpdateOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{MappingCatalog, MappingError};
use crate::mapping::Direction;
use crate::remap::{coalesce_query, remap_query};
use crate::version::VersionError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavedQueryMode {
    /// Rewrite to the target version's paths only.
    #[default]
    Canonical,
    /// Read the canonical path first and the old path second, so the query
    /// keeps matching records that have not been migrated yet.
    BothLocations,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SavedQueryError {
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SavedQueryUpdater {
    store: Arc<dyn SavedQueryStore>,
    catalog: MappingCatalog,
    mode: SavedQueryMode,
}

impl SavedQueryUpdater {
    pub fn new(store: Arc<dyn SavedQueryStore>, catalog: MappingCatalog, mode: SavedQueryMode) -> Self {
        Self { store, catalog, mode }
    }

    pub fn mode(&self) -> SavedQueryMode {
        self.mode
    }

    /// Rewrite every saved query to `to` with the configured mode.
    pub async fn update_all(&self, to: &SchemaVersion) -> Result<usize, SavedQueryError> {
        self.update_all_with(to, self.mode).await
    }

    /// Rewrite every saved query to `to` and return how many were updated.
    ///
    /// Queries already at `to` are left alone, as are queries on a version
    /// that is no longer supported. A query edited concurrently (its stored
    /// version no longer matches) is skipped and not counted.
    pub async fn update_all_with(&self, to: &SchemaVersion, mode: SavedQueryMode) -> Result<usize, SavedQueryError> {
        self.catalog.versions().check(to)?;

        let mut updated = 0;
        for saved in self.store.list_saved_queries().await? {
            let from = saved.version().clone();
            if &from == to {
                continue;
            }
            if !self.catalog.versions().contains(&from) {
                tracing::warn!(query_id = %saved.id, version = %from, "saved query on unsupported version, skipping");
                continue;
            }

            let mapping = self.catalog.get_mapping(&from, to).await?;
            let query = match mode {
                SavedQueryMode::Canonical => remap_query(&saved.query, &mapping, Direction::Forward),
                SavedQueryMode::BothLocations => coalesce_query(&saved.query, &mapping),
            };
            let rewritten = SavedQuery { query, ..saved };

            match self.store.update_saved_query_if_version(&rewritten, &from).await? {
                UpdateOutcome::Applied => {
                    tracing::debug!(query_id = %rewritten.id, %from, %to, "saved query updated");
                    updated += 1;
                }
                UpdateOutcome::VersionConflict => {
                    tracing::info!(query_id = %rewritten.id, "saved query changed concurrently, skipping");
                }
            }
        }
        tracing::info!(%to, updated, "saved queries updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullSink;
    use crate::catalog::CatalogConfig;
    use crate::source::StaticSchemaSource;
    use crate::version::VersionSet;
    use semconv_store::{AttributeRef, MemoryStore, Predicate, Query};

    fn updater(store: Arc<MemoryStore>, mode: SavedQueryMode) -> SavedQueryUpdater {
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
        SavedQueryUpdater::new(store, catalog, mode)
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let old = Query::new("1.25").with(Predicate::equals("attributes.custom.trade_type", "arbitrage"));
        let current = Query::new("1.32").with(Predicate::equals("attributes.trade.type", "swap"));
        let retired = Query::new("0.9").with(Predicate::equals("attributes.kind", "x"));
        store.save_query(SavedQuery::new("q1", "arbitrage panel", old)).await.unwrap();
        store.save_query(SavedQuery::new("q2", "swap panel", current)).await.unwrap();
        store.save_query(SavedQuery::new("q3", "retired", retired)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn canonical_mode_rewrites_old_queries() {
        let store = seeded().await;
        let updated = updater(store.clone(), SavedQueryMode::Canonical)
            .update_all(&"1.32".into())
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let q1 = store.get_saved_query(&"q1".into()).await.unwrap().unwrap();
        assert_eq!(q1.version().as_str(), "1.32");
        assert_eq!(
            q1.query.predicates[0].attribute,
            AttributeRef::path("attributes.trade.type")
        );
        let q3 = store.get_saved_query(&"q3".into()).await.unwrap().unwrap();
        assert_eq!(q3.version().as_str(), "0.9");
    }

    #[tokio::test]
    async fn both_locations_mode_coalesces() {
        let store = seeded().await;
        updater(store.clone(), SavedQueryMode::BothLocations)
            .update_all(&"1.32".into())
            .await
            .unwrap();
        let q1 = store.get_saved_query(&"q1".into()).await.unwrap().unwrap();
        assert_eq!(
            q1.query.predicates[0].attribute,
            AttributeRef::Coalesce(vec![
                "attributes.trade.type".into(),
                "attributes.custom.trade_type".into()
            ])
        );
    }

    #[tokio::test]
    async fn second_run_updates_nothing() {
        let store = seeded().await;
        let updater = updater(store, SavedQueryMode::Canonical);
        assert_eq!(updater.update_all(&"1.32".into()).await.unwrap(), 1);
        assert_eq!(updater.update_all(&"1.32".into()).await.unwrap(), 0);
    }
}
