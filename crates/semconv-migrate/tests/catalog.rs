//! Mapping retrieval through the engine: version checks, fetch coalescing
//! and refresh.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use semconv_migrate::{
    AuditEvent, CatalogConfig, Engine, EngineConfig, MappingCatalog,
    MappingError, MemorySink, NullSink, VersionError, VersionSet,
};
use semconv_store::{MemoryStore, SchemaVersion};

fn versions() -> VersionSet {
    VersionSet::new([OLD.into(), NEW.into()], NEW.into()).unwrap()
}

#[tokio::test]
async fn unknown_target_version_is_rejected() {
    let engine = engine_over(Arc::new(MemoryStore::new()), "");
    let err = engine
        .get_mapping(&"1.25".into(), &"9.99".into())
        .await
        .unwrap_err();
    assert_eq!(err, MappingError::Unsupported(VersionError::Unsupported("9.99".into())));
    assert!(!err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_fetch_once() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(50)));
    let catalog = MappingCatalog::new(
        versions(),
        source.clone(),
        Arc::new(NullSink),
        CatalogConfig::default(),
    );

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let catalog = catalog.clone();
            tokio::spawn(async move { catalog.get_mapping(&OLD.into(), &NEW.into()).await })
        })
        .collect();

    let mut mappings = Vec::new();
    for task in tasks {
        mappings.push(task.await.unwrap().unwrap());
    }

    assert_eq!(source.calls(), 1);
    assert!(mappings.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

    // Published: later callers do not reach the source either.
    catalog.get_mapping(&OLD.into(), &NEW.into()).await.unwrap();
    assert_eq!(source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_pairs_fetch_independently() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(10)));
    let catalog = MappingCatalog::new(
        versions(),
        source.clone(),
        Arc::new(NullSink),
        CatalogConfig::default(),
    );
    let (old, new) = (SchemaVersion::from(OLD), SchemaVersion::from(NEW));
    let (forward, same) = tokio::join!(
        catalog.get_mapping(&old, &new),
        catalog.get_mapping(&new, &new),
    );
    assert_eq!(forward.unwrap().len(), 1);
    assert!(same.unwrap().is_empty());
    assert_eq!(source.calls(), 2);
    assert_eq!(catalog.cached_pairs().len(), 2);
}

#[tokio::test]
async fn refresh_publishes_a_new_revision() {
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::builder(config(""))
        .memory_store(Arc::new(MemoryStore::new()))
        .audit_sink(sink.clone())
        .build()
        .unwrap();

    let first = engine.get_mapping(&OLD.into(), &NEW.into()).await.unwrap();
    let refreshed = engine.refresh_mapping(&OLD.into(), &NEW.into()).await.unwrap();
    let current = engine.get_mapping(&OLD.into(), &NEW.into()).await.unwrap();

    assert!(refreshed.revision() > first.revision());
    assert!(Arc::ptr_eq(&refreshed, &current));
    // The old snapshot is untouched.
    assert_eq!(first.forward("attributes.custom.trade_type"), Some("attributes.trade.type"));

    for _ in 0..100 {
        if sink.events().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let revisions: Vec<u64> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            AuditEvent::MappingFetched { revision, .. } => Some(revision),
            _ => None,
        })
        .collect();
    assert_eq!(revisions.len(), 2);
}

#[tokio::test]
async fn directory_source_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let tables = dir.path().join("schemas");
    std::fs::create_dir_all(tables.join(OLD)).unwrap();
    std::fs::write(
        tables.join(OLD).join(format!("{NEW}.json")),
        r#"{"attributes.custom.chain_id": "attributes.chain.id"}"#,
    )
    .unwrap();

    let path = dir.path().join("semconv.toml");
    std::fs::write(
        &path,
        format!(
            "[versions]\nsupported = [\"{OLD}\", \"{NEW}\"]\n\n[catalog]\nschema_dir = {:?}\n",
            tables.display().to_string()
        ),
    )
    .unwrap();

    let engine = Engine::builder(EngineConfig::load(&path).unwrap())
        .memory_store(Arc::new(MemoryStore::new()))
        .audit_sink(Arc::new(NullSink))
        .build()
        .unwrap();
    let mapping = engine.get_mapping(&OLD.into(), &NEW.into()).await.unwrap();
    assert_eq!(mapping.forward("attributes.custom.chain_id"), Some("attributes.chain.id"));

    let missing = engine.get_mapping(&NEW.into(), &OLD.into()).await.unwrap_err();
    assert!(matches!(missing, MappingError::NotFound { .. }));
    assert!(!missing.is_retryable());
}
