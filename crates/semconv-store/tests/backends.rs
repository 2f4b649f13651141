//! Behaviour every backend must share, run against each available store.

use semconv_store::{
    MemoryStore, Predicate, Query, Record, RecordFilter, RecordId, RecordStore, SavedQuery, SavedQueryStore,
    StoreError, UpdateOutcome,
};

fn seed() -> Vec<Record> {
    (0..25)
        .map(|i| {
            let version = if i % 5 == 0 { "1.32" } else { "1.25" };
            Record::new(format!("trade-{i:03}"), version)
                .with("attributes.trade_id", i as i64)
                .with("attributes.custom.trade_type", if i % 2 == 0 { "arbitrage" } else { "swap" })
                .observed_at(1_000 + i as u64)
        })
        .collect()
}

async fn paging_visits_every_record_once<S: RecordStore>(store: &S) {
    store.insert_batch(seed()).await.unwrap();

    let filter = RecordFilter::all().with_versions(["1.25".into()]);
    let mut seen = Vec::new();
    let mut after: Option<RecordId> = None;
    loop {
        let page = store.scan(&filter, after.as_ref(), 7).await.unwrap();
        if page.is_empty() {
            break;
        }
        after = page.last().map(|r| r.id.clone());
        seen.extend(page.into_iter().map(|r| r.id));
    }

    assert_eq!(seen.len(), 20);
    let mut sorted = seen.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, seen);
}

async fn compare_on_version<S: RecordStore>(store: &S) {
    store.insert(Record::new("r1", "1.25")).await.unwrap();
    let next = Record::new("r1", "1.32").with("attributes.trade.type", "swap");

    let first = store.update_if_version(&next, &"1.25".into()).await.unwrap();
    let second = store.update_if_version(&next, &"1.25".into()).await.unwrap();
    assert_eq!(first, UpdateOutcome::Applied);
    assert_eq!(second, UpdateOutcome::VersionConflict);

    let err = store
        .update_if_version(&Record::new("absent", "1.32"), &"1.25".into())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn query_reads_predicates_only<S: RecordStore>(store: &S) {
    store.insert_batch(seed()).await.unwrap();
    let query = Query::new("1.25").with(Predicate::equals("attributes.custom.trade_type", "arbitrage"));
    let hits = store.query(&query).await.unwrap();
    // Version tags are not part of the predicate set.
    assert_eq!(hits.len(), 13);
}

async fn saved_query_round_trip<S: SavedQueryStore>(store: &S) {
    let q = SavedQuery::new(
        "panel-1",
        "arbitrage volume",
        Query::new("1.25").with(Predicate::equals("attributes.custom.trade_type", "arbitrage")),
    );
    store.save_query(q.clone()).await.unwrap();
    assert_eq!(store.get_saved_query(&"panel-1".into()).await.unwrap(), Some(q));
    assert_eq!(store.get_saved_query(&"panel-2".into()).await.unwrap(), None);
}

#[tokio::test]
async fn memory_backend_contract() {
    paging_visits_every_record_once(&MemoryStore::new()).await;
    compare_on_version(&MemoryStore::new()).await;
    query_reads_predicates_only(&MemoryStore::new()).await;
    saved_query_round_trip(&MemoryStore::new()).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backend_contract() {
    use semconv_store::SqliteStore;

    let open = || SqliteStore::open_in_memory().unwrap();
    paging_visits_every_record_once(&open()).await;
    compare_on_version(&open()).await;
    query_reads_predicates_only(&open()).await;
    saved_query_round_trip(&open()).await;
}
