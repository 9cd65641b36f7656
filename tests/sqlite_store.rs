//! SQLite-backed sinks and state store against a temporary database.

use casefile::db::connect_path;
use casefile::migrate::apply;
use casefile::sqlite_store::SqliteStore;
use casefile_core::error::{classify, ErrorKind};
use casefile_core::models::{CaseFilter, CategoryMap, WarehouseRow};
use casefile_core::state::{ProcessingState, Stage, Step};
use casefile_core::store::{DocumentStore, StateStore, Warehouse};
use tempfile::TempDir;

async fn open(tmp: &TempDir) -> SqliteStore {
    let pool = connect_path(&tmp.path().join("data").join("casefile.sqlite"))
        .await
        .unwrap();
    apply(&pool).await.unwrap();
    SqliteStore::new(pool, "case")
}

fn row(case: &str, eng_txt: &str) -> WarehouseRow {
    WarehouseRow {
        case: case.to_string(),
        it_raw_txt: "febbre e brividi".to_string(),
        eng_raw_txt: "fever and chills".to_string(),
        eng_txt: eng_txt.to_string(),
    }
}

fn entities(symptoms: &[&str]) -> CategoryMap {
    let mut map = CategoryMap::new();
    map.insert(
        "Sign or Symptom".to_string(),
        symptoms.iter().map(|s| s.to_string()).collect(),
    );
    map
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let first = store.ensure_dataset("covid19").await.unwrap();
    let second = store.ensure_dataset("covid19").await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.id, second.id);

    let t1 = store.ensure_table("covid19", "cases").await.unwrap();
    let t2 = store.ensure_table("covid19", "cases").await.unwrap();
    assert!(t1.created);
    assert!(!t2.created);
    assert_eq!(t1.id, "covid19.cases");
}

#[tokio::test]
async fn test_table_requires_dataset() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let err = store.ensure_table("missing", "cases").await.unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Engine);

    let err = store
        .insert_row("missing", "cases", &row("case1", " fever"))
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Engine);
}

#[tokio::test]
async fn test_rows_are_append_only() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    store.ensure_dataset("covid19").await.unwrap();
    store.ensure_table("covid19", "cases").await.unwrap();

    store
        .insert_row("covid19", "cases", &row("case23", " fever"))
        .await
        .unwrap();
    store
        .insert_row("covid19", "cases", &row("case23", " chills"))
        .await
        .unwrap();

    let found = store
        .find_case("covid19", "cases", "case23")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.eng_txt, " fever");
    assert!(store
        .find_case("covid19", "cases", "case24")
        .await
        .unwrap()
        .is_none());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM warehouse_rows")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_docstore_upsert_and_query() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    store
        .upsert_entities("case1", &entities(&["fever"]))
        .await
        .unwrap();
    store
        .upsert_entities("case2", &entities(&["chills", "fever"]))
        .await
        .unwrap();
    store
        .upsert_entities("case1", &entities(&["fever", "chills"]))
        .await
        .unwrap();

    let case1 = store.get("case1").await.unwrap().unwrap();
    assert_eq!(case1.entities, entities(&["fever", "chills"]));

    let mut filter = CaseFilter::new();
    filter.insert("Sign or Symptom".to_string(), vec!["chills".to_string()]);
    let found = store.query(&filter, 10).await.unwrap();
    let titles: Vec<&str> = found.iter().map(|r| r.doc_title.as_str()).collect();
    assert_eq!(titles, vec!["case1", "case2"]);

    assert_eq!(store.query(&filter, 1).await.unwrap().len(), 1);
    assert_eq!(store.query(&CaseFilter::new(), 10).await.unwrap().len(), 2);

    filter.insert("Finding".to_string(), vec!["lesion".to_string()]);
    assert!(store.query(&filter, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_processing_state_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    assert!(store.load("case1").await.unwrap().is_none());

    let mut state = ProcessingState::new("case1", "abc");
    state.complete(Step::Ocr);
    state.complete(Step::ExtractText);
    store.save(&state).await.unwrap();

    state.complete(Step::Translate);
    state.fail("curate: missing blob: eng_txt/case1.txt");
    store.save(&state).await.unwrap();

    let loaded = store.load("case1").await.unwrap().unwrap();
    assert_eq!(loaded.stage(), Stage::Translated);
    assert_eq!(loaded.content_hash, "abc");
    assert!(loaded.is_done(Step::ExtractText));
    assert_eq!(
        loaded.last_error.as_deref(),
        Some("curate: missing blob: eng_txt/case1.txt")
    );

    store.save(&ProcessingState::new("case0", "h")).await.unwrap();
    let titles: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.doc_title)
        .collect();
    assert_eq!(titles, vec!["case0", "case1"]);
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    apply(store.pool()).await.unwrap();
    store.ensure_dataset("covid19").await.unwrap();
}
