//! Google REST adapters against a local fake server.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use casefile::bigquery::BigQueryWarehouse;
use casefile::blob_gcs::GcsObjectStore;
use casefile::gcp::{GcpClient, TokenSource};
use casefile::translate::CloudTranslator;
use casefile::vision::VisionOcr;
use casefile_core::error::{classify, ErrorKind};
use casefile_core::models::WarehouseRow;
use casefile_core::services::{OcrEngine, Translator};
use casefile_core::store::{ObjectStore, Warehouse};
use serde_json::json;

#[derive(Default)]
struct Fake {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    datasets: Mutex<BTreeSet<String>>,
    auth: Mutex<Vec<String>>,
}

type Shared = Arc<Fake>;

async fn handle(
    State(fake): State<Shared>,
    method: Method,
    uri: Uri,
    headers: axum::http::HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        fake.auth.lock().unwrap().push(auth.to_string());
    }
    let path = uri.path().replace("%2F", "/");

    // storage
    if method == Method::POST && path == "/upload/storage/v1/b/casefile/o" {
        let name = query.get("name").cloned().unwrap_or_default();
        fake.objects.lock().unwrap().insert(name.clone(), body.to_vec());
        return Json(json!({ "name": name })).into_response();
    }
    if method == Method::GET && path == "/storage/v1/b/casefile/o" {
        let prefix = query.get("prefix").cloned().unwrap_or_default();
        let start: usize = query
            .get("pageToken")
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let objects = fake.objects.lock().unwrap();
        let matching: Vec<(&String, &Vec<u8>)> = objects
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .collect();
        // one item per page to exercise paging
        let mut page = json!({ "kind": "storage#objects" });
        if let Some((name, content)) = matching.get(start) {
            page["items"] = json!([{
                "name": name,
                "size": content.len().to_string(),
                "md5Hash": format!("md5-{}", content.len()),
            }]);
            if start + 1 < matching.len() {
                page["nextPageToken"] = json!((start + 1).to_string());
            }
        }
        return Json(page).into_response();
    }
    if method == Method::GET {
        if let Some(name) = path.strip_prefix("/storage/v1/b/casefile/o/") {
            return match fake.objects.lock().unwrap().get(name) {
                Some(content) => content.clone().into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            };
        }
    }
    if method == Method::DELETE {
        if let Some(name) = path.strip_prefix("/storage/v1/b/casefile/o/") {
            return match fake.objects.lock().unwrap().remove(name) {
                Some(_) => StatusCode::NO_CONTENT.into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            };
        }
    }
    if path.starts_with("/storage/v1/b/broken/") {
        return (StatusCode::FORBIDDEN, "access denied").into_response();
    }

    // vision
    if path == "/v1/files:asyncBatchAnnotate" {
        return Json(json!({ "name": "operations/ocr-1" })).into_response();
    }
    if path == "/v1/operations/ocr-1" {
        return Json(json!({ "name": "operations/ocr-1", "done": false })).into_response();
    }

    // translate
    if path.ends_with("/locations/global:translateText") {
        let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
        if request["contents"][0] == "troppo" {
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        return Json(json!({
            "translations": [{ "translatedText": "Patient visited" }]
        }))
        .into_response();
    }

    // bigquery
    if let Some(rest) = path.strip_prefix("/bigquery/v2/projects/proj/datasets") {
        if method == Method::POST && rest.is_empty() {
            let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let id = request["datasetReference"]["datasetId"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            fake.datasets.lock().unwrap().insert(id.clone());
            return Json(json!({ "id": format!("proj:{}", id) })).into_response();
        }
        if rest.ends_with("/insertAll") {
            return Json(json!({
                "kind": "bigquery#tableDataInsertAllResponse",
                "insertErrors": [{ "index": 0, "errors": [{ "reason": "invalid" }] }]
            }))
            .into_response();
        }
        if method == Method::GET {
            let id = rest.trim_start_matches('/');
            if fake.datasets.lock().unwrap().contains(id) {
                return Json(json!({ "id": format!("proj:{}", id) })).into_response();
            }
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

async fn start() -> (String, Shared) {
    let fake: Shared = Arc::new(Fake::default());
    let app = Router::new().fallback(handle).with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), fake)
}

fn client() -> GcpClient {
    GcpClient::new(Arc::new(TokenSource::fixed("t0k")), Duration::from_secs(5), 0).unwrap()
}

#[tokio::test]
async fn test_gcs_write_list_read() {
    let (base, fake) = start().await;
    let store = GcsObjectStore::new(client(), &base, "casefile");

    store
        .write_text("raw_txt/case1.txt", "Paziente visitato")
        .await
        .unwrap();
    store.write_text("raw_txt/case2.txt", "febbre").await.unwrap();
    store.write_text("json/case1-x.json", "{}").await.unwrap();

    let listed = store.list("raw_txt/").await.unwrap();
    let names: Vec<&str> = listed.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["raw_txt/case1.txt", "raw_txt/case2.txt"]);
    assert_eq!(listed[1].size, 6);
    assert_eq!(listed[1].fingerprint, "md5-6");

    assert_eq!(
        store.read_text("raw_txt/case1.txt").await.unwrap(),
        "Paziente visitato"
    );
    assert!(store.read("raw_txt/case9.txt").await.unwrap().is_none());
    assert_eq!(
        classify(&store.read_text("raw_txt/case9.txt").await.unwrap_err()),
        ErrorKind::MissingBlob
    );

    assert!(fake
        .auth
        .lock()
        .unwrap()
        .iter()
        .all(|h| h == "Bearer t0k"));
}

#[tokio::test]
async fn test_gcs_delete_prefix() {
    let (base, fake) = start().await;
    let store = GcsObjectStore::new(client(), &base, "casefile");

    store.write_text("json/case1-output-1-to-20.json", "{}").await.unwrap();
    store.write_text("json/case1-output-21-to-21.json", "{}").await.unwrap();
    store.write_text("json/case10-output-1-to-1.json", "{}").await.unwrap();

    assert_eq!(store.delete_prefix("json/case1-").await.unwrap(), 2);
    assert!(!store.delete("json/case1-output-1-to-20.json").await.unwrap());
    let remaining: Vec<String> = fake.objects.lock().unwrap().keys().cloned().collect();
    assert_eq!(remaining, vec!["json/case10-output-1-to-1.json"]);
}

#[tokio::test]
async fn test_gcs_denied_is_engine_error() {
    let (base, _) = start().await;
    let store = GcsObjectStore::new(client(), &base, "broken");
    let err = store.list("pdf/").await.unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Engine);
    assert!(format!("{:#}", err).contains("403"));
}

#[tokio::test]
async fn test_vision_operation_times_out() {
    let (base, _) = start().await;
    let ocr = VisionOcr::new(
        client(),
        &base,
        Duration::from_millis(300),
        Duration::from_millis(50),
    );
    let err = ocr
        .annotate_pdf("gs://casefile/pdf/case1.pdf", "gs://casefile/json/case1-", 20)
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::StageTimeout);
}

#[tokio::test]
async fn test_translate_sync() {
    let (base, _) = start().await;
    let translator = CloudTranslator::new(
        client(),
        &base,
        "proj",
        "us-central1",
        Duration::from_secs(1),
        Duration::from_millis(50),
    );
    assert_eq!(
        translator
            .translate_text("Paziente visitato", "it", "en")
            .await
            .unwrap(),
        "Patient visited"
    );
    let err = translator
        .translate_text("troppo", "it", "en")
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::PayloadTooLarge);
}

#[tokio::test]
async fn test_bigquery_ensure_and_insert_errors() {
    let (base, _) = start().await;
    let warehouse = BigQueryWarehouse::new(client(), &base, "proj", Duration::from_secs(1));

    let first = warehouse.ensure_dataset("covid19").await.unwrap();
    assert!(first.created);
    assert_eq!(first.id, "proj.covid19");
    let second = warehouse.ensure_dataset("covid19").await.unwrap();
    assert!(!second.created);

    let row = WarehouseRow {
        case: "case1".to_string(),
        it_raw_txt: "febbre".to_string(),
        eng_raw_txt: "fever".to_string(),
        eng_txt: " fever".to_string(),
    };
    let err = warehouse
        .insert_row("covid19", "cases", &row)
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::AssertionFailure);
    assert!(err.to_string().contains("case1"));
}
