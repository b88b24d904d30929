use api::{create_router, AppState, ServerConfig};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use ledger::{LedgerEntry, LedgerStore, MemoryLedgerStore, StoreError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

/// Memory store with switchable write outage and history tampering
#[derive(Default)]
struct TestStore {
    inner: MemoryLedgerStore,
    fail_writes: AtomicBool,
    tamper: AtomicBool,
}

impl TestStore {
    fn tampered(&self, mut entry: LedgerEntry) -> LedgerEntry {
        if self.tamper.load(Ordering::SeqCst) && entry.index == 1 {
            entry.prev_hash = "f".repeat(64);
        }
        entry
    }
}

impl LedgerStore for TestStore {
    fn read_entry(&self, subject_id: &str, index: u64) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.inner.read_entry(subject_id, index)?.map(|e| self.tampered(e)))
    }

    fn head(&self, subject_id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        self.inner.head(subject_id)
    }

    fn append(&self, entry: LedgerEntry) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk offline".into()));
        }
        self.inner.append(entry)
    }

    fn scan(&self, subject_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .inner
            .scan(subject_id)?
            .into_iter()
            .map(|e| self.tampered(e))
            .collect())
    }

    fn subjects(&self) -> Result<Vec<String>, StoreError> {
        self.inner.subjects()
    }
}

fn setup() -> (Router, Arc<TestStore>) {
    let store = Arc::new(TestStore::default());
    let state = AppState::new(store.clone(), &ServerConfig::default()).unwrap();
    (create_router(Arc::new(state)), store)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn reading(subject: &str, temperature: f64) -> Value {
    json!({
        "subject_id": subject,
        "sensor_id": "SENSOR-001",
        "location": "Warehouse A",
        "metrics": { "temperature": temperature, "humidity": 45.0 }
    })
}

#[tokio::test]
async fn test_health() {
    let (app, _) = setup();
    let (status, body) = send(&app, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["stats"]["subject_count"], 0);
}

#[tokio::test]
async fn test_normal_reading_is_recorded_without_alert() {
    let (app, _) = setup();
    let (status, body) =
        send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", 5.0))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ledger_index"], 0);
    assert_eq!(body["severity"], "normal");
    assert!(body["alert"].is_null());
    assert_eq!(body["duplicate"], false);

    let (_, alerts) = send(&app, "GET", "/api/v1/alerts", None).await;
    assert_eq!(alerts["count"], 0);
}

#[tokio::test]
async fn test_excursion_raises_alert_and_ack() {
    let (app, _) = setup();
    send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", 5.0))).await;
    let (status, body) =
        send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", 12.0))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ledger_index"], 1);
    assert_eq!(body["severity"], "critical");
    assert_eq!(body["alert"]["ledger_index"], 2);
    let alert_id = body["alert"]["alert_id"].as_u64().unwrap();

    let (_, alerts) = send(&app, "GET", "/api/v1/alerts?subject=BATCH-001", None).await;
    assert_eq!(alerts["count"], 1);
    assert_eq!(alerts["unacknowledged_count"], 1);
    assert_eq!(alerts["data"][0]["metric"], "temperature");
    assert_eq!(alerts["data"][0]["reading_index"], 1);

    let uri = format!("/api/v1/alerts/{}/ack", alert_id);
    let (status, acked) = send(&app, "POST", &uri, Some(json!({ "by": "qa-lead" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["acknowledged"], true);
    assert_eq!(acked["acknowledged_by"], "qa-lead");

    let (_, pending) = send(&app, "GET", "/api/v1/alerts?acknowledged=false", None).await;
    assert_eq!(pending["count"], 0);
    assert_eq!(pending["unacknowledged_count"], 0);

    let (_, critical) = send(&app, "GET", "/api/v1/alerts?severity=critical", None).await;
    assert_eq!(critical["count"], 1);
}

#[tokio::test]
async fn test_ack_unknown_alert_is_not_found() {
    let (app, _) = setup();
    let (status, body) = send(&app, "POST", "/api/v1/alerts/999/ack", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_invalid_readings_are_rejected() {
    let (app, _) = setup();

    let missing = json!({
        "subject_id": "",
        "sensor_id": "SENSOR-001",
        "location": "Dock",
        "metrics": { "temperature": 5.0 }
    });
    let (status, body) = send(&app, "POST", "/api/v1/readings", Some(missing)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "rejected");

    let mut nan = reading("BATCH-001", 5.0);
    nan["metrics"]["temperature"] = json!("NaN");
    let (status, _) = send(&app, "POST", "/api/v1/readings", Some(nan)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, rejections) = send(&app, "GET", "/api/v1/rejections", None).await;
    assert_eq!(rejections["count"], 2);

    // Nothing reached the ledger
    let (status, _) = send(&app, "GET", "/api/v1/subjects/BATCH-001/chain", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_json() {
    let (app, _) = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/readings")
        .header("content-type", "application/json")
        .body(Body::from("{\"subject_id\": "))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_duplicate_token_returns_original_outcome() {
    let (app, _) = setup();
    let mut body = reading("BATCH-001", 12.0);
    body["idempotency_token"] = json!("tok-1");

    let (_, first) = send(&app, "POST", "/api/v1/readings", Some(body.clone())).await;
    let (status, second) = send(&app, "POST", "/api/v1/readings", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["ledger_index"], first["ledger_index"]);
    assert_eq!(second["entry_hash"], first["entry_hash"]);

    let (_, chain) = send(&app, "GET", "/api/v1/subjects/BATCH-001/chain", None).await;
    assert_eq!(chain["count"], 2);
    let (_, alerts) = send(&app, "GET", "/api/v1/alerts", None).await;
    assert_eq!(alerts["count"], 1);
}

#[tokio::test]
async fn test_chain_and_verification() {
    let (app, _) = setup();
    for t in [5.0, 6.0, 7.0] {
        send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", t))).await;
    }

    let (status, chain) = send(&app, "GET", "/api/v1/subjects/BATCH-001/chain", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chain["count"], 3);
    assert_eq!(chain["entries"][1]["prev_hash"], chain["entries"][0]["curr_hash"]);
    assert_eq!(chain["entries"][0]["event_type"], "ReadingRecorded");

    let (status, verification) =
        send(&app, "GET", "/api/v1/subjects/BATCH-001/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification["valid"], true);
    assert_eq!(verification["entries_checked"], 3);
    assert_eq!(verification["head_hash"], chain["entries"][2]["curr_hash"]);

    let (status, entry) =
        send(&app, "GET", "/api/v1/subjects/BATCH-001/entries/1/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["valid"], true);
    assert_eq!(entry["calculated_hash"], entry["stored_hash"]);

    let (status, body) =
        send(&app, "GET", "/api/v1/subjects/BATCH-001/entries/9/verify", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_tampered_history_is_detected() {
    let (app, store) = setup();
    for t in [5.0, 6.0, 7.0] {
        send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", t))).await;
    }
    send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-002", 4.0))).await;
    store.tamper.store(true, Ordering::SeqCst);

    let (_, verification) = send(&app, "GET", "/api/v1/subjects/BATCH-001/verify", None).await;
    assert_eq!(verification["valid"], false);
    assert_eq!(verification["first_broken_index"], 1);

    let (status, report) = send(&app, "GET", "/api/v1/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["subjects_checked"], 2);
    assert_eq!(report["invalid_chains"], 1);
    assert_eq!(report["broken"][0]["subject_id"], "BATCH-001");
}

#[tokio::test]
async fn test_custody_and_approval_feed_summary() {
    let (app, _) = setup();
    send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", 5.0))).await;

    let transfer = json!({
        "from_party": "Manufacturer",
        "to_party": "Distributor",
        "location": "Dock 4"
    });
    let (status, entry) =
        send(&app, "POST", "/api/v1/subjects/BATCH-001/custody", Some(transfer)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(entry["index"], 1);
    assert_eq!(entry["event_type"], "CustodyTransferred");

    let approval = json!({ "authority": "Regulator", "approved": true });
    let (status, _) =
        send(&app, "POST", "/api/v1/subjects/BATCH-001/approvals", Some(approval)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, subjects) = send(&app, "GET", "/api/v1/subjects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(subjects["count"], 1);
    let summary = &subjects["data"][0];
    assert_eq!(summary["subject_id"], "BATCH-001");
    assert_eq!(summary["entry_count"], 3);
    assert_eq!(summary["reading_count"], 1);
    assert_eq!(summary["custody_transfers"], 1);
    assert_eq!(summary["compliant"], true);
    assert_eq!(summary["latest_approval"]["approved"], true);
}

#[tokio::test]
async fn test_store_outage_is_retry_later() {
    let (app, store) = setup();
    store.fail_writes.store(true, Ordering::SeqCst);

    let (status, body) =
        send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", 5.0))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "retry_later");

    store.fail_writes.store(false, Ordering::SeqCst);
    let (status, body) =
        send(&app, "POST", "/api/v1/readings", Some(reading("BATCH-001", 5.0))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ledger_index"], 0);
}

#[tokio::test]
async fn test_metrics_disabled_without_recorder() {
    let (app, _) = setup();
    let (status, _) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_restart_keeps_alerts_and_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        in_memory: false,
        database_path: dir.path().join("db").join("pharmachain.db"),
        ..Default::default()
    };
    let mut excursion = reading("BATCH-001", 12.0);
    excursion["idempotency_token"] = json!("tok-restart");

    let (first, alert_id) = {
        let app = create_router(Arc::new(AppState::open(&config).unwrap()));
        let (status, first) =
            send(&app, "POST", "/api/v1/readings", Some(excursion.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let alert_id = first["alert"]["alert_id"].as_u64().unwrap();
        let uri = format!("/api/v1/alerts/{}/ack", alert_id);
        let (status, _) = send(&app, "POST", &uri, Some(json!({ "by": "qa-lead" }))).await;
        assert_eq!(status, StatusCode::OK);
        (first, alert_id)
    };

    let app = create_router(Arc::new(AppState::open(&config).unwrap()));
    let (_, alerts) = send(&app, "GET", "/api/v1/alerts", None).await;
    assert_eq!(alerts["count"], 1);
    assert_eq!(alerts["unacknowledged_count"], 0);
    assert_eq!(alerts["data"][0]["id"], alert_id);
    assert_eq!(alerts["data"][0]["acknowledged_by"], "qa-lead");

    let (status, again) = send(&app, "POST", "/api/v1/readings", Some(excursion)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["duplicate"], true);
    assert_eq!(again["ledger_index"], first["ledger_index"]);
    assert_eq!(again["alert"], first["alert"]);

    let (_, chain) = send(&app, "GET", "/api/v1/subjects/BATCH-001/chain", None).await;
    assert_eq!(chain["count"], 2);
    let (_, verify) = send(&app, "GET", "/api/v1/subjects/BATCH-001/verify", None).await;
    assert_eq!(verify["valid"], true);
}
