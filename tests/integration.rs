//! End-to-end tests: the full pipeline behind the real HTTP server on an
//! ephemeral port, with the in-memory vector backend, the hashed embedding
//! provider, and a stub completion service.

use axum::{routing::get, routing::post, Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use beleg::config::{
    CompletionConfig, Config, EmbeddingConfig, ImagesConfig, ServerConfig, StoreConfig,
    VectorConfig,
};
use beleg::query::OFFLINE_PROSE;
use beleg::server::{build_state, router, AppState};

struct TestApp {
    state: AppState,
    base: String,
    client: reqwest::Client,
    _tmp: TempDir,
}

/// Stub completion service: the vision model cannot read anything, the text
/// model answers with a fixed marker. Returns its base URL.
async fn spawn_stub_completion() -> String {
    let app = Router::new()
        .route(
            "/api/chat",
            post(|Json(body): Json<Value>| async move {
                let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
                let content = if model.starts_with("llava") {
                    "I cannot read this image, sorry."
                } else {
                    "PROSE_OK"
                };
                Json(json!({"message": {"role": "assistant", "content": content}}))
            }),
        )
        .route(
            "/api/tags",
            get(|| async { Json(json!({"models": [{"name": "llava:13b"}]})) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_app(completion_endpoint: String) -> TestApp {
    let tmp = TempDir::new().unwrap();

    let config = Config {
        currency: "EUR".to_string(),
        store: StoreConfig {
            path: tmp.path().join("beleg.sqlite"),
        },
        vector: VectorConfig {
            backend: "memory".to_string(),
            path: tmp.path().join("vectors"),
        },
        completion: CompletionConfig {
            endpoint: completion_endpoint,
            ..Default::default()
        },
        embedding: EmbeddingConfig {
            provider: "hashed".to_string(),
            ..Default::default()
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        images: ImagesConfig {
            dir: tmp.path().join("images"),
        },
    };

    let state = build_state(&config).await.unwrap();
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        state,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        _tmp: tmp,
    }
}

fn rewe_receipt() -> Value {
    json!({
        "vendor": "REWE",
        "date": "2024-01-15T10:30:00Z",
        "total": 45.67,
        "tax": 7.32,
        "currency": "EUR",
        "items": [
            {"desc": "Brot", "amount": 2.99},
            {"desc": "Milch", "amount": 1.29},
            {"desc": "Käse", "amount": 41.39}
        ]
    })
}

fn bar_receipt() -> Value {
    json!({
        "vendor": "Bar",
        "date": "2024-02-01T22:00:00Z",
        "total": 30.00,
        "tax": 4.75,
        "items": [
            {"desc": "Beer", "amount": 5.00},
            {"desc": "Wine", "amount": 20.00}
        ]
    })
}

async fn ingest(app: &TestApp, body: &Value) -> Value {
    let resp = app
        .client
        .post(format!("{}/api/ingest", app.base))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    let value: Value = resp.json().await.unwrap();
    assert_eq!(status, 200, "unexpected ingest response: {}", value);
    value
}

async fn get_receipt(app: &TestApp, id: i64) -> Value {
    let resp = app
        .client
        .get(format!("{}/api/receipts?receiptId={}", app.base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn clean_ingest_assigns_id_one_with_no_flags() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    let outcome = ingest(&app, &rewe_receipt()).await;
    assert_eq!(outcome["id"], 1);
    assert_eq!(outcome["auditFlags"]["duplicate"], false);
    assert_eq!(outcome["auditFlags"]["suspicious"], false);
    assert_eq!(outcome["auditFlags"]["missingVat"], false);
    assert_eq!(outcome["auditFlags"]["mathError"], false);
    assert_eq!(outcome["indexed"], true);

    let receipt = get_receipt(&app, 1).await;
    assert_eq!(receipt["vendor"], "REWE");
    assert_eq!(receipt["total"], 45.67);
    assert_eq!(receipt["tax"], 7.32);
    assert_eq!(receipt["lineItems"].as_array().unwrap().len(), 3);
    assert_eq!(receipt["status"], "verified");

    // Semantic search finds the receipt by an item word.
    let query = app.state.embedder.embed("Brot").await.unwrap();
    let hits = app
        .state
        .index
        .search(&query, 5, &Default::default())
        .await
        .unwrap();
    assert_eq!(hits[0].id, 1);
    assert!(hits[0].similarity > 0.0);
}

#[tokio::test]
async fn duplicate_ingest_flags_both_receipts() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;
    let second = ingest(&app, &rewe_receipt()).await;
    assert_eq!(second["id"], 2);
    assert_eq!(second["auditFlags"]["duplicate"], true);

    // The first receipt is refreshed too: both sides carry the flag.
    let first = get_receipt(&app, 1).await;
    assert_eq!(first["auditFlags"]["duplicate"], true);
    assert_eq!(first["status"], "flagged");
}

#[tokio::test]
async fn vendor_normalization_drives_duplicate_detection() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;
    let mut spaced = rewe_receipt();
    spaced["vendor"] = json!("  rewe  ");
    let outcome = ingest(&app, &spaced).await;
    assert_eq!(outcome["auditFlags"]["duplicate"], true);
}

#[tokio::test]
async fn math_error_and_suspicious_category() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    // Line sum 25.00; total − tax = 25.25; off by 0.25.
    let outcome = ingest(&app, &bar_receipt()).await;
    assert_eq!(outcome["auditFlags"]["mathError"], true);
    assert_eq!(outcome["auditFlags"]["suspicious"], true);
    assert_eq!(outcome["auditFlags"]["duplicate"], false);
    assert_eq!(outcome["auditFlags"]["missingVat"], false);
}

#[tokio::test]
async fn zero_tax_flags_missing_vat_only() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    let mut receipt = rewe_receipt();
    receipt["tax"] = json!(0.00);
    let outcome = ingest(&app, &receipt).await;
    assert_eq!(outcome["auditFlags"]["missingVat"], true);
    assert_eq!(outcome["auditFlags"]["mathError"], false);
    assert_eq!(outcome["auditFlags"]["suspicious"], false);
    assert_eq!(outcome["auditFlags"]["duplicate"], false);
}

#[tokio::test]
async fn alcohol_query_returns_deterministic_line_sum() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await; // id 1
    ingest(&app, &rewe_receipt()).await; // id 2, duplicate pair
    ingest(&app, &bar_receipt()).await; // id 3

    let resp = app
        .client
        .post(format!("{}/api/chat/query", app.base))
        .json(&json!({"query": "how much did I spend on alcohol?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let answer: Value = resp.json().await.unwrap();

    assert_eq!(answer["intent"], "sum_by_category");
    assert_eq!(answer["totalAmount"], 25.00);
    assert_eq!(answer["count"], 1);
    assert_eq!(answer["receiptIds"], json!([3]));
    assert_eq!(answer["answer"], "PROSE_OK");
}

#[tokio::test]
async fn query_degrades_gracefully_when_language_service_is_offline() {
    // Nothing listens on this port; the numbers must still come back.
    let app = spawn_app("http://127.0.0.1:9".to_string()).await;

    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &bar_receipt()).await;

    let resp = app
        .client
        .post(format!("{}/api/chat/query", app.base))
        .json(&json!({"query": "how much did I spend on alcohol?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let answer: Value = resp.json().await.unwrap();

    assert_eq!(answer["totalAmount"], 25.00);
    assert_eq!(answer["count"], 1);
    assert_eq!(answer["receiptIds"], json!([3]));
    assert_eq!(answer["answer"], OFFLINE_PROSE);
}

#[tokio::test]
async fn vendor_sum_matches_store_aggregation() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &bar_receipt()).await;

    let resp = app
        .client
        .post(format!("{}/api/chat/query", app.base))
        .json(&json!({"query": "how much did we spend at REWE?"}))
        .send()
        .await
        .unwrap();
    let answer: Value = resp.json().await.unwrap();

    assert_eq!(answer["intent"], "sum_by_vendor");
    assert_eq!(answer["totalAmount"], 45.67);
    assert_eq!(answer["count"], 1);
    assert_eq!(answer["receiptIds"], json!([1]));
}

#[tokio::test]
async fn empty_store_query_answers_no_matching_receipts() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    let resp = app
        .client
        .post(format!("{}/api/chat/query", app.base))
        .json(&json!({"query": "how much did I spend on fuel?"}))
        .send()
        .await
        .unwrap();
    let answer: Value = resp.json().await.unwrap();

    assert_eq!(answer["totalAmount"], 0.0);
    assert_eq!(answer["count"], 0);
    assert_eq!(answer["receiptIds"], json!([]));
    assert_eq!(answer["answer"], "No matching receipts.");
}

#[tokio::test]
async fn extraction_failure_returns_422_and_writes_nothing() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    use base64::Engine;
    let corrupt = base64::engine::general_purpose::STANDARD.encode(b"not an image");
    let resp = app
        .client
        .post(format!("{}/api/extract", app.base))
        .json(&json!({"image": corrupt, "mime": "image/jpeg"}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "EXTRACTION_FAILED");
    assert_eq!(body["error"]["checksum"].as_str().unwrap().len(), 64);
    assert!(body["error"]["rawOutput"]
        .as_str()
        .unwrap()
        .contains("cannot read"));

    let listing: Value = app
        .client
        .get(format!("{}/api/receipts", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["count"], 0);
}

#[tokio::test]
async fn delete_clears_duplicate_flag_on_remaining_partner() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await; // id 1
    ingest(&app, &rewe_receipt()).await; // id 2

    let resp = app
        .client
        .delete(format!("{}/api/receipts/2", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let first = get_receipt(&app, 1).await;
    assert_eq!(first["auditFlags"]["duplicate"], false);

    // Index stays in step: one entry per stored receipt.
    assert_eq!(app.state.index.len().await.unwrap(), 1);
    assert_eq!(app.state.store.all_ids().await.unwrap(), vec![1]);

    // Re-ingesting the same record recreates the pair.
    let third = ingest(&app, &rewe_receipt()).await;
    assert_eq!(third["auditFlags"]["duplicate"], true);
    let first = get_receipt(&app, 1).await;
    assert_eq!(first["auditFlags"]["duplicate"], true);
}

#[tokio::test]
async fn update_rewrites_and_reaudits() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;

    let mut updated = rewe_receipt();
    updated["tax"] = json!(0.00);
    let resp = app
        .client
        .put(format!("{}/api/receipts/1", app.base))
        .json(&updated)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["auditFlags"]["missingVat"], true);

    let resp = app
        .client
        .put(format!("{}/api/receipts/99", app.base))
        .json(&updated)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn validation_failures_are_400_with_kind() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    let mut bad = rewe_receipt();
    bad["tax"] = json!(50.00); // tax above total
    let resp = app
        .client
        .post(format!("{}/api/ingest", app.base))
        .json(&bad)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "VALIDATION");

    let resp = app
        .client
        .get(format!("{}/api/receipts?receiptId=42", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "NOT_FOUND");
}

#[tokio::test]
async fn audit_endpoint_groups_by_flag_kind() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &bar_receipt()).await;

    let body: Value = app
        .client
        .get(format!("{}/api/audit", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["summary"]["totalDuplicates"], 2);
    assert_eq!(body["summary"]["totalMismatches"], 1);
    assert_eq!(body["summary"]["totalSuspicious"], 1);
    assert_eq!(body["summary"]["totalMissingVAT"], 0);
    assert_eq!(body["mismatches"][0]["receiptId"], 3);
}

#[tokio::test]
async fn analytics_summary_and_monthly_buckets() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await; // 2024-01, 45.67
    ingest(&app, &bar_receipt()).await; // 2024-02, 30.00

    let summary: Value = app
        .client
        .get(format!("{}/api/analytics/summary", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(summary["count"], 2);
    assert_eq!(summary["total"], 75.67);
    assert_eq!(summary["vatTotal"], 12.07);

    let monthly: Value = app
        .client
        .get(format!("{}/api/analytics/monthly", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let buckets = monthly["monthlyTotals"].as_array().unwrap();
    assert_eq!(buckets.len(), 2);
    // Descending amount: January's 45.67 before February's 30.00.
    assert_eq!(buckets[0]["month"], "2024-01");
    assert_eq!(buckets[0]["total"], 45.67);

    let vendors: Value = app
        .client
        .get(format!("{}/api/analytics/vendors", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(vendors["vendorTotals"][0]["vendor"], "REWE");
}

#[tokio::test]
async fn receipts_listing_filters_by_vendor_and_dates() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &bar_receipt()).await;

    let body: Value = app
        .client
        .get(format!("{}/api/receipts?vendor=rewe", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["receipts"][0]["vendor"], "REWE");

    let body: Value = app
        .client
        .get(format!(
            "{}/api/receipts?startDate=2024-02-01&endDate=2024-02-28",
            app.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["receipts"][0]["vendor"], "Bar");

    let resp = app
        .client
        .get(format!("{}/api/receipts?startDate=febuary", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn health_reports_completion_and_index() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;

    let body: Value = app
        .client
        .get(format!("{}/api/health", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["completion"]["status"], "online");
    assert_eq!(body["vector"]["backend"], "memory");
    assert_eq!(body["vector"]["documents"], 1);
    assert_eq!(body["reconcileQueue"], 0);
}

#[tokio::test]
async fn prose_chat_bounds_history_and_degrades() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;

    let history: Vec<Value> = (0..25)
        .map(|i| json!({"role": if i % 2 == 0 { "user" } else { "assistant" }, "content": format!("turn {}", i)}))
        .collect();

    let body: Value = app
        .client
        .post(format!("{}/api/chat", app.base))
        .json(&json!({"message": "what did I buy at rewe?", "history": history}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["response"], "PROSE_OK");
    assert_eq!(body["sourcesUsed"], 1);

    let offline = spawn_app("http://127.0.0.1:9".to_string()).await;
    ingest(&offline, &rewe_receipt()).await;
    let body: Value = offline
        .client
        .post(format!("{}/api/chat", offline.base))
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["response"], OFFLINE_PROSE);
}

#[tokio::test]
async fn reaudit_is_idempotent_on_stored_state() {
    let stub = spawn_stub_completion().await;
    let app = spawn_app(stub).await;

    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &rewe_receipt()).await;
    ingest(&app, &bar_receipt()).await;

    // Flags are a cache of the audit engine's output: recomputing every
    // receipt against the current store changes nothing.
    let changed = app.state.ingestor.recompute_all_flags().await.unwrap();
    assert_eq!(changed, 0);
}
