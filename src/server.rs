//! HTTP surface.
//!
//! Thin request-routing over the ingestor, the query planner, and the
//! relational store; no business logic lives here.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/health` | Liveness of the completion service and vector index |
//! | `GET`  | `/api/receipts` | List receipts; `receiptId` returns a single one |
//! | `POST` | `/api/ingest` (+ `/api/ingest/db`) | Ingest a structured record |
//! | `PUT`  | `/api/receipts/{id}` | Full-replacement update |
//! | `DELETE` | `/api/receipts/{id}` | Delete and evict the vector |
//! | `POST` | `/api/extract` | Extract from a base64 image (no store write) |
//! | `POST` | `/api/extract/upload` | Multipart upload; extract and ingest |
//! | `GET`  | `/api/audit` | Flagged receipts grouped by flag kind |
//! | `GET`  | `/api/analytics/*` | Summary, monthly, category, vendor totals |
//! | `POST` | `/api/chat/query` | Structured Q&A (prose + deterministic numbers) |
//! | `POST` | `/api/chat` | Prose-only chat with bounded history |
//!
//! # Error contract
//!
//! Error bodies are `{ "error": { "kind": "...", "message": "..." } }` with
//! kinds from the fixed taxonomy (`VALIDATION`, `NOT_FOUND`,
//! `EXTRACTION_FAILED`, `UPSTREAM_UNAVAILABLE`, `UPSTREAM_TIMEOUT`,
//! `STORE_FAILURE`, `INDEX_FAILURE`, `INTERNAL`). Extraction failures also
//! carry the input checksum and the raw model output for debugging.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::completion::{CompletionClient, CompletionError};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::extract::{extract_receipt, Confidence, ExtractError};
use crate::ingest::{IngestError, Ingestor};
use crate::models::{cents_to_f64, AuditFlags, Receipt, ReceiptDraft};
use crate::query::{ChatTurn, QueryPlanner};
use crate::reconcile::{reindex_sweep, spawn_reconciler, ReconcileQueue};
use crate::store::{ListFilter, ReceiptStore};
use crate::vector::{create_index, VectorIndex};
use crate::{db, migrate};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: ReceiptStore,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub completion: Arc<CompletionClient>,
    pub ingestor: Arc<Ingestor>,
    pub planner: Arc<QueryPlanner>,
    pub queue: ReconcileQueue,
}

/// Wire up every component from configuration: database (migrated), vector
/// index, embedder, completion client, ingestor, and planner.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let pool = db::connect(&config.store.path).await?;
    migrate::run_migrations(&pool).await?;
    let store = ReceiptStore::new(pool);

    let index: Arc<dyn VectorIndex> =
        create_index(&config.vector.backend, &config.vector.path)
            .await?
            .into();
    let embedder: Arc<dyn Embedder> =
        create_embedder(&config.embedding, &config.completion)?.into();
    let completion = Arc::new(CompletionClient::new(&config.completion)?);
    let queue = ReconcileQueue::new();

    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        index.clone(),
        embedder.clone(),
        queue.clone(),
        config.currency.clone(),
    ));
    let planner = Arc::new(QueryPlanner::new(
        store.clone(),
        index.clone(),
        embedder.clone(),
        completion.clone(),
        config.currency.clone(),
    ));

    Ok(AppState {
        config: Arc::new(config.clone()),
        store,
        index,
        embedder,
        completion,
        ingestor,
        planner,
        queue,
    })
}

/// Build the router over prepared state. Separated from [`run_server`] so
/// tests can drive the full surface on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let images_dir = state.config.images.dir.clone();

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/receipts", get(handle_receipts))
        .route("/api/receipts/{id}", put(handle_update).delete(handle_delete))
        .route("/api/ingest", post(handle_ingest))
        .route("/api/ingest/db", post(handle_ingest))
        .route("/api/extract", post(handle_extract))
        .route("/api/extract/upload", post(handle_extract_upload))
        .route("/api/audit", get(handle_audit))
        .route("/api/analytics/summary", get(handle_summary))
        .route("/api/analytics/monthly", get(handle_monthly))
        .route("/api/analytics/categories", get(handle_categories))
        .route("/api/analytics/vendors", get(handle_vendors))
        .route("/api/chat/query", post(handle_chat_query))
        .route("/api/chat", post(handle_chat))
        .nest_service("/api/images", ServeDir::new(images_dir))
        .layer(cors)
        .with_state(state)
}

/// Start the server: build state, run the startup re-index sweep, spawn the
/// reconciliation task, bind, and serve until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;

    reindex_sweep(&state.store, state.index.as_ref(), state.embedder.as_ref()).await?;
    spawn_reconciler(
        state.queue.clone(),
        state.store.clone(),
        state.index.clone(),
        state.embedder.clone(),
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app = router(state);

    info!(addr = %bind_addr, "bookkeeping backend listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    #[serde(rename = "rawOutput", skip_serializing_if = "Option::is_none")]
    raw_output: Option<String>,
}

pub struct AppError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    checksum: Option<String>,
    raw_output: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind.to_string(),
                message: self.message,
                checksum: self.checksum,
                raw_output: self.raw_output,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, kind: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        kind,
        message: message.into(),
        checksum: None,
        raw_output: None,
    }
}

fn validation(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "VALIDATION", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

fn store_failure(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_FAILURE", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Validation(msg) => validation(msg),
            IngestError::NotFound(id) => not_found(format!("receipt {} not found", id)),
            IngestError::Internal(e) => store_failure(e.to_string()),
        }
    }
}

impl From<ExtractError> for AppError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Upstream(CompletionError::Timeout(msg)) => {
                app_error(StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT", msg)
            }
            ExtractError::Upstream(err) => app_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "UPSTREAM_UNAVAILABLE",
                err.to_string(),
            ),
            ExtractError::Unparseable { checksum, raw } => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                kind: "EXTRACTION_FAILED",
                message: "no receipt could be extracted from the image".to_string(),
                checksum: Some(checksum),
                raw_output: Some(raw),
            },
        }
    }
}

// ============ Receipt DTO ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptDto {
    id: i64,
    vendor: String,
    date: String,
    total: f64,
    subtotal: f64,
    tax: f64,
    currency: String,
    category: Option<String>,
    payment_method: Option<String>,
    receipt_number: Option<String>,
    image_url: Option<String>,
    line_items: Vec<LineItemDto>,
    audit_flags: AuditFlagsDto,
    status: String,
    created_at: String,
    updated_at: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LineItemDto {
    id: i64,
    description: String,
    quantity: i64,
    unit_price: f64,
    total: f64,
    vat_percent: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditFlagsDto {
    duplicate: bool,
    suspicious: bool,
    missing_vat: bool,
    math_error: bool,
}

impl From<AuditFlags> for AuditFlagsDto {
    fn from(f: AuditFlags) -> Self {
        Self {
            duplicate: f.duplicate,
            suspicious: f.suspicious,
            missing_vat: f.missing_vat,
            math_error: f.math_error,
        }
    }
}

impl From<&Receipt> for ReceiptDto {
    fn from(r: &Receipt) -> Self {
        Self {
            id: r.id,
            vendor: r.vendor.clone(),
            date: r.date.to_rfc3339(),
            total: cents_to_f64(r.total_cents),
            subtotal: cents_to_f64(r.total_cents - r.tax_cents),
            tax: cents_to_f64(r.tax_cents),
            currency: r.currency.clone(),
            category: r.category.clone(),
            payment_method: r.payment_method.clone(),
            receipt_number: r.receipt_number.clone(),
            image_url: r.image_ref.clone(),
            line_items: r
                .items
                .iter()
                .map(|i| LineItemDto {
                    id: i.id,
                    description: i.description.clone(),
                    quantity: i.quantity,
                    unit_price: cents_to_f64(i.unit_price_cents),
                    total: cents_to_f64(i.total_cents),
                    vat_percent: i.vat_percent,
                })
                .collect(),
            audit_flags: r.flags.into(),
            status: if r.flags.any() { "flagged" } else { "verified" }.to_string(),
            created_at: r.created_at.to_rfc3339(),
            updated_at: r.updated_at.to_rfc3339(),
        }
    }
}

// ============ GET /api/health ============

async fn handle_health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let completion = state.completion.health().await;
    let documents = state.index.len().await.map_err(|e| internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "completion": completion,
        "vector": {
            "backend": state.config.vector.backend,
            "documents": documents,
        },
        "reconcileQueue": state.queue.len(),
    })))
}

// ============ GET /api/receipts ============

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ReceiptsQuery {
    vendor: Option<String>,
    category: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    receipt_id: Option<i64>,
}

fn parse_day(value: &str, field: &str) -> Result<NaiveDate, AppError> {
    value
        .parse()
        .map_err(|_| validation(format!("{} must be YYYY-MM-DD, got '{}'", field, value)))
}

async fn handle_receipts(
    State(state): State<AppState>,
    Query(params): Query<ReceiptsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(id) = params.receipt_id {
        let receipt = state
            .store
            .get(id)
            .await
            .map_err(|e| store_failure(e.to_string()))?
            .ok_or_else(|| not_found(format!("receipt {} not found", id)))?;
        let value = serde_json::to_value(ReceiptDto::from(&receipt))
            .map_err(|e| internal(e.to_string()))?;
        return Ok(Json(value));
    }

    let mut filter = ListFilter {
        vendor_norm: params
            .vendor
            .as_deref()
            .map(crate::audit::normalize_vendor),
        category: params.category.clone(),
        ..Default::default()
    };
    if let Some(start) = &params.start_date {
        filter.day_from = Some(parse_day(start, "startDate")?);
    }
    if let Some(end) = &params.end_date {
        filter.day_to = Some(parse_day(end, "endDate")?);
    }

    let receipts = state
        .store
        .list(&filter)
        .await
        .map_err(|e| store_failure(e.to_string()))?;
    let dtos: Vec<ReceiptDto> = receipts.iter().map(ReceiptDto::from).collect();

    Ok(Json(serde_json::json!({
        "count": dtos.len(),
        "receipts": dtos,
    })))
}

// ============ POST /api/ingest ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    id: i64,
    audit_flags: AuditFlagsDto,
    indexed: bool,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(draft): Json<ReceiptDraft>,
) -> Result<Json<IngestResponse>, AppError> {
    let outcome = state.ingestor.ingest(draft).await?;
    Ok(Json(IngestResponse {
        id: outcome.id,
        audit_flags: outcome.flags.into(),
        indexed: outcome.indexed,
    }))
}

async fn handle_update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<ReceiptDraft>,
) -> Result<Json<IngestResponse>, AppError> {
    let outcome = state.ingestor.update(id, draft).await?;
    Ok(Json(IngestResponse {
        id: outcome.id,
        audit_flags: outcome.flags.into(),
        indexed: outcome.indexed,
    }))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.ingestor.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ POST /api/extract ============

#[derive(Deserialize)]
struct ExtractRequest {
    /// Base64-encoded image bytes.
    image: String,
    #[serde(default = "default_mime")]
    mime: String,
}

fn default_mime() -> String {
    "image/jpeg".to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractResponse {
    receipt: ReceiptDraft,
    confidence: Confidence,
    raw_text: String,
}

async fn handle_extract(
    State(state): State<AppState>,
    Json(req): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.image.as_bytes())
        .map_err(|e| validation(format!("image is not valid base64: {}", e)))?;

    let extraction = extract_receipt(&state.completion, &bytes, &req.mime).await?;
    Ok(Json(ExtractResponse {
        receipt: extraction.draft,
        confidence: extraction.confidence,
        raw_text: extraction.raw,
    }))
}

// ============ POST /api/extract/upload ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractUploadResponse {
    id: i64,
    audit_flags: AuditFlagsDto,
    confidence: Confidence,
    image_url: String,
}

async fn handle_extract_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExtractUploadResponse>, AppError> {
    let mut bytes: Option<Vec<u8>> = None;
    let mut mime = default_mime();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| validation(e.to_string()))?
    {
        if field.name() == Some("file") {
            if let Some(ct) = field.content_type() {
                mime = ct.to_string();
            }
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| validation(e.to_string()))?
                    .to_vec(),
            );
        }
    }

    let bytes = bytes.ok_or_else(|| validation("multipart field 'file' is required"))?;
    let extraction = extract_receipt(&state.completion, &bytes, &mime).await?;

    let image_url = save_image(&state, &bytes, &mime).map_err(|e| internal(e.to_string()))?;

    let mut draft = extraction.draft;
    draft.image_ref = Some(image_url.clone());
    // A partial extraction may lack the date; the upload is stamped now.
    if draft.date.is_none() {
        draft.date = Some(Utc::now().to_rfc3339());
    }

    let outcome = state.ingestor.ingest(draft).await?;
    Ok(Json(ExtractUploadResponse {
        id: outcome.id,
        audit_flags: outcome.flags.into(),
        confidence: extraction.confidence,
        image_url,
    }))
}

fn save_image(state: &AppState, bytes: &[u8], mime: &str) -> anyhow::Result<String> {
    let ext = match mime {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    };
    let name = format!("{}.{}", &crate::extract::checksum(bytes)[..16], ext);
    let dir = &state.config.images.dir;
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(&name), bytes)?;
    Ok(format!("/api/images/{}", name))
}

// ============ GET /api/audit ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditFinding {
    receipt_id: i64,
    vendor: String,
    date: String,
    total: f64,
    reason: String,
}

fn finding(r: &Receipt, reason: &str) -> AuditFinding {
    AuditFinding {
        receipt_id: r.id,
        vendor: r.vendor.clone(),
        date: r.day.to_string(),
        total: cents_to_f64(r.total_cents),
        reason: reason.to_string(),
    }
}

async fn handle_audit(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let flagged = state
        .store
        .list(&ListFilter {
            flagged_only: true,
            ..Default::default()
        })
        .await
        .map_err(|e| store_failure(e.to_string()))?;

    let mut duplicates = Vec::new();
    let mut mismatches = Vec::new();
    let mut missing_vat = Vec::new();
    let mut suspicious = Vec::new();

    for r in &flagged {
        if r.flags.duplicate {
            duplicates.push(finding(r, "Duplicate receipt detected"));
        }
        if r.flags.math_error {
            mismatches.push(finding(r, "Line items do not reconcile with the total"));
        }
        if r.flags.missing_vat {
            missing_vat.push(finding(r, "Missing VAT"));
        }
        if r.flags.suspicious {
            suspicious.push(finding(r, "Watchlist items detected"));
        }
    }

    Ok(Json(serde_json::json!({
        "duplicates": duplicates,
        "mismatches": mismatches,
        "missingVAT": missing_vat,
        "suspicious": suspicious,
        "summary": {
            "totalDuplicates": duplicates.len(),
            "totalMismatches": mismatches.len(),
            "totalMissingVAT": missing_vat.len(),
            "totalSuspicious": suspicious.len(),
        },
    })))
}

// ============ GET /api/analytics/* ============

async fn handle_summary(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let summary = state
        .store
        .summary()
        .await
        .map_err(|e| store_failure(e.to_string()))?;
    let monthly = state
        .store
        .monthly_totals()
        .await
        .map_err(|e| store_failure(e.to_string()))?;
    let categories = state
        .store
        .category_totals()
        .await
        .map_err(|e| store_failure(e.to_string()))?;
    let vendors = state
        .store
        .vendor_totals()
        .await
        .map_err(|e| store_failure(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "total": cents_to_f64(summary.total_cents),
        "count": summary.count,
        "vatTotal": cents_to_f64(summary.vat_cents),
        "average": cents_to_f64(summary.average_cents),
        "monthly": monthly
            .iter()
            .map(|m| serde_json::json!({"month": m.month, "total": cents_to_f64(m.total_cents)}))
            .collect::<Vec<_>>(),
        "categories": categories
            .iter()
            .map(|c| serde_json::json!({"category": c.name, "total": cents_to_f64(c.total_cents)}))
            .collect::<Vec<_>>(),
        "vendors": vendors
            .iter()
            .map(|v| serde_json::json!({"vendor": v.name, "total": cents_to_f64(v.total_cents)}))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_monthly(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let monthly = state
        .store
        .monthly_totals()
        .await
        .map_err(|e| store_failure(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "monthlyTotals": monthly
            .iter()
            .map(|m| serde_json::json!({"month": m.month, "total": cents_to_f64(m.total_cents)}))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_categories(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let categories = state
        .store
        .category_totals()
        .await
        .map_err(|e| store_failure(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "categoryTotals": categories
            .iter()
            .map(|c| serde_json::json!({"category": c.name, "total": cents_to_f64(c.total_cents)}))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_vendors(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let vendors = state
        .store
        .vendor_totals()
        .await
        .map_err(|e| store_failure(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "vendorTotals": vendors
            .iter()
            .map(|v| serde_json::json!({"vendor": v.name, "total": cents_to_f64(v.total_cents)}))
            .collect::<Vec<_>>(),
    })))
}

// ============ POST /api/chat/query ============

#[derive(Deserialize)]
struct ChatQueryRequest {
    query: String,
}

async fn handle_chat_query(
    State(state): State<AppState>,
    Json(req): Json<ChatQueryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.query.trim().is_empty() {
        return Err(validation("query must not be empty"));
    }

    let answer = state
        .planner
        .answer(&req.query)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "answer": answer.answer,
        "intent": answer.intent.as_str(),
        "totalAmount": answer.total_cents.map(cents_to_f64),
        "count": answer.count,
        "receiptIds": answer.receipt_ids,
        "receipts": answer.receipts.iter().map(ReceiptDto::from).collect::<Vec<_>>(),
    })))
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.message.trim().is_empty() {
        return Err(validation("message must not be empty"));
    }

    let reply = state
        .planner
        .chat(&req.message, &req.history)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "response": reply.response,
        "sourcesUsed": reply.sources_used,
    })))
}
