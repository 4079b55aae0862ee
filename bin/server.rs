// 🌐 Ledger Forensics - REST API Server
// Ingestion, review actions, corrections, knowledge graph, and learning
// status over Axum. Build with --features server.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use ledger_forensics::pipeline::ForensicPipeline;
use ledger_forensics::{PipelineConfig, VERSION};

/// Shared application state
#[derive(Clone)]
struct AppState {
    pipeline: Arc<ForensicPipeline>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

fn ok<T: Serialize>(data: T) -> axum::response::Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn fail(status: StatusCode, error: impl Into<String>) -> axum::response::Response {
    (status, Json(ApiResponse::<()>::err(error))).into_response()
}

/// Transition refusals surface as 409, everything else as 500
fn pipeline_error(e: anyhow::Error) -> axum::response::Response {
    let message = e.to_string();
    let chain = format!("{:#}", e);
    if message.contains("not found") {
        fail(StatusCode::NOT_FOUND, message)
    } else if chain.contains("cannot move") || chain.contains("cannot reanalyze") {
        fail(StatusCode::CONFLICT, chain)
    } else {
        eprintln!("pipeline error: {:#}", e);
        fail(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

// ============================================================================
// Request Bodies
// ============================================================================

#[derive(Deserialize)]
struct SubmitDocumentRequest {
    filename: String,
    /// Document bytes, base64-encoded
    content_base64: String,
    batch_id: Option<String>,
}

#[derive(Deserialize)]
struct ReviewActionRequest {
    reviewer: String,
}

#[derive(Deserialize)]
struct CorrectionRequest {
    field_name: String,
    original_value: String,
    corrected_value: String,
    corrected_by: String,
}

#[derive(Serialize)]
struct CorrectionResponse {
    recorded: bool,
    learning_triggered: bool,
}

#[derive(Serialize)]
struct BulkItemResult {
    filename: String,
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(format!("ledger-forensics {}", VERSION)))
}

/// POST /api/documents - Submit a document and process it to a settled status
async fn submit_document(
    State(state): State<AppState>,
    Json(req): Json<SubmitDocumentRequest>,
) -> impl IntoResponse {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(&req.content_base64) {
        Ok(bytes) => bytes,
        Err(e) => return fail(StatusCode::BAD_REQUEST, format!("invalid base64: {}", e)),
    };

    match state
        .pipeline
        .submit_document(&bytes, &req.filename, req.batch_id.as_deref())
        .await
    {
        Ok(doc) => ok(doc),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/documents/bulk - Submit several documents; one task per file
/// so unrelated documents process in parallel, and one bad file never
/// sinks the rest
async fn submit_documents_bulk(
    State(state): State<AppState>,
    Json(reqs): Json<Vec<SubmitDocumentRequest>>,
) -> impl IntoResponse {
    let mut handles = Vec::with_capacity(reqs.len());
    for req in reqs {
        let pipeline = Arc::clone(&state.pipeline);
        let filename = req.filename.clone();
        let handle = tokio::spawn(async move {
            let bytes =
                match base64::engine::general_purpose::STANDARD.decode(&req.content_base64) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return BulkItemResult {
                            filename: req.filename,
                            accepted: false,
                            document_id: None,
                            status: None,
                            error: Some(format!("invalid base64: {}", e)),
                        }
                    }
                };
            match pipeline
                .submit_document(&bytes, &req.filename, req.batch_id.as_deref())
                .await
            {
                Ok(doc) => BulkItemResult {
                    filename: req.filename,
                    accepted: true,
                    document_id: Some(doc.id),
                    status: Some(doc.status.as_str().to_string()),
                    error: None,
                },
                Err(e) => BulkItemResult {
                    filename: req.filename,
                    accepted: false,
                    document_id: None,
                    status: None,
                    error: Some(e.to_string()),
                },
            }
        });
        handles.push((filename, handle));
    }

    // Results come back in request order regardless of completion order
    let mut results = Vec::with_capacity(handles.len());
    for (filename, handle) in handles {
        match handle.await {
            Ok(item) => results.push(item),
            Err(e) => results.push(BulkItemResult {
                filename,
                accepted: false,
                document_id: None,
                status: None,
                error: Some(format!("ingestion task failed: {}", e)),
            }),
        }
    }
    ok(results)
}

/// GET /api/documents?status=&batch_id=&limit= - List documents
async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    match state.pipeline.list_documents(
        params.get("status").map(String::as_str),
        params.get("batch_id").map(String::as_str),
        limit,
    ) {
        Ok(docs) => ok(docs),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/documents/:id - Full document view with rows, anomalies,
/// corrections and linked entities
async fn get_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> impl IntoResponse {
    match state.pipeline.document_view(&doc_id) {
        Ok(Some(view)) => ok(view),
        Ok(None) => fail(StatusCode::NOT_FOUND, format!("document {} not found", doc_id)),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/documents/:id/approve
async fn approve_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Json(req): Json<ReviewActionRequest>,
) -> impl IntoResponse {
    match state.pipeline.approve(&doc_id, &req.reviewer) {
        Ok(doc) => ok(doc),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/documents/:id/reject
async fn reject_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Json(req): Json<ReviewActionRequest>,
) -> impl IntoResponse {
    match state.pipeline.reject(&doc_id, &req.reviewer) {
        Ok(doc) => ok(doc),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/documents/:id/reanalyze - Re-run the pipeline; prior results
/// are superseded, history and corrections are kept
async fn reanalyze_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Json(req): Json<ReviewActionRequest>,
) -> impl IntoResponse {
    match state.pipeline.reanalyze(&doc_id, &req.reviewer).await {
        Ok(doc) => ok(doc),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/documents/:id/corrections - Record a human correction
async fn submit_correction(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Json(req): Json<CorrectionRequest>,
) -> impl IntoResponse {
    match state.pipeline.record_correction(
        &doc_id,
        &req.field_name,
        &req.original_value,
        &req.corrected_value,
        &req.corrected_by,
    ) {
        Ok(fired) => {
            let triggered = fired.is_some();
            if triggered {
                // External push happens off the request path
                let pipeline = Arc::clone(&state.pipeline);
                tokio::spawn(async move {
                    if let Err(e) = pipeline.sync().await {
                        eprintln!("learned-rule sync failed: {:#}", e);
                    }
                });
            }
            ok(CorrectionResponse {
                recorded: true,
                learning_triggered: triggered,
            })
        }
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/anomalies/:id/resolve
async fn resolve_anomaly(
    State(state): State<AppState>,
    Path(anomaly_id): Path<String>,
    Json(req): Json<ReviewActionRequest>,
) -> impl IntoResponse {
    match state.pipeline.resolve_anomaly(&anomaly_id, &req.reviewer) {
        Ok(true) => ok("resolved"),
        Ok(false) => fail(
            StatusCode::NOT_FOUND,
            format!("anomaly {} not found", anomaly_id),
        ),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/review-queue - Documents awaiting a human decision
async fn review_queue(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);
    match state.pipeline.review_queue(limit) {
        Ok(docs) => ok(docs),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/batches/:id - Per-batch progress
async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> impl IntoResponse {
    match state.pipeline.batch_status(&batch_id) {
        Ok(status) => ok(status),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/graph?document_id= - Knowledge graph projection, one document
/// or the whole corpus
async fn get_graph(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match state
        .pipeline
        .knowledge_graph(params.get("document_id").map(String::as_str))
    {
        Ok(graph) => ok(graph),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/documents/:id/events - Audit trail for a document
async fn get_document_events(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> impl IntoResponse {
    match state.pipeline.document_events(&doc_id) {
        Ok(events) => ok(events),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/entities?q=&limit= - Canonical entity search
async fn search_entities(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let query = params.get("q").map(String::as_str).unwrap_or("");
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);
    match state.pipeline.search_entities(query, limit) {
        Ok(entities) => ok(entities),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/learning/status
async fn learning_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.learning_status() {
        Ok(status) => ok(status),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/learning/trigger - Operator-forced learning cycle
async fn trigger_learning(
    State(state): State<AppState>,
    Json(req): Json<ReviewActionRequest>,
) -> impl IntoResponse {
    match state.pipeline.trigger_learning_manually(&req.reviewer) {
        Ok(event) => ok(event),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/learning/sync - Push learned rules to the external memory
async fn sync_learning(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.sync().await {
        Ok(event) => ok(event),
        Err(e) => pipeline_error(e),
    }
}

/// GET /api/metrics - Pipeline-wide counters plus anomaly breakdown
async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = match state.pipeline.metrics() {
        Ok(m) => m,
        Err(e) => return pipeline_error(e),
    };
    let anomalies = match state.pipeline.anomaly_summary() {
        Ok(s) => s,
        Err(e) => return pipeline_error(e),
    };
    let failures = match state.pipeline.failure_clusters() {
        Ok(f) => f,
        Err(e) => return pipeline_error(e),
    };
    let entity_categories = match state.pipeline.entity_category_counts() {
        Ok(c) => c,
        Err(e) => return pipeline_error(e),
    };
    ok(serde_json::json!({
        "pipeline": metrics,
        "anomalies": anomalies,
        "failure_clusters": failures,
        "entity_categories": entity_categories,
    }))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_forensics=info".into()),
        )
        .init();

    println!("🌐 Ledger Forensics - API Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = PipelineConfig::from_env();
    let db_path = config.db_path.clone();
    let pipeline = ForensicPipeline::new(config).expect("failed to open pipeline database");
    println!("✓ Database opened: {}", db_path);

    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/documents", post(submit_document).get(list_documents))
        .route("/documents/bulk", post(submit_documents_bulk))
        .route("/documents/:id", get(get_document))
        .route("/documents/:id/events", get(get_document_events))
        .route("/documents/:id/approve", post(approve_document))
        .route("/documents/:id/reject", post(reject_document))
        .route("/documents/:id/reanalyze", post(reanalyze_document))
        .route("/documents/:id/corrections", post(submit_correction))
        .route("/anomalies/:id/resolve", post(resolve_anomaly))
        .route("/review-queue", get(review_queue))
        .route("/batches/:id", get(get_batch))
        .route("/entities", get(search_entities))
        .route("/graph", get(get_graph))
        .route("/learning/status", get(learning_status))
        .route("/learning/trigger", post(trigger_learning))
        .route("/learning/sync", post(sync_learning))
        .route("/metrics", get(get_metrics))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("LF_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    println!("\n🚀 Server running on http://{}", addr);
    println!("   Health: http://{}/api/health", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
