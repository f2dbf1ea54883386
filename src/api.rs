//! HTTP surface for the domain service.
//!
//! The router is a thin layer over [`DomainApi`]:
//!
//! - `GET /health` – Liveness probe.
//! - `GET /metrics` – Ingestion and query counters.
//! - `GET /domains`, `POST /domains` – List or create domains.
//! - `GET /domains/:name`, `DELETE /domains/:name` – Inspect or irreversibly delete a domain.
//! - `POST /domains/:name/upload` – Multipart PDF upload followed by ingestion.
//! - `GET /domains/:name/documents` – Indexed documents with per-file chunk counts.
//! - `DELETE /domains/:name/documents/:filename` – Remove one document.
//! - `POST /domains/:name/query` – Ask one domain; `streaming: true` answers with SSE.
//! - `POST /domains/query` – Ask several domains; same streaming switch.
//!
//! Streaming answers are `data:` frames carrying `{"type":"token"}`, one `{"type":"sources"}`,
//! an optional `{"type":"error"}`, and a terminal `[DONE]`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderName, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domains::{
    DocumentInfo, DocumentReport, DomainApi, DomainError, DomainInfo, QueryEvent,
    QueryEventStream, SourceDocument,
};

const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;
const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Build the HTTP router exposing the domain API surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: DomainApi + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics::<S>))
        .route("/domains", get(list_domains::<S>).post(create_domain::<S>))
        .route("/domains/query", post(query_domains::<S>))
        .route(
            "/domains/:name",
            get(get_domain::<S>).delete(delete_domain::<S>),
        )
        .route(
            "/domains/:name/upload",
            post(upload_documents::<S>).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/domains/:name/documents", get(list_documents::<S>))
        .route(
            "/domains/:name/documents/:filename",
            axum::routing::delete(delete_document::<S>),
        )
        .route("/domains/:name/query", post(query_domain::<S>))
        .with_state(service)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<crate::metrics::MetricsSnapshot>
where
    S: DomainApi,
{
    Json(service.metrics_snapshot())
}

async fn list_domains<S>(
    State(service): State<Arc<S>>,
) -> Result<Json<Vec<DomainInfo>>, AppError>
where
    S: DomainApi,
{
    Ok(Json(service.list_domains().await?))
}

/// Request body for `POST /domains`.
#[derive(Deserialize)]
struct CreateDomainRequest {
    /// Domain slug; trimmed and lowercased before validation.
    name: String,
    #[serde(default)]
    description: String,
}

async fn create_domain<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<CreateDomainRequest>,
) -> Result<(StatusCode, Json<DomainInfo>), AppError>
where
    S: DomainApi,
{
    let info = service
        .create_domain(&request.name, &request.description)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn get_domain<S>(
    State(service): State<Arc<S>>,
    Path(name): Path<String>,
) -> Result<Json<DomainInfo>, AppError>
where
    S: DomainApi,
{
    Ok(Json(service.get_domain(&name).await?))
}

async fn delete_domain<S>(
    State(service): State<Arc<S>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError>
where
    S: DomainApi,
{
    service.delete_domain(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Success response for `POST /domains/:name/upload`.
#[derive(Serialize)]
struct UploadResponse {
    /// Files received.
    uploaded: usize,
    /// Chunks written across every file.
    ingested: usize,
    /// Received filenames, in upload order.
    filenames: Vec<String>,
    /// Per-file ingestion detail.
    documents: Vec<DocumentReport>,
}

/// Accept one or more PDFs (any multipart field carrying a file) and ingest them.
async fn upload_documents<S>(
    State(service): State<Arc<S>>,
    Path(name): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError>
where
    S: DomainApi,
{
    let mut documents = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| AppError::BadRequest(error.body_text()))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let is_pdf = filename.to_lowercase().ends_with(".pdf")
            || field.content_type() == Some(PDF_CONTENT_TYPE);
        if !is_pdf {
            return Err(AppError::BadRequest(format!(
                "File '{filename}' is not a PDF"
            )));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|error| AppError::BadRequest(error.body_text()))?;
        documents.push(SourceDocument {
            filename,
            bytes: bytes.to_vec(),
        });
    }
    if documents.is_empty() {
        return Err(AppError::BadRequest("No files were uploaded".into()));
    }

    let filenames: Vec<String> = documents.iter().map(|doc| doc.filename.clone()).collect();
    let report = service.ingest(&name, documents).await?;
    tracing::info!(
        domain = %name,
        files = filenames.len(),
        chunks = report.chunks_written,
        "Upload request completed"
    );
    Ok(Json(UploadResponse {
        uploaded: filenames.len(),
        ingested: report.chunks_written,
        filenames,
        documents: report.documents,
    }))
}

async fn list_documents<S>(
    State(service): State<Arc<S>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<DocumentInfo>>, AppError>
where
    S: DomainApi,
{
    Ok(Json(service.list_documents(&name).await?))
}

async fn delete_document<S>(
    State(service): State<Arc<S>>,
    Path((name, filename)): Path<(String, String)>,
) -> Result<StatusCode, AppError>
where
    S: DomainApi,
{
    service.delete_document(&name, &filename).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request body for `POST /domains/:name/query`.
#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    streaming: bool,
}

async fn query_domain<S>(
    State(service): State<Arc<S>>,
    Path(name): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, AppError>
where
    S: DomainApi,
{
    if request.streaming {
        let events = service.query_stream(&name, &request.question).await?;
        Ok(sse_response(events))
    } else {
        let answer = service.query(&name, &request.question).await?;
        Ok(Json(answer).into_response())
    }
}

/// Request body for `POST /domains/query`.
#[derive(Deserialize)]
struct MultiQueryRequest {
    question: String,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    streaming: bool,
}

async fn query_domains<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<MultiQueryRequest>,
) -> Result<Response, AppError>
where
    S: DomainApi,
{
    if request.streaming {
        let events = service
            .query_domains_stream(&request.domains, &request.question)
            .await?;
        Ok(sse_response(events))
    } else {
        let answer = service
            .query_domains(&request.domains, &request.question)
            .await?;
        Ok(Json(answer).into_response())
    }
}

fn sse_response(events: QueryEventStream) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(sse_frames(events)),
    )
        .into_response()
}

fn sse_frames(events: QueryEventStream) -> impl Stream<Item = Result<Event, Infallible>> {
    events.map(|event| {
        let data = match event {
            QueryEvent::Token(text) => json!({ "type": "token", "text": text }).to_string(),
            QueryEvent::Sources(sources) => {
                json!({ "type": "sources", "sources": sources }).to_string()
            }
            QueryEvent::Error(message) => {
                json!({ "type": "error", "message": message }).to_string()
            }
            QueryEvent::Done => "[DONE]".to_string(),
        };
        Ok(Event::default().data(data))
    })
}

enum AppError {
    Domain(DomainError),
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Self::Domain(error) => {
                let status = match &error {
                    DomainError::InvalidName(_)
                    | DomainError::EmptyDomainList
                    | DomainError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
                    DomainError::NotFound(_) | DomainError::DocumentNotFound { .. } => {
                        StatusCode::NOT_FOUND
                    }
                    DomainError::AlreadyExists(_) => StatusCode::CONFLICT,
                    _ => {
                        tracing::error!(error = %error, "Request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, error.to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<DomainError> for AppError {
    fn from(inner: DomainError) -> Self {
        Self::Domain(inner)
    }
}
