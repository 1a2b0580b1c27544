//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/files[/{path}]` | Upload one file (multipart field `file`) |
//! | `GET`  | `/files[/{path}]` | List a directory or download a file |
//! | `GET`  | `/pipelines` | Pipeline names and metadata |
//! | `POST` | `/pipelines/warmup` | Warm up every pipeline |
//! | `POST` | `/pipelines/{name}/warmup` | Warm up one pipeline |
//! | `POST` | `/pipelines/{name}/run` | Run a pipeline |
//! | `POST` | `/pipelines/{name}/ingest` | Run a pipeline over uploaded files (multipart field `files`) |
//! | `GET`  | `/ready` | `true` once requests are accepted |
//! | `GET`  | `/health` | Status and version |
//!
//! # Error Contract
//!
//! Every error response carries the same envelope:
//!
//! ```json
//! { "errors": ["Pipeline named 'qa' not found. Available pipelines: indexing"] }
//! ```
//!
//! Status codes: 400 malformed request or path escape, 404 unknown
//! file/pipeline/node or route, 405 wrong method, 409 upload conflict,
//! 413 body over the upload limit, 500 pipeline or I/O failure. Extractor
//! rejections keep their status and use the envelope too.

use axum::{
    body::{Body, Bytes},
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{BytesRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::run_pipeline;
use crate::error::ServeError;
use crate::files::{FileStore, Listing};
use crate::ingest::{self, StagedFile};
use crate::pipeline::RunRequest;
use crate::registry::{LazyRegistry, WarmUpReport};

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub files: Arc<FileStore>,
    pub pipelines: Arc<LazyRegistry>,
}

impl AppState {
    pub fn new(files: FileStore, pipelines: LazyRegistry) -> Self {
        Self {
            files: Arc::new(files),
            pipelines: Arc::new(pipelines),
        }
    }
}

/// Build the application router.
pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/files", get(handle_list_root).post(handle_upload_root))
        .route("/files/", get(handle_list_root).post(handle_upload_root))
        .route("/files/{*path}", get(handle_list_path).post(handle_upload_path))
        .route("/pipelines", get(handle_list_pipelines))
        .route("/pipelines/warmup", post(handle_warm_up_all))
        .route("/pipelines/{name}/warmup", post(handle_warm_up))
        .route("/pipelines/{name}/run", post(handle_run))
        .route("/pipelines/{name}/ingest", post(handle_ingest))
        .route("/ready", get(handle_ready))
        .route("/health", get(handle_health))
        .fallback(handle_unmatched)
        .method_not_allowed_fallback(handle_method_not_allowed)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the server and run until Ctrl-C.
///
/// With `pipelines.eager_load` the registry is loaded before the listener
/// is bound, so a broken definitions file fails startup instead of the
/// first request.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let files = FileStore::open(&config.files.root).map_err(|e| {
        anyhow::anyhow!(
            "Failed to open storage root {}: {}",
            config.files.root.display(),
            e
        )
    })?;
    let pipelines = LazyRegistry::new(config.pipelines.definitions.clone());

    if config.pipelines.eager_load || config.pipelines.warm_up_on_start {
        let registry = pipelines.get().await?;
        info!(pipelines = ?registry.names(), "pipeline registry ready");

        if config.pipelines.warm_up_on_start {
            let failed = registry
                .warm_up_all()
                .await
                .into_iter()
                .filter(|r| r.error.is_some())
                .count();
            if failed > 0 {
                warn!(failed, "some pipelines failed to warm up");
            }
        }
    }

    let state = AppState::new(files, pipelines);
    let app = build_router(state, config.files.max_upload_bytes());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(
        bind = %config.server.bind,
        root = %config.files.root.display(),
        "listening on http://{}",
        config.server.bind
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    errors: Vec<String>,
}

/// Error type that converts into an HTTP response with the error envelope.
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            errors: vec![self.message],
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ServeError> for AppError {
    fn from(err: ServeError) -> Self {
        let status = match &err {
            ServeError::PathEscape(_) | ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::Conflict => StatusCode::CONFLICT,
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::Execution { .. } | ServeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

macro_rules! from_rejection {
    ($($rejection:ty),+ $(,)?) => {
        $(
            impl From<$rejection> for AppError {
                fn from(rejection: $rejection) -> Self {
                    AppError {
                        status: rejection.status(),
                        message: rejection.body_text(),
                    }
                }
            }
        )+
    };
}

from_rejection!(
    PathRejection,
    QueryRejection,
    BytesRejection,
    MultipartRejection,
    MultipartError,
);

async fn handle_unmatched(method: Method, uri: Uri) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: format!("No route for {} {}", method, uri.path()),
    }
}

async fn handle_method_not_allowed(method: Method, uri: Uri) -> AppError {
    AppError {
        status: StatusCode::METHOD_NOT_ALLOWED,
        message: format!("Method {} is not allowed for {}", method, uri.path()),
    }
}

// ============ /files ============

async fn handle_list_root(State(state): State<AppState>) -> Result<Response, AppError> {
    list_files(&state, None).await
}

async fn handle_list_path(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Response, AppError> {
    let Path(path) = path?;
    list_files(&state, Some(&path)).await
}

async fn list_files(state: &AppState, path: Option<&str>) -> Result<Response, AppError> {
    match state.files.list(path).await? {
        Listing::Directory(entries) => Ok(Json(entries).into_response()),
        Listing::File(download) => {
            let body = Body::from_stream(ReaderStream::new(download.file));
            Ok((
                [
                    (header::CONTENT_TYPE, download.content_type),
                    (header::CONTENT_LENGTH, download.len.to_string()),
                ],
                body,
            )
                .into_response())
        }
    }
}

async fn handle_upload_root(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, AppError> {
    store_upload(&state, None, multipart).await
}

async fn handle_upload_path(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, AppError> {
    let Path(path) = path?;
    store_upload(&state, Some(path), multipart).await
}

/// Store the first `file` field of the multipart body.
async fn store_upload(
    state: &AppState,
    path: Option<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, AppError> {
    let mut multipart = multipart?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let stored = state
            .files
            .upload(path.as_deref(), filename.as_deref(), field)
            .await?;
        info!(path = %stored.display(), "file uploaded");
        return Ok(StatusCode::OK);
    }

    Err(bad_request("Multipart body must contain a 'file' field."))
}

// ============ /pipelines ============

async fn handle_list_pipelines(
    State(state): State<AppState>,
) -> Result<Json<Map<String, Value>>, AppError> {
    let registry = state.pipelines.get().await?;
    Ok(Json(registry.list()))
}

async fn handle_warm_up_all(
    State(state): State<AppState>,
) -> Result<Json<Vec<WarmUpReport>>, AppError> {
    let registry = state.pipelines.get().await?;
    Ok(Json(registry.warm_up_all().await))
}

async fn handle_warm_up(
    State(state): State<AppState>,
    name: Result<Path<String>, PathRejection>,
) -> Result<Json<WarmUpReport>, AppError> {
    let Path(name) = name?;
    let registry = state.pipelines.get().await?;
    Ok(Json(registry.warm_up(&name).await?))
}

#[derive(Debug, Deserialize)]
struct RunQuery {
    debug: Option<bool>,
}

/// Run a pipeline. The body is optional; `?debug=true` also sets the flag.
async fn handle_run(
    State(state): State<AppState>,
    name: Result<Path<String>, PathRejection>,
    query: Result<Query<RunQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, AppError> {
    let Path(name) = name?;
    let Query(query) = query?;
    let body = body?;

    let mut request: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| bad_request(format!("Invalid run request body: {}", e)))?
    };
    if query.debug == Some(true) {
        request.debug = true;
    }

    let registry = state.pipelines.get().await?;
    let result = run_pipeline(registry, &name, request).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct IngestQuery {
    #[serde(default)]
    keep_files: bool,
}

/// Store every `files` field under a unique name, run the pipeline over
/// them, and delete them afterwards unless `?keep_files=true`.
async fn handle_ingest(
    State(state): State<AppState>,
    name: Result<Path<String>, PathRejection>,
    query: Result<Query<IngestQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, AppError> {
    let Path(name) = name?;
    let Query(query) = query?;
    let mut multipart = multipart?;

    let registry = state.pipelines.get().await?;
    registry.get(&name)?;

    let mut staged = Vec::new();
    if let Err(err) = stage_files(&state.files, &mut multipart, &mut staged).await {
        ingest::discard(&state.files, &staged).await;
        return Err(err);
    }

    let result = ingest::ingest(&state.files, registry, &name, staged, query.keep_files).await?;
    Ok(Json(result))
}

async fn stage_files(
    files: &FileStore,
    multipart: &mut Multipart,
    staged: &mut Vec<StagedFile>,
) -> Result<(), AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("files") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        staged.push(ingest::stage(files, filename.as_deref(), field).await?);
    }
    Ok(())
}

// ============ /ready, /health ============

async fn handle_ready() -> Json<bool> {
    Json(true)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
