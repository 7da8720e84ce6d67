//! Model-host HTTP API.
//!
//! - POST/GET/DELETE /v1/contexts
//! - GET/DELETE /v1/contexts/{handle}
//! - POST /v1/contexts/{handle}/chat/format
//! - GET /v1/models, POST /v1/models/probe, POST /v1/models/download-path
//! - GET /health, GET /metrics
//!
//! Every call into the service runs on the blocking pool: loads can take
//! seconds and context operations hold a per-context lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};
use uuid::Uuid;

use crate::inference::llama_ffi::ChatMessage;
use crate::loader::tiers::LoadTier;
use crate::registry::ModelHandle;
use crate::server::error::ApiError;
use crate::service::{ArtifactInfo, AvailableModel, ContextInfo, ModelService, ServiceError};

/// Application state shared across handlers.
pub struct AppState {
    pub service: Arc<ModelService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<ModelService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %Uuid::new_v4()
        )
    });

    Router::new()
        .route(
            "/v1/contexts",
            post(create_context).get(list_contexts).delete(release_all),
        )
        .route(
            "/v1/contexts/{handle}",
            get(context_info).delete(release_context),
        )
        .route("/v1/contexts/{handle}/chat/format", post(format_chat))
        .route("/v1/models", get(list_models))
        .route("/v1/models/probe", post(probe_model))
        .route("/v1/models/download-path", post(download_path))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(trace_layer)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateContextRequest {
    pub model_path: PathBuf,
    #[serde(default)]
    pub search_roots: Vec<PathBuf>,
    /// Replaces the configured tier ladder for this load.
    #[serde(default)]
    pub tiers: Option<Vec<LoadTier>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContextList {
    pub contexts: Vec<ContextInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseAllResponse {
    pub released: usize,
}

#[derive(Debug, Deserialize)]
pub struct FormatChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub chat_template: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FormatChatResponse {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    pub model_path: PathBuf,
    #[serde(default)]
    pub search_roots: Vec<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub models: Vec<AvailableModel>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadPathRequest {
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadPathResponse {
    pub path: PathBuf,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub live_contexts: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

fn handle_param(param: Result<Path<u64>, PathRejection>) -> Result<ModelHandle, ApiError> {
    param
        .map(|Path(id)| ModelHandle::new(id))
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

async fn blocking<R, F>(state: &AppState, f: F) -> Result<R, ApiError>
where
    R: Send + 'static,
    F: FnOnce(&ModelService) -> Result<R, ServiceError> + Send + 'static,
{
    let service = Arc::clone(&state.service);
    Ok(tokio::task::spawn_blocking(move || f(&service)).await??)
}

async fn create_context(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateContextRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ContextInfo>), ApiError> {
    let req = body(payload)?;
    info!(model = %req.model_path.display(), roots = req.search_roots.len(), "Create context request");

    let context = blocking(&state, move |service| {
        let handle = service.create_context(&req.model_path, &req.search_roots, req.tiers.as_deref())?;
        service.context_info(handle)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(context)))
}

async fn list_contexts(State(state): State<Arc<AppState>>) -> Result<Json<ContextList>, ApiError> {
    let contexts = blocking(&state, |service| Ok(service.list_contexts())).await?;
    Ok(Json(ContextList { contexts }))
}

async fn release_all(State(state): State<Arc<AppState>>) -> Result<Json<ReleaseAllResponse>, ApiError> {
    let released = blocking(&state, |service| Ok(service.release_all())).await?;
    Ok(Json(ReleaseAllResponse { released }))
}

async fn context_info(
    State(state): State<Arc<AppState>>,
    handle: Result<Path<u64>, PathRejection>,
) -> Result<Json<ContextInfo>, ApiError> {
    let handle = handle_param(handle)?;
    let context = blocking(&state, move |service| service.context_info(handle)).await?;
    Ok(Json(context))
}

async fn release_context(
    State(state): State<Arc<AppState>>,
    handle: Result<Path<u64>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let handle = handle_param(handle)?;
    blocking(&state, move |service| {
        service.release_context(handle);
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn format_chat(
    State(state): State<Arc<AppState>>,
    handle: Result<Path<u64>, PathRejection>,
    payload: Result<Json<FormatChatRequest>, JsonRejection>,
) -> Result<Json<FormatChatResponse>, ApiError> {
    let handle = handle_param(handle)?;
    let req = body(payload)?;
    let messages = serde_json::to_string(&req.messages).map_err(|e| ApiError::Internal(e.to_string()))?;

    let prompt = blocking(&state, move |service| {
        service.format_chat(handle, &messages, &req.chat_template)
    })
    .await?;

    Ok(Json(FormatChatResponse { prompt }))
}

async fn probe_model(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ProbeRequest>, JsonRejection>,
) -> Result<Json<ArtifactInfo>, ApiError> {
    let req = body(payload)?;
    let artifact = blocking(&state, move |service| {
        service.probe_artifact(&req.model_path, &req.search_roots)
    })
    .await?;
    Ok(Json(artifact))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelList>, ApiError> {
    let models = blocking(&state, |service| service.available_models()).await?;
    Ok(Json(ModelList { models }))
}

async fn download_path(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DownloadPathRequest>, JsonRejection>,
) -> Result<Json<DownloadPathResponse>, ApiError> {
    let req = body(payload)?;
    let path = blocking(&state, move |service| service.prepare_download_path(&req.filename)).await?;
    Ok(Json(DownloadPathResponse { path }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        live_contexts: state.service.registry().len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.service.metrics().render(),
    )
}
