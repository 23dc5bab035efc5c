//! captioned-gateway: caption orchestrator + HTTP server.
//!
//! Provides:
//! - `POST /captions` (alias `POST /generateMediaCaptions`) running the
//!   orchestrator for one stored object
//! - `GET /health`
//! - Bearer token authentication
//! - Graceful shutdown through a cancellation token

pub mod orchestrator;

#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use captioned_config::{
    CaptionedConfig, GEMINI_API_KEY_ENV, GeminiConfig, StorageBackend, StorageConfig,
};
use captioned_media::gemini::{GeminiProvider, GenerationSettings};
use captioned_media::types::GenerativeService;
use captioned_storage::{FsObjectStore, GcsObjectStore, ObjectStore};
use captioned_types::{CaptionRequest, ErrorBody, ErrorKind, PipelineError};

pub use orchestrator::CaptionOrchestrator;

/// Shared gateway state.
pub struct GatewayState {
    pub orchestrator: Arc<CaptionOrchestrator>,
    pub auth_token: Option<String>,
    /// Parent of every per-request cancellation token.
    pub shutdown: CancellationToken,
}

/// Build the durable store described by the storage section.
pub fn object_store_from_config(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Fs => {
            let root = match &config.root {
                Some(root) => root.clone(),
                None => captioned_config::default_storage_root()?,
            };
            Ok(Arc::new(FsObjectStore::new(
                root,
                config.public_base_url.clone(),
            )))
        }
        StorageBackend::Gcs => {
            let bucket = config
                .bucket
                .clone()
                .context("storage.bucket is required for the gcs backend")?;
            Ok(Arc::new(GcsObjectStore::new(
                bucket,
                config.access_token.clone(),
            )))
        }
    }
}

/// Build the Gemini client described by the gemini section.
pub fn generative_service_from_config(
    config: &GeminiConfig,
) -> anyhow::Result<Arc<dyn GenerativeService>> {
    let api_key = config.api_key.clone().with_context(|| {
        format!("no Gemini API key: set gemini.api_key or {GEMINI_API_KEY_ENV}")
    })?;
    let settings = GenerationSettings {
        model: config.model.clone(),
        temperature: config.temperature,
        top_p: config.top_p,
        top_k: config.top_k,
        max_output_tokens: config.max_output_tokens,
    };
    Ok(Arc::new(
        GeminiProvider::with_settings(api_key, config.base_url.clone(), settings)
            .with_timeout(config.request_timeout()),
    ))
}

/// Start the caption server and run until `shutdown` is cancelled.
pub async fn start_gateway(
    config: CaptionedConfig,
    port_override: Option<u16>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(config.gateway.port);
    let host = config.gateway.host.clone();

    let store = object_store_from_config(&config.storage)?;
    let service = generative_service_from_config(&config.gemini)?;
    info!(
        storage = store.id(),
        service = service.id(),
        "Caption orchestrator configured"
    );

    let orchestrator = Arc::new(CaptionOrchestrator::from_config(
        &config.orchestrator,
        store,
        service,
    ));
    let state = Arc::new(GatewayState {
        orchestrator,
        auth_token: config.gateway.auth_token.clone(),
        shutdown,
    });

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Gateway listening on {addr}");
    info!("  Captions: http://{addr}/captions");
    info!("  Health:   http://{addr}/health");

    serve(listener, state).await?;
    info!("Gateway stopped");
    Ok(())
}

/// Serve on an already bound listener.
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/captions", post(captions_handler))
        .route("/generateMediaCaptions", post(captions_handler))
        .with_state(state)
}

/// GET /health: liveness check.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /captions: generate captions for one stored object.
async fn captions_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<CaptionRequest>, JsonRejection>,
) -> Response {
    if let Some(expected_token) = &state.auth_token {
        match extract_bearer_token(&headers) {
            Some(token) if token == expected_token => {}
            _ => {
                tracing::warn!("Caption request authentication failed");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(&PipelineError::InvalidRequest(rejection.body_text()));
        }
    };

    // Dropped with the connection, which also releases the scratch file.
    let cancel = state.shutdown.child_token();
    match state.orchestrator.process(request, &cancel).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::warn!(kind = ?e.kind(), "Caption request failed: {e}");
            error_response(&e)
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::ObjectNotFound => StatusCode::NOT_FOUND,
        ErrorKind::RemoteSubmitFailed
        | ErrorKind::ProcessingFailed
        | ErrorKind::GenerationFailed
        | ErrorKind::MalformedResponse => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &PipelineError) -> Response {
    (status_for(err.kind()), Json(ErrorBody::from(err))).into_response()
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
