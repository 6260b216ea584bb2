//! Inbound HTTP surface: render-service callbacks and a health probe.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bidwatch_sync::{CallbackOutcome, RenderBridge};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub const CRATE_NAME: &str = "bidwatch-web";

/// Largest artifact accepted on the callback endpoint.
pub const MAX_ARTIFACT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    render: Arc<RenderBridge>,
}

impl AppState {
    pub fn new(render: Arc<RenderBridge>) -> Self {
        Self { render }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("BIDWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/callback/{request_id}", post(callback_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` flips to `true`, then finish in-flight requests.
pub async fn serve(
    state: AppState,
    config: WebConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "webhook server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("webhook server stopped");
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    body: Body,
) -> Response {
    // The whole artifact is read before the request id is consumed.
    let bytes = match axum::body::to_bytes(body, MAX_ARTIFACT_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(%request_id, error = %err, "reading callback body failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read body").into_response();
        }
    };

    match state.render.complete(&request_id, bytes.to_vec()).await {
        CallbackOutcome::Accepted => {
            info!(%request_id, bytes = bytes.len(), "callback accepted");
            (StatusCode::OK, "ok").into_response()
        }
        CallbackOutcome::Unknown => (StatusCode::NOT_FOUND, "unknown request id").into_response(),
    }
}
