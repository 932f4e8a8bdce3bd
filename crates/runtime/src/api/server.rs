//! HTTP server assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::pipeline::Pipeline;
use crate::types::RuntimeError;

/// Shared state for the HTTP facade.
pub struct ApiState {
    pub pipeline: Arc<Pipeline>,
}

/// Build the router: `GET /healthz` and `POST /v1/run`.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(super::routes::healthz))
        .route("/v1/run", post(super::routes::run_pipeline))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<ApiState>, host: &str, port: u16) -> Result<(), RuntimeError> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| RuntimeError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!("API listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| RuntimeError::Internal(format!("server error: {e}")))
}
