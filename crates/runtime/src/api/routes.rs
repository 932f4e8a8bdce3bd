//! HTTP route handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use std::sync::Arc;

use super::server::ApiState;
use super::types::{ErrorResponse, HealthResponse, RunRequest, RunResponse};
use crate::types::PipelineError;

/// Liveness probe.
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Run one pipeline cycle synchronously, with no queue interaction.
pub async fn run_pipeline(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, (StatusCode, Json<ErrorResponse>)> {
    let task = request.into_task();
    if let Err(error) = task.validate() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: error.to_string(),
                code: "INVALID_TASK",
            }),
        ));
    }

    match state.pipeline.run(&task).await {
        Ok(output) => Ok(Json(RunResponse::from(output))),
        Err(error @ PipelineError::InvalidTask(_)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: error.to_string(),
                code: "INVALID_TASK",
            }),
        )),
        Err(error) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: error.to_string(),
                code: "PIPELINE_FAILED",
            }),
        )),
    }
}
