// HTTP route handlers for the Arbiter API

use crate::AppState;
use arbiter_common::types::ExecutionKind;
use arbiter_pipeline::{AdhocRequest, AdhocResponse, EvaluateRequest, PipelineError};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pipeline failure rendered as an HTTP response
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::CompileError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        PipelineError::SandboxUnavailable { .. }
        | PipelineError::Persistence { .. }
        | PipelineError::PipelineTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Cancelled(_) | PipelineError::VersionConflict { .. } => StatusCode::CONFLICT,
        PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn outcome_label(e: &PipelineError) -> &'static str {
    match e {
        PipelineError::Validation(_) => "invalid",
        PipelineError::CompileError(_) => "compile-error",
        PipelineError::NotFound(_) => "not-found",
        PipelineError::RateLimited { .. } => "rate-limited",
        PipelineError::SandboxUnavailable { .. } => "sandbox-unavailable",
        PipelineError::Persistence { .. } => "persistence-error",
        PipelineError::PipelineTimeout(_) => "pipeline-timeout",
        PipelineError::Cancelled(_) => "cancelled",
        PipelineError::VersionConflict { .. } => "conflict",
        PipelineError::Internal(_) => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }

        let mut body = json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        if let PipelineError::RateLimited { retry_after_secs, .. } = &self.0 {
            body["retry_after_secs"] = json!(retry_after_secs);
            return (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(body),
            )
                .into_response();
        }
        (status, Json(body)).into_response()
    }
}

/// POST /run-code - Run code against one caller-supplied input
pub async fn run_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AdhocRequest>,
) -> Result<Json<AdhocResponse>, ApiError> {
    let started = Instant::now();
    let result = state.service.run_adhoc(payload).await;

    let response = match result {
        Ok(response) => response,
        // A compile error is a normal answer for an ad-hoc run
        Err(PipelineError::CompileError(diagnostic)) => AdhocResponse {
            stdout: String::new(),
            stderr: diagnostic,
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
            kind: ExecutionKind::CompileError,
        },
        Err(e) => {
            state.metrics.observe("run-code", outcome_label(&e), started.elapsed());
            return Err(e.into());
        }
    };

    let kind = serde_json::to_value(response.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    state.metrics.observe("run-code", &kind, started.elapsed());
    Ok(Json(response))
}

/// POST /run-tests - Evaluate against visible test cases, nothing graded
pub async fn run_tests(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EvaluateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    match state.service.run_tests(payload).await {
        Ok(view) => {
            state.metrics.observe("run-tests", &view.status.to_string(), started.elapsed());
            Ok(Json(view))
        }
        Err(e) => {
            state.metrics.observe("run-tests", outcome_label(&e), started.elapsed());
            Err(e.into())
        }
    }
}

/// POST /submit - Graded submission
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EvaluateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let user_id = payload.user_id.clone();
    let question_id = payload.question_id.clone();

    match state.service.submit(payload).await {
        Ok(response) => {
            info!(
                submission_id = %response.submission_id,
                user_id = %user_id,
                question_id = %question_id,
                score = response.score,
                status = %response.status,
                "Submission graded"
            );
            state.metrics.observe("submit", &response.status.to_string(), started.elapsed());
            Ok(Json(response))
        }
        Err(e) => {
            if e.is_retryable() {
                warn!(
                    user_id = %user_id,
                    question_id = %question_id,
                    error = %e,
                    "Submission failed, client may retry"
                );
            }
            state.metrics.observe("submit", outcome_label(&e), started.elapsed());
            Err(e.into())
        }
    }
}

/// GET /submissions/{id} - Current state of a submission
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.service.submission(id).await?;
    Ok(Json(json!({
        "id": submission.id,
        "user_id": submission.user_id,
        "question_id": submission.question_id,
        "language": submission.language,
        "mode": submission.mode,
        "status": submission.status,
        "version": submission.version,
        "error": submission.error,
        "created_at": submission.created_at,
        "updated_at": submission.updated_at,
    })))
}

/// GET /submissions/{id}/result - Stored graded result, hidden details stripped
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.result(id).await?))
}

/// POST /submissions/{id}/cancel - Cancel an in-flight submission
pub async fn cancel_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.service.cancel(id).await?;
    Ok(Json(json!({
        "id": submission.id,
        "status": submission.status,
        "version": submission.version,
    })))
}

/// GET /health - Liveness plus configured languages
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "languages": state.service.languages().list_languages(),
        "sandbox_slots_available": state.service.available_slots(),
    }))
}

/// GET /metrics - Prometheus exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render(state.service.available_slots()) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
