//! HTTP surface: worker RPC under `/internal`, client API under `/api/v1`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use super::protocol::{GetTaskRequest, SubmitResultRequest};
use super::{SubmissionService, WorkerGateway};
use crate::error::Error;

/// Header carrying the caller's identity, set by the fronting layer.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<WorkerGateway>,
    pub submissions: Arc<SubmissionService>,
}

/// Build the full router.
pub fn router(gateway: Arc<WorkerGateway>, submissions: Arc<SubmissionService>) -> Router {
    let state = AppState {
        gateway,
        submissions,
    };

    Router::new()
        .route("/health", get(health))
        .route("/internal/task", post(get_task))
        .route("/internal/task/result", post(submit_result))
        .route("/api/v1/calculate", post(calculate))
        .route("/api/v1/expressions", get(list_expressions))
        .route("/api/v1/expressions/{id}", get(get_expression))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map an internal failure to a response; store failures are logged.
fn failure(error: Error) -> Response {
    match error {
        Error::Protocol(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Error::NotFound { .. } => error_response(StatusCode::NOT_FOUND, error.to_string()),
        other => {
            error!(error = %other, "Request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn owner_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "calc-orchestrator"
    }))
}

// ── Worker RPC ──────────────────────────────────────────────────────────

async fn get_task(State(state): State<AppState>, Json(body): Json<GetTaskRequest>) -> Response {
    match state.gateway.get_task(&body).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => failure(e),
    }
}

async fn submit_result(
    State(state): State<AppState>,
    Json(body): Json<SubmitResultRequest>,
) -> Response {
    match state.gateway.submit_result(&body).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            if matches!(e, Error::Protocol(_)) {
                warn!(task_id = body.task_id, agent = %body.agent_id, error = %e, "Rejected submission");
            }
            failure(e)
        }
    }
}

// ── Client API ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CalculateRequest {
    expression: String,
}

async fn calculate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CalculateRequest>,
) -> Response {
    let Some(owner) = owner_id(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing owner id");
    };
    if body.expression.trim().is_empty() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "expression must not be empty");
    }

    match state.submissions.submit(&owner, &body.expression).await {
        Ok(id) => (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response(),
        Err(e) => failure(e),
    }
}

async fn list_expressions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(owner) = owner_id(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing owner id");
    };
    match state.submissions.list_expressions(&owner).await {
        Ok(expressions) => Json(serde_json::json!({ "expressions": expressions })).into_response(),
        Err(e) => failure(e),
    }
}

async fn get_expression(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let Some(owner) = owner_id(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing owner id");
    };
    match state.submissions.get_expression(id, &owner).await {
        Ok(Some(expression)) => Json(serde_json::json!({ "expression": expression })).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "expression not found"),
        Err(e) => failure(e),
    }
}
