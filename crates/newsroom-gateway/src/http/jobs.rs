use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use newsroom_scheduler::{EnqueueResult, ExecutionRecord, Job, NewJob};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{api_error, ApiError, ApiResult};
use crate::app::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

/// GET /api/jobs
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Job>> {
    state.scheduler.list_jobs().map(Json).map_err(api_error)
}

/// POST /api/jobs — validate and store a new job. Malformed bodies are 400s
/// with the same error shape as validation failures.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewJob>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let Json(new) = body.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.body_text(), "code": "VALIDATION_ERROR" })),
        )
    })?;
    let job = state.scheduler.create_job(new).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Job> {
    state.scheduler.get_job(&id).map(Json).map_err(api_error)
}

/// DELETE /api/jobs/{id} — cascades to the job's execution history.
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.scheduler.delete_job(&id).map_err(api_error)?;
    Ok(Json(json!({ "deleted": id })))
}

/// POST /api/jobs/{id}/enable
pub async fn enable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Job> {
    state.scheduler.set_enabled(&id, true).map(Json).map_err(api_error)
}

/// POST /api/jobs/{id}/disable
pub async fn disable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Job> {
    state.scheduler.set_enabled(&id, false).map(Json).map_err(api_error)
}

/// POST /api/jobs/{id}/run — queue a manual run ahead of scheduled work.
///
/// 202 when the job is (or already was) queued, 409 when it is running now.
pub async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let result = state.scheduler.run_now(&id).map_err(api_error)?;
    info!(job_id = %id, ?result, "manual run via API");
    if result == EnqueueResult::AlreadyRunning {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("Job is currently running: {id}"),
                "code": "JOB_RUNNING",
            })),
        ));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": id, "result": result })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

/// GET /api/jobs/{id}/executions?limit=N — newest first.
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<ExecutionRecord>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    state
        .scheduler
        .executions(&id, limit)
        .map(Json)
        .map_err(api_error)
}
