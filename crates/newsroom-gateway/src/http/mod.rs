//! JSON HTTP surface over the scheduler handle.

pub mod health;
pub mod jobs;
pub mod status;

use axum::{http::StatusCode, Json};
use newsroom_scheduler::SchedulerError;
use serde_json::{json, Value};
use tracing::error;

/// Error half of every API handler's return type.
pub type ApiError = (StatusCode, Json<Value>);

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Map a scheduler error to `{ "error", "code" }` with a fitting status.
pub fn api_error(e: SchedulerError) -> ApiError {
    let status = match &e {
        SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::JobRunning { .. } => StatusCode::CONFLICT,
        SchedulerError::Database(_)
        | SchedulerError::Serialization(_)
        | SchedulerError::LockPoisoned(_) => {
            error!(error = %e, "scheduler request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string(), "code": e.code() })))
}
