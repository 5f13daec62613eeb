use axum::{extract::State, Json};
use newsroom_scheduler::SchedulerStatus;
use std::sync::Arc;

use super::{api_error, ApiResult};
use crate::app::AppState;

/// GET /api/status — running slot, queue contents and execution counts.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> ApiResult<SchedulerStatus> {
    state.scheduler.status().map(Json).map_err(api_error)
}
