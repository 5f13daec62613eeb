use axum::{
    routing::{get, post},
    Router,
};
use newsroom_core::config::NewsroomConfig;
use newsroom_scheduler::SchedulerHandle;
use std::sync::Arc;

use crate::http::{health, jobs, status};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: NewsroomConfig,
    pub scheduler: SchedulerHandle,
}

impl AppState {
    pub fn new(config: NewsroomConfig, scheduler: SchedulerHandle) -> Self {
        Self { config, scheduler }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/status", get(status::status_handler))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/api/jobs/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/api/jobs/{id}/enable", post(jobs::enable_job))
        .route("/api/jobs/{id}/disable", post(jobs::disable_job))
        .route("/api/jobs/{id}/run", post(jobs::run_job))
        .route("/api/jobs/{id}/executions", get(jobs::list_executions))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use chrono::NaiveDate;
    use newsroom_scheduler::FixedClock;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        let now = NaiveDate::from_ymd_opt(2025, 6, 5)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let scheduler = SchedulerHandle::new(conn, Arc::new(FixedClock::new(now))).unwrap();
        build_router(Arc::new(AppState::new(NewsroomConfig::default(), scheduler)))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn briefing() -> Value {
        json!({
            "name": "Morning briefing",
            "trigger_time": "06:30",
            "source_ref": "tech",
            "volume": 2,
            "model_refs": ["small", "large"],
            "recurrence": "daily"
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router();
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["scheduler"]["pending"], 0);
    }

    #[tokio::test]
    async fn create_then_fetch_job() {
        let app = router();
        let (status, job) = send(&app, Method::POST, "/api/jobs", Some(briefing())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(job["next_run_at"], "2025-06-05T06:30:00");
        assert_eq!(job["trigger_time"], "06:30");

        let id = job["id"].as_str().unwrap();
        let (status, fetched) = send(&app, Method::GET, &format!("/api/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["name"], "Morning briefing");

        let (_, list) = send(&app, Method::GET, "/api/jobs", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_jobs_are_rejected() {
        let app = router();
        let mut bad = briefing();
        bad["volume"] = json!(9);
        let (status, body) = send(&app, Method::POST, "/api/jobs", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let (status, body) =
            send(&app, Method::POST, "/api/jobs", Some(json!({ "name": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let app = router();
        let (status, body) = send(&app, Method::POST, "/api/jobs/nope/run", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn toggle_run_and_status() {
        let app = router();
        let (_, job) = send(&app, Method::POST, "/api/jobs", Some(briefing())).await;
        let id = job["id"].as_str().unwrap().to_string();

        let (status, job) = send(&app, Method::POST, &format!("/api/jobs/{id}/disable"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["enabled"], false);
        assert_eq!(job["next_run_at"], Value::Null);

        let (status, body) = send(&app, Method::POST, &format!("/api/jobs/{id}/run"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["result"], "enqueued");
        let (_, body) = send(&app, Method::POST, &format!("/api/jobs/{id}/run"), None).await;
        assert_eq!(body["result"], "already_queued");

        let (_, status_body) = send(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status_body["queue"][0]["job_id"], id.as_str());
        assert_eq!(status_body["queue"][0]["origin"], "manual");
        assert_eq!(status_body["counts"]["pending"], 1);

        let (status, job) = send(&app, Method::POST, &format!("/api/jobs/{id}/enable"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["enabled"], true);

        let (status, history) =
            send(&app, Method::GET, &format!("/api/jobs/{id}/executions?limit=5"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(history.as_array().unwrap().is_empty());

        let (status, _) = send(&app, Method::DELETE, &format!("/api/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, status_body) = send(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status_body["counts"]["pending"], 0);
    }
}
