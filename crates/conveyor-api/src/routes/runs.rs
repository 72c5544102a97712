//! Run endpoints: manual triggers, history, the active run and cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;
use conveyor_core::ResourceId;
use conveyor_core::pipeline::{RunState, Trigger};
use conveyor_scheduler::queue::{ActiveRun, PendingRun};
use conveyor_scheduler::{RunReport, SubmitOutcome};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs).post(trigger_run))
        .route("/current", get(current_run))
        .route("/cancel", post(cancel_run))
        .route("/{run_id}", get(get_run))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRunRequest {
    revision: Option<String>,
    branch: Option<String>,
}

async fn trigger_run(
    State(state): State<AppState>,
    body: Option<Json<TriggerRunRequest>>,
) -> (StatusCode, Json<SubmitOutcome>) {
    let Json(req) = body.unwrap_or_default();
    let branch = req
        .branch
        .unwrap_or_else(|| state.pipeline().source.branch.clone());
    info!(revision = ?req.revision, branch = %branch, "Manual trigger");

    let outcome = state.queue.submit(Trigger::manual(req.revision, Some(branch)));
    (StatusCode::ACCEPTED, Json(outcome))
}

async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunReport>> {
    Json(state.queue.history())
}

#[derive(Debug, Serialize)]
struct CurrentRunResponse {
    active: Option<ActiveRun>,
    pending: Option<PendingRun>,
    /// Live state of the active run.
    state: Option<RunState>,
}

async fn current_run(State(state): State<AppState>) -> Json<CurrentRunResponse> {
    let active = state.queue.current();
    let run_state = active
        .as_ref()
        .and_then(|run| state.events().state(&run.run_id));
    Json(CurrentRunResponse {
        active,
        pending: state.queue.pending(),
        state: run_state,
    })
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunReport>, ApiError> {
    let run_id: ResourceId = run_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid run id: {}", run_id)))?;
    state
        .queue
        .get(&run_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("run {}", run_id)))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: ResourceId,
}

async fn cancel_run(State(state): State<AppState>) -> Result<Json<CancelResponse>, ApiError> {
    state
        .queue
        .cancel_active()
        .map(|run_id| Json(CancelResponse { run_id }))
        .ok_or_else(|| ApiError::NotFound("no active run".to_string()))
}

#[cfg(test)]
mod tests {
    use crate::routes::router;
    use crate::routes::test_support::{json, state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use conveyor_core::ResourceId;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_manual_trigger_defaults_to_tracked_branch() {
        let state = state();
        let response = router(state.clone())
            .oneshot(
                Request::post("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"revision": "abc1234"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json(response).await;
        assert_eq!(body["outcome"], "queued");

        let pending = state.queue.pending().unwrap();
        assert_eq!(pending.run_id.to_string(), body["run_id"].as_str().unwrap());
        assert_eq!(pending.trigger.branch.as_deref(), Some("main"));
        assert_eq!(pending.trigger.revision.as_deref(), Some("abc1234"));
    }

    #[tokio::test]
    async fn test_manual_trigger_without_body() {
        let state = state();
        let response = router(state.clone())
            .oneshot(Request::post("/api/v1/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(state.queue.pending().unwrap().trigger.revision.is_none());
    }

    #[tokio::test]
    async fn test_current_run_reports_active_and_pending() {
        let state = state();
        state
            .queue
            .submit(conveyor_core::pipeline::Trigger::push("aaa1111", "main", None));
        let active = state.queue.claim().unwrap();
        state
            .queue
            .submit(conveyor_core::pipeline::Trigger::push("bbb2222", "main", None));

        let response = router(state.clone())
            .oneshot(Request::get("/api/v1/runs/current").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["active"]["run_id"], active.run_id.to_string());
        assert_eq!(body["pending"]["trigger"]["revision"], "bbb2222");
    }

    #[tokio::test]
    async fn test_cancel_without_active_run() {
        let response = router(state())
            .oneshot(Request::post("/api/v1/runs/cancel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_active_run() {
        let state = state();
        state
            .queue
            .submit(conveyor_core::pipeline::Trigger::push("aaa1111", "main", None));
        let active = state.queue.claim().unwrap();

        let response = router(state.clone())
            .oneshot(Request::post("/api/v1/runs/cancel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(active.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let app = router(state());
        let uri = format!("/api/v1/runs/{}", ResourceId::new());
        let response = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/api/v1/runs/not-an-id").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_starts_empty() {
        let response = router(state())
            .oneshot(Request::get("/api/v1/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json(response).await, serde_json::json!([]));
    }
}
