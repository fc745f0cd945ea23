// Run history HTTP routes
//
// Stored runs are returned compiled: the persisted snapshot, its call tree,
// and the id of the root call so clients can walk the tree from the top.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use threadline_core::{Call, Run, RunInfo};
use utoipa::ToSchema;

use crate::common::{store_error, ApiError, ListResponse};
use crate::AppState;

/// Stored run with its call tree
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunDetail {
    /// Snapshot persisted when the run finished
    #[serde(rename = "runFrame")]
    #[schema(value_type = Object)]
    pub run_frame: RunInfo,

    /// Root call of the tree; empty when the run made no calls
    #[serde(rename = "parentCallFrameID")]
    pub parent_call_frame_id: String,

    /// Calls keyed by call id
    #[schema(value_type = Object)]
    pub calls: BTreeMap<String, Call>,
}

impl From<Run> for RunDetail {
    fn from(run: Run) -> Self {
        let run_frame = run.run_info();
        let parent_call_frame_id = run_frame.root_call_id().unwrap_or_default().to_string();
        Self {
            run_frame,
            parent_call_frame_id,
            calls: run.calls,
        }
    }
}

/// Create run history routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/threads/:thread_id/runs", get(list_runs))
        .route("/v1/threads/:thread_id/runs/:run_id", get(get_run))
        .with_state(state)
}

/// GET /v1/threads/{thread_id}/runs - List the runs of a thread, oldest first
#[utoipa::path(
    get,
    path = "/v1/threads/{thread_id}/runs",
    params(
        ("thread_id" = u64, Path, description = "Thread ID")
    ),
    responses(
        (status = 200, description = "List of runs", body = ListResponse<RunDetail>),
        (status = 400, description = "Invalid thread ID", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Path(thread_id): Path<u64>,
) -> Result<Json<ListResponse<RunDetail>>, ApiError> {
    // Thread 0 holds anonymous runs that are still in flight
    let Some(store) = state.store.filter(|_| thread_id != 0) else {
        return Ok(Json(ListResponse::from(Vec::new())));
    };

    let runs = store
        .list_runs(thread_id)
        .await
        .map_err(store_error("list runs"))?;

    Ok(Json(
        runs.into_iter().map(RunDetail::from).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/threads/{thread_id}/runs/{run_id} - Get a run
#[utoipa::path(
    get,
    path = "/v1/threads/{thread_id}/runs/{run_id}",
    params(
        ("thread_id" = u64, Path, description = "Thread ID"),
        ("run_id" = u64, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "Run found", body = RunDetail),
        (status = 400, description = "Invalid ID", body = ApiError),
        (status = 404, description = "Run not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(u64, u64)>,
) -> Result<Json<RunDetail>, ApiError> {
    let store = state
        .store
        .filter(|_| thread_id != 0)
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))?;

    let run = store
        .get_run(thread_id, run_id)
        .await
        .map_err(store_error("get run"))?;

    Ok(Json(run.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_json, request, test_state};
    use axum::{body::Body, http::StatusCode};
    use chrono::{Duration, Utc};
    use threadline_core::{CallContext, CreateRun, EventKind, RunEvent, RunState};
    use tower::ServiceExt;

    fn finished_run(run_id: u64) -> RunInfo {
        let start = Utc::now();
        let events = [
            RunEvent::at(
                run_id,
                start,
                EventKind::call_start(CallContext::new("root").with_tool_name("main"), "in"),
            ),
            RunEvent::at(
                run_id,
                start + Duration::milliseconds(1),
                EventKind::call_start(
                    CallContext::new("child").with_parent("root"),
                    "sub",
                ),
            ),
            RunEvent::at(
                run_id,
                start + Duration::milliseconds(2),
                EventKind::call_finish(CallContext::new("child").with_parent("root"), "ok"),
            ),
            RunEvent::at(
                run_id,
                start + Duration::milliseconds(3),
                EventKind::RunFinish {
                    output: "ok".to_string(),
                    err: None,
                    done: true,
                },
            ),
        ];
        RunInfo::replay(run_id, events.iter())
    }

    #[tokio::test]
    async fn test_get_compiled_run() {
        let (state, store) = test_state(true).await;
        let store = store.unwrap();
        let thread = store.create_thread(0).await.unwrap();
        let created = store
            .create_run(CreateRun {
                thread_id: thread.id,
                previous_run_id: 0,
                input: "in".to_string(),
                run: RunInfo::new(0),
            })
            .await
            .unwrap();
        let info = finished_run(created.id);
        assert_eq!(info.state, RunState::Finished);
        store.finish_run(thread.id, created.id, &info).await.unwrap();

        let app = routes(state);
        let response = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/v1/threads/{}/runs/{}", thread.id, created.id),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail = body_json(response).await;
        assert_eq!(detail["parentCallFrameID"], "root");
        assert_eq!(detail["runFrame"]["state"], "finished");
        assert_eq!(detail["runFrame"]["output"], "ok");
        assert_eq!(detail["calls"]["child"]["parentID"], "root");

        let response = app
            .oneshot(request(
                "GET",
                &format!("/v1/threads/{}/runs", thread.id),
                Body::empty(),
            ))
            .await
            .unwrap();
        let list = body_json(response).await;
        assert_eq!(list["data"].as_array().unwrap().len(), 1);
        assert_eq!(list["data"][0]["runFrame"]["id"], created.id);
    }

    #[tokio::test]
    async fn test_thread_zero_lists_no_runs() {
        let (state, store) = test_state(true).await;
        let store = store.unwrap();
        store
            .create_run(CreateRun {
                thread_id: 0,
                previous_run_id: 0,
                input: "anonymous".to_string(),
                run: RunInfo::new(0),
            })
            .await
            .unwrap();
        assert_eq!(store.list_runs(0).await.unwrap().len(), 1);

        let response = routes(state)
            .oneshot(request("GET", "/v1/threads/0/runs", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"data": []}));
    }

    #[tokio::test]
    async fn test_thread_zero_hides_anonymous_run() {
        let (state, store) = test_state(true).await;
        let run = store
            .unwrap()
            .create_run(CreateRun {
                thread_id: 0,
                previous_run_id: 0,
                input: String::new(),
                run: RunInfo::new(0),
            })
            .await
            .unwrap();

        let response = routes(state)
            .oneshot(request(
                "GET",
                &format!("/v1/threads/0/runs/{}", run.id),
                Body::empty(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_not_found() {
        let (state, store) = test_state(true).await;
        let thread = store.unwrap().create_thread(0).await.unwrap();

        let response = routes(state)
            .oneshot(request(
                "GET",
                &format!("/v1/threads/{}/runs/42", thread.id),
                Body::empty(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "run 42 not found");
    }

    #[tokio::test]
    async fn test_empty_run_has_no_parent_call() {
        let mut run = RunInfo::new(3);
        run.state = RunState::Continue;
        let detail = RunDetail::from(Run {
            id: 3,
            previous_run_id: 0,
            thread_id: 1,
            started_at: Utc::now(),
            finished_at: None,
            input: String::new(),
            output: String::new(),
            chat_state_after: None,
            run,
            calls: BTreeMap::new(),
        });

        assert_eq!(detail.parent_call_frame_id, "");
        assert!(detail.calls.is_empty());
    }
}
