// Stored event HTTP routes

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use threadline_core::Event;

use crate::common::{store_error, ApiError, ListResponse};
use crate::AppState;

/// Create event routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/threads/:thread_id/runs/:run_id/events", get(list_events))
        .route(
            "/v1/threads/:thread_id/runs/:run_id/events/:event_id",
            get(get_event),
        )
        .with_state(state)
}

/// GET /v1/threads/{thread_id}/runs/{run_id}/events - List the events of a run in order
#[utoipa::path(
    get,
    path = "/v1/threads/{thread_id}/runs/{run_id}/events",
    params(
        ("thread_id" = u64, Path, description = "Thread ID"),
        ("run_id" = u64, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "List of events", body = ListResponse<Event>),
        (status = 400, description = "Invalid ID", body = ApiError),
        (status = 404, description = "Run not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "events"
)]
pub async fn list_events(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(u64, u64)>,
) -> Result<Json<ListResponse<Event>>, ApiError> {
    let store = state
        .store
        .filter(|_| thread_id != 0)
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))?;

    // The run must belong to the thread in the path
    store
        .get_run(thread_id, run_id)
        .await
        .map_err(store_error("get run"))?;

    let events = store
        .list_events(run_id)
        .await
        .map_err(store_error("list events"))?;

    Ok(Json(events.into()))
}

/// GET /v1/threads/{thread_id}/runs/{run_id}/events/{event_id} - Get one event
#[utoipa::path(
    get,
    path = "/v1/threads/{thread_id}/runs/{run_id}/events/{event_id}",
    params(
        ("thread_id" = u64, Path, description = "Thread ID"),
        ("run_id" = u64, Path, description = "Run ID"),
        ("event_id" = u64, Path, description = "Event ID")
    ),
    responses(
        (status = 200, description = "Event found", body = Event),
        (status = 400, description = "Invalid ID", body = ApiError),
        (status = 404, description = "Run or event not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "events"
)]
pub async fn get_event(
    State(state): State<AppState>,
    Path((thread_id, run_id, event_id)): Path<(u64, u64, u64)>,
) -> Result<Json<Event>, ApiError> {
    let store = state
        .store
        .filter(|_| thread_id != 0)
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))?;

    store
        .get_run(thread_id, run_id)
        .await
        .map_err(store_error("get run"))?;

    let event = store
        .get_event(run_id, event_id)
        .await
        .map_err(store_error("get event"))?;

    Ok(Json(event))
}
