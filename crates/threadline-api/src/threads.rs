// Thread HTTP routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use threadline_core::Thread;
use utoipa::ToSchema;

use crate::common::{store_error, ApiError, ListResponse};
use crate::AppState;

/// Request to rename a thread
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateThreadRequest {
    /// New name; null or empty clears it
    #[serde(default)]
    pub name: Option<String>,
}

/// Create thread routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/threads", get(list_threads).post(create_thread))
        .route(
            "/v1/threads/:thread_id",
            get(get_thread).patch(update_thread).delete(delete_thread),
        )
        .with_state(state)
}

/// POST /v1/threads - Create an empty thread
#[utoipa::path(
    post,
    path = "/v1/threads",
    responses(
        (status = 201, description = "Thread created", body = Thread),
        (status = 500, description = "Internal server error", body = ApiError),
        (status = 503, description = "Thread history is disabled", body = ApiError)
    ),
    tag = "threads"
)]
pub async fn create_thread(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Thread>), ApiError> {
    let store = state.store.ok_or_else(ApiError::history_disabled)?;

    let thread = store
        .create_thread(0)
        .await
        .map_err(store_error("create thread"))?;

    Ok((StatusCode::CREATED, Json(thread)))
}

/// GET /v1/threads - List threads, oldest first
#[utoipa::path(
    get,
    path = "/v1/threads",
    responses(
        (status = 200, description = "List of threads", body = ListResponse<Thread>),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "threads"
)]
pub async fn list_threads(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Thread>>, ApiError> {
    let Some(store) = state.store else {
        return Ok(Json(ListResponse::from(Vec::new())));
    };

    let threads = store
        .list_threads()
        .await
        .map_err(store_error("list threads"))?;

    Ok(Json(threads.into()))
}

/// GET /v1/threads/{thread_id} - Get a thread
#[utoipa::path(
    get,
    path = "/v1/threads/{thread_id}",
    params(
        ("thread_id" = u64, Path, description = "Thread ID")
    ),
    responses(
        (status = 200, description = "Thread found", body = Thread),
        (status = 400, description = "Invalid thread ID", body = ApiError),
        (status = 404, description = "Thread not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "threads"
)]
pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<u64>,
) -> Result<Json<Thread>, ApiError> {
    let store = state
        .store
        .ok_or_else(|| ApiError::not_found(format!("thread {} not found", thread_id)))?;

    let thread = store
        .get_thread(thread_id)
        .await
        .map_err(store_error("get thread"))?;

    Ok(Json(thread))
}

/// PATCH /v1/threads/{thread_id} - Rename a thread
#[utoipa::path(
    patch,
    path = "/v1/threads/{thread_id}",
    params(
        ("thread_id" = u64, Path, description = "Thread ID")
    ),
    request_body = UpdateThreadRequest,
    responses(
        (status = 200, description = "Thread updated", body = Thread),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Thread not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError),
        (status = 503, description = "Thread history is disabled", body = ApiError)
    ),
    tag = "threads"
)]
pub async fn update_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<u64>,
    payload: Result<Json<UpdateThreadRequest>, JsonRejection>,
) -> Result<Json<Thread>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let store = state.store.ok_or_else(ApiError::history_disabled)?;

    let name = req.name.filter(|name| !name.is_empty());
    let thread = store
        .name_thread(thread_id, name)
        .await
        .map_err(store_error("update thread"))?;

    Ok(Json(thread))
}

/// DELETE /v1/threads/{thread_id} - Delete a thread with its runs and events
#[utoipa::path(
    delete,
    path = "/v1/threads/{thread_id}",
    params(
        ("thread_id" = u64, Path, description = "Thread ID")
    ),
    responses(
        (status = 204, description = "Thread deleted"),
        (status = 400, description = "Invalid thread ID", body = ApiError),
        (status = 404, description = "Thread not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError),
        (status = 503, description = "Thread history is disabled", body = ApiError)
    ),
    tag = "threads"
)]
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let store = state.store.ok_or_else(ApiError::history_disabled)?;

    store
        .delete_thread(thread_id)
        .await
        .map_err(store_error("delete thread"))?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_json, request, test_state};
    use axum::body::Body;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_thread_lifecycle() {
        let (state, _) = test_state(true).await;
        let app = routes(state);

        let response = app
            .clone()
            .oneshot(request("POST", "/v1/threads", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_u64().unwrap();
        assert_eq!(created["firstRunID"], 0);

        let response = app
            .clone()
            .oneshot(request(
                "PATCH",
                &format!("/v1/threads/{}", id),
                Body::from(json!({"name": "research"}).to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["name"], "research");

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/threads", Body::empty()))
            .await
            .unwrap();
        let list = body_json(response).await;
        assert_eq!(list["data"].as_array().unwrap().len(), 1);
        assert_eq!(list["data"][0]["name"], "research");

        let response = app
            .clone()
            .oneshot(request("DELETE", &format!("/v1/threads/{}", id), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request("GET", &format!("/v1/threads/{}", id), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            json!({"error": format!("thread {} not found", id)})
        );
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let (state, _) = test_state(true).await;
        let app = routes(state);

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/threads/abc", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(request("PATCH", "/v1/threads/1", Body::from("{not json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());

        let response = app
            .oneshot(request("DELETE", "/v1/threads/99", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_without_history() {
        let (state, _) = test_state(false).await;
        let app = routes(state);

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/threads", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"data": []}));

        let response = app
            .oneshot(request("POST", "/v1/threads", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
