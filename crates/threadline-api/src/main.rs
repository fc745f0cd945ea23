// Threadline API server
// Decision: History is optional; without THREADS_DSN runs still stream but nothing is kept
// Decision: The engine is pluggable behind the Engine trait; the binary serves the echo engine

mod common;
mod config;
mod events;
mod runs;
mod stream;
mod threads;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use threadline_core::{EchoEngine, Event, EventBus, Thread};
use threadline_storage::Database;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

use crate::common::{ApiError, ListResponse};
use crate::config::ServerConfig;
use crate::stream::Dispatcher;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    /// Run history; None when history is disabled
    pub store: Option<Arc<Database>>,
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        stream::run,
        threads::create_thread,
        threads::list_threads,
        threads::get_thread,
        threads::update_thread,
        threads::delete_thread,
        runs::list_runs,
        runs::get_run,
        events::list_events,
        events::get_event,
    ),
    components(
        schemas(
            Thread, Event, ApiError,
            stream::RunRequest,
            threads::UpdateThreadRequest,
            runs::RunDetail,
            ListResponse<Thread>,
            ListResponse<runs::RunDetail>,
            ListResponse<Event>,
        )
    ),
    tags(
        (name = "runs", description = "Run execution (SSE) and run history endpoints"),
        (name = "threads", description = "Thread management endpoints"),
        (name = "events", description = "Stored run event endpoints")
    ),
    info(
        title = "Threadline API",
        version = "0.2.0",
        description = "Run tracking and thread history for tool executions"
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadline_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Threadline API server...");

    let config = ServerConfig::from_env();

    // Connect to the history database (optional)
    let store = match &config.threads_dsn {
        Some(dsn) => {
            let db = Database::connect_and_migrate(dsn)
                .await
                .context("Failed to open thread history database")?;
            tracing::info!(backend = ?db.backend(), "Thread history enabled");
            Some(Arc::new(db))
        }
        None => {
            tracing::info!("THREADS_DSN not set, thread history disabled");
            None
        }
    };

    let bus = EventBus::new(config.event_bus_capacity);
    let dispatcher = Dispatcher::new(Arc::new(EchoEngine::new()), bus, store.clone())
        .with_quiet_store_errors(config.disable_server_error_logging);
    let state = AppState {
        store,
        dispatcher: Arc::new(dispatcher),
    };

    if !config.api_prefix.is_empty() {
        tracing::info!(prefix = %config.api_prefix, "API prefix configured");
    }

    let cors_origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    if cors_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
    } else {
        tracing::info!(origins = ?cors_origins, "CORS origins configured");
    }

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/api-doc/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(build_router_with_prefix(api_routes(state), &config.api_prefix));

    // Add CORS layer only if origins are configured
    let app = if !cors_origins.is_empty() {
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::ORIGIN,
                    header::CACHE_CONTROL,
                ]),
        )
    } else {
        app
    };

    // Add tracing
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", config.listen_address);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// All versioned API routes
fn api_routes(state: AppState) -> Router {
    Router::new()
        .merge(stream::routes(state.clone()))
        .merge(threads::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(events::routes(state))
}

/// Build router with optional API prefix (extracted for testing)
fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}

#[cfg(test)]
mod test_support {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request},
        response::Response,
    };
    use http_body_util::BodyExt;

    /// App state over an in-memory sqlite history, or without history
    pub async fn test_state(with_history: bool) -> (AppState, Option<Arc<Database>>) {
        let store = if with_history {
            Some(Arc::new(
                Database::connect_and_migrate("sqlite::memory:")
                    .await
                    .unwrap(),
            ))
        } else {
            None
        };
        let dispatcher = Dispatcher::new(Arc::new(EchoEngine::new()), EventBus::default(), store.clone());
        let state = AppState {
            store: store.clone(),
            dispatcher: Arc::new(dispatcher),
        };
        (state, store)
    }

    pub fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    pub async fn body_text(response: Response) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }
}
