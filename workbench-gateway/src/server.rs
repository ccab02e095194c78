//! # HTTP Server Setup
//!
//! Builds the application state and the Axum router for the gateway.
//!
//! ## Application state
//!
//! [`AppState`] wires the core components together: settings, the game
//! store, the capability registry, the format registry, the task manager,
//! and the plugin supervisor. Everything is behind an `Arc` so handlers
//! share one instance; none of the components are global singletons, which
//! keeps tests isolated (each test builds its own state).
//!
//! ## Middleware stack
//!
//! 1. CORS from the configured origin list
//! 2. Access logging (successful `/health` probes are suppressed so
//!    liveness checks don't flood the log)
//! 3. Request timeout
//! 4. Body-size limit sized above the upload cap, so the handler (not the
//!    framework) enforces the exact boundary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::capabilities::CapabilityRegistry;
use crate::config::Settings;
use crate::formats::FormatRegistry;
use crate::handlers;
use crate::store::GameStore;
use crate::supervisor::PluginSupervisor;
use crate::tasks::TaskManager;

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<GameStore>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub formats: Arc<FormatRegistry>,
    pub tasks: Arc<TaskManager>,
    pub supervisor: Arc<PluginSupervisor>,
    pub project_root: Arc<PathBuf>,
}

/// Construct the component graph from settings.
pub fn build_state(settings: Settings, project_root: PathBuf) -> AppState {
    let capabilities = Arc::new(CapabilityRegistry::new(
        settings.remote.submit_timeout,
        settings.remote.submit_timeout,
        settings.remote.poll_settings(),
    ));
    let formats = Arc::new(FormatRegistry::new(settings.remote.submit_timeout));
    let tasks = Arc::new(TaskManager::new(
        settings.tasks.max_workers,
        settings.tasks.id_length,
    ));
    let supervisor = Arc::new(PluginSupervisor::new(
        settings.supervisor.clone(),
        project_root.clone(),
    ));

    AppState {
        settings: Arc::new(settings),
        store: Arc::new(GameStore::new()),
        capabilities,
        formats,
        tasks,
        supervisor,
        project_root: Arc::new(project_root),
    }
}

/// Access log for every request except successful health probes.
async fn access_log(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let status = response.status();
    // Liveness probes hit /health continuously; only failures are worth a line.
    if !(path.ends_with("/health") && status.is_success()) {
        tracing::info!(
            %method,
            %path,
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "request processed"
        );
    }
    response
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new();
    }
    if origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS allows any origin; configure explicit CORS_ORIGINS for production");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the router over the given state.
pub fn create_server(state: AppState) -> Router {
    // The framework limit sits above the upload cap so the upload handler
    // can enforce the exact byte boundary itself (multipart framing adds
    // overhead on top of the file's own size).
    let body_limit = state.settings.max_upload_size + 64 * 1024;

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/games", get(handlers::list_games))
        .route("/api/games/upload", post(handlers::upload_game))
        .route("/api/games/{game_id}", get(handlers::get_game))
        .route("/api/games/{game_id}", delete(handlers::delete_game))
        .route("/api/games/{game_id}/summary", get(handlers::get_game_summary))
        .route(
            "/api/games/{game_id}/as/{target_format}",
            get(handlers::get_game_as_format),
        )
        .route(
            "/api/games/{game_id}/analyses",
            get(handlers::run_game_analyses),
        )
        .route("/api/analyses", get(handlers::list_analyses))
        .route("/api/tasks", post(handlers::submit_task))
        .route("/api/tasks", get(handlers::list_tasks))
        .route("/api/tasks/{task_id}", get(handlers::get_task))
        .route("/api/tasks/{task_id}", delete(handlers::cancel_task))
        .layer(
            ServiceBuilder::new()
                .layer(cors_layer(&state.settings.cors_origins))
                .layer(axum::middleware::from_fn(access_log))
                .layer(TimeoutLayer::new(state.settings.request_timeout)),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
