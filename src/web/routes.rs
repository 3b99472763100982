use axum::{
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use super::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stream/status", get(handlers::stream_status));

    let static_files = ServeDir::new(&state.config.web.static_dir);

    Router::new()
        // Viewer endpoint
        .route("/ws", any(ws_handler))
        .route("/health", get(handlers::health_check))
        .nest("/api", api_routes)
        .nest_service("/static", static_files)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
