//! HTTP server assembly: routes, middleware, and shared state.

pub mod admin;
pub mod handlers;
pub mod state;

pub use state::{AppState, ProxyStats};

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{self, TraceLayer},
};
use tracing::Level;

/// Build the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Routed OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/models", get(handlers::models))
        // Liveness
        .route("/healthz", get(handlers::healthz))
        // Dashboard surface
        .route("/admin/backends", get(admin::backends))
        .route("/admin/queue", get(admin::queue))
        .route("/admin/sessions", get(admin::sessions))
        .route("/admin/sessions/{id}", get(admin::session_turns))
        .route("/admin/bottleneck", get(admin::bottleneck))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
