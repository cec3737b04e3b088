//! Ingress HTTP handlers.

use crate::error::ProxyError;
use crate::forward::forward;
use crate::schemas::ModelList;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use super::state::AppState;

/// `POST /v1/chat/completions` — the routed endpoint.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    forward(state, "/v1/chat/completions", headers, body).await
}

/// `POST /v1/completions` — same routing rules as chat completions.
pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    forward(state, "/v1/completions", headers, body).await
}

/// `GET /v1/models` — models with at least one selectable replica.
pub async fn models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelList::from_names(state.registry.models()))
}

/// `GET /healthz` — proxy liveness. Always 200 while the server accepts.
pub async fn healthz() -> impl IntoResponse {
    let status = serde_json::json!({
        "status": "ok",
        "service": "agent-infra-proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(status))
}
