//! Read-only metrics/control surface consumed by the terminal dashboard.
//!
//! Every endpoint returns a consistent snapshot taken under brief read
//! locks; the dashboard polls at its own cadence and reconstructs anything
//! it missed from these snapshots.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use super::state::AppState;

const DEFAULT_SESSION_LIMIT: usize = 100;

/// `GET /admin/backends` — snapshot of every registered replica.
pub async fn backends(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

/// `GET /admin/queue` — global load counters.
pub async fn queue(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.store.queue_stats();
    Json(json!({
        "pending": state.stats.pending(),
        "in_flight": state.registry.total_in_flight(),
        "requests_per_s": stats.requests_per_s,
        "mean_latency_ms": stats.mean_latency_ms,
        "retries_total": state.stats.retries_total(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

/// `GET /admin/sessions` — summaries sorted by recency.
pub async fn sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionListQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_SESSION_LIMIT);
    Json(state.store.list_sessions(limit, query.since))
}

/// `GET /admin/sessions/{id}` — turn records for one session.
pub async fn session_turns(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_session(&id) {
        Some(turns) => Json(turns).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "type": "not_found",
                    "message": format!("no session '{id}'"),
                }
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct BottleneckQuery {
    pub session: Option<String>,
}

/// `GET /admin/bottleneck?session=…` — latency-stage diagnosis over one
/// session or the global window.
pub async fn bottleneck(
    State(state): State<AppState>,
    Query(query): Query<BottleneckQuery>,
) -> impl IntoResponse {
    Json(state.store.bottleneck_report(query.session.as_deref()))
}
