//! Wire shapes for the proxy boundary.
//!
//! The forwarder relays request and response bodies verbatim, so the only
//! body structure parsed here is the minimal head needed for routing
//! (`model`, `stream`). The rest are the aggregated `/v1/models` listing,
//! the backend load-report payload, and the routing context captured from
//! request headers.

use crate::config::HeaderConfig;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// The routing-relevant head of an OpenAI-compatible completion request.
/// Unknown fields pass through untouched inside the relayed body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestHead {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl RequestHead {
    /// Parse just enough of the body to route it. Malformed JSON is a client
    /// error; a syntactically valid body without `model` is handled by the
    /// caller.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Session/task/client identifiers and agent-reported timings captured from
/// request headers. All fields default to empty/zero; malformed timing
/// values are ignored.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub session_id: String,
    pub task_id: String,
    pub client_id: String,
    pub pre_ms: f64,
    pub post_ms: f64,
}

impl RoutingContext {
    pub fn from_headers(headers: &HeaderMap, names: &HeaderConfig) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let millis = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(0.0)
        };

        Self {
            session_id: text(&names.session),
            task_id: text(&names.task),
            client_id: text(&names.client),
            pre_ms: millis(&names.pre),
            post_ms: millis(&names.post),
        }
    }
}

/// `GET /v1/models` response, derived from model names with at least one
/// selectable backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    pub fn from_names(names: Vec<String>) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            object: "list".to_string(),
            data: names
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model".to_string(),
                    created,
                    owned_by: "agent-infra".to_string(),
                })
                .collect(),
        }
    }
}

/// Body of a backend's `GET /metrics/load` endpoint. Every field is
/// optional; an absent `gpu_utilization` leaves the recorded load unchanged.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoadReport {
    #[serde(default)]
    pub gpu_utilization: Option<f64>,
    #[serde(default)]
    pub in_flight: Option<u64>,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_request_head_parses_model_and_stream() {
        let head = RequestHead::parse(br#"{"model":"llama","stream":true,"messages":[]}"#).unwrap();
        assert_eq!(head.model.as_deref(), Some("llama"));
        assert!(head.stream);
    }

    #[test]
    fn test_request_head_defaults() {
        let head = RequestHead::parse(br#"{"messages":[]}"#).unwrap();
        assert!(head.model.is_none());
        assert!(!head.stream);
    }

    #[test]
    fn test_request_head_rejects_malformed_json() {
        assert!(RequestHead::parse(b"{not json").is_err());
    }

    #[test]
    fn test_routing_context_captures_headers() {
        let names = HeaderConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("X-Session-ID", HeaderValue::from_static("sess-1"));
        headers.insert("X-Task-ID", HeaderValue::from_static("task-9"));
        headers.insert("X-Client-ID", HeaderValue::from_static("agent-a"));
        headers.insert("X-Timing-Pre-Ms", HeaderValue::from_static("123.5"));
        headers.insert("X-Timing-Post-Ms", HeaderValue::from_static("7"));

        let ctx = RoutingContext::from_headers(&headers, &names);
        assert_eq!(ctx.session_id, "sess-1");
        assert_eq!(ctx.task_id, "task-9");
        assert_eq!(ctx.client_id, "agent-a");
        assert_eq!(ctx.pre_ms, 123.5);
        assert_eq!(ctx.post_ms, 7.0);
    }

    #[test]
    fn test_malformed_timing_headers_ignored() {
        let names = HeaderConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("X-Timing-Pre-Ms", HeaderValue::from_static("not-a-number"));
        headers.insert("X-Timing-Post-Ms", HeaderValue::from_static("-5"));

        let ctx = RoutingContext::from_headers(&headers, &names);
        assert_eq!(ctx.pre_ms, 0.0);
        assert_eq!(ctx.post_ms, 0.0);
    }

    #[test]
    fn test_model_list_shape() {
        let list = ModelList::from_names(vec!["llama".into(), "qwen".into()]);
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 2);
        assert_eq!(list.data[0].id, "llama");
        assert_eq!(list.data[0].object, "model");
        assert_eq!(list.data[0].owned_by, "agent-infra");
    }

    #[test]
    fn test_load_report_tolerates_missing_fields() {
        let report: LoadReport = serde_json::from_str("{}").unwrap();
        assert!(report.gpu_utilization.is_none());

        let report: LoadReport =
            serde_json::from_str(r#"{"gpu_utilization":0.42,"in_flight":3}"#).unwrap();
        assert_eq!(report.gpu_utilization, Some(0.42));
        assert_eq!(report.in_flight, Some(3));
    }
}
