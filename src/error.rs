//! Error taxonomy surfaced at the client boundary.
//!
//! Every failure a client can observe maps to one [`ProxyError`] variant with
//! a fixed HTTP status. Error responses always carry the body
//! `{"error": {"type", "message", "backend_id"?}}` so agents can branch on
//! `type` without parsing prose.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or unparseable `model` field, or a malformed JSON body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The requested model is not present in the registry at all.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// The model exists but every candidate is unhealthy or removed.
    #[error("no backend available for model '{0}'")]
    NoBackendAvailable(String),

    /// The overall request deadline elapsed before any response byte.
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// All retries exhausted against connection or 5xx failures.
    #[error("upstream error: {message}")]
    UpstreamError {
        message: String,
        backend_id: Option<String>,
    },

    /// The client dropped the connection; no response is deliverable.
    #[error("client cancelled the request")]
    ClientCancelled,

    /// Invariant violation. Logged and counted, never expected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Stable machine-readable kind, also recorded in turn records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::UnknownModel(_) => "unknown_model",
            Self::NoBackendAvailable(_) => "no_backend_available",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::ClientCancelled => "client_cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownModel(_) => StatusCode::NOT_FOUND,
            Self::NoBackendAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            // Never actually delivered; the client is gone. 499 keeps access
            // logs honest if one slips through.
            Self::ClientCancelled => StatusCode::from_u16(499).expect("static status"),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn backend_id(&self) -> Option<&str> {
        match self {
            Self::UpstreamError { backend_id, .. } => backend_id.as_deref(),
            _ => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut error = json!({
            "type": self.kind(),
            "message": self.to_string(),
        });
        if let Some(id) = self.backend_id() {
            error["backend_id"] = json!(id);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}

/// Classify reqwest failures into the taxonomy. Connection-level failures
/// stay retriable (`UpstreamError`); timeouts are terminal for the attempt.
impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout
        } else if err.is_connect() {
            ProxyError::UpstreamError {
                message: format!("connection failed: {err}"),
                backend_id: None,
            }
        } else {
            ProxyError::UpstreamError {
                message: format!("http client error: {err}"),
                backend_id: None,
            }
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::BadRequest(format!("invalid JSON: {err}"))
    }
}

impl From<axum::http::Error> for ProxyError {
    fn from(err: axum::http::Error) -> Self {
        ProxyError::Internal(format!("http protocol error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_mapping() {
        assert_eq!(
            ProxyError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::UnknownModel("m".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::NoBackendAvailable("m".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let err = ProxyError::UpstreamError {
            message: "boom".into(),
            backend_id: Some("llama-0".into()),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "upstream_error");
        assert_eq!(body["error"]["backend_id"], "llama-0");
        assert!(body["error"]["message"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_unavailable_carries_retry_after() {
        let response = ProxyError::NoBackendAvailable("llama".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("5")
        );
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(ProxyError::ClientCancelled.kind(), "client_cancelled");
        assert_eq!(ProxyError::UpstreamTimeout.kind(), "upstream_timeout");
    }
}
