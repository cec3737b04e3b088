//! The proxy forwarder: request relay with failover and telemetry capture.
//!
//! Each inbound completion request is parsed just enough to route (`model`,
//! `stream`), matched to a backend by the selection engine, and relayed with
//! the already-buffered body. The upstream response streams back to the
//! client verbatim through [`RelayBody`], which couples the byte relay to
//! turn finalization: whether the stream ends cleanly, errors, hits the
//! deadline, or the client walks away, exactly one turn record is written
//! and the backend's in-flight count comes back down.
//!
//! Failover: a failure before any response byte reaches the client is
//! retried against a different candidate, up to `max_retries`. Once bytes
//! have flowed the error is terminal and the stream is truncated.

use crate::backend::BackendId;
use crate::error::ProxyError;
use crate::registry::InFlightToken;
use crate::schemas::{RequestHead, RoutingContext};
use crate::selection::SelectionContext;
use crate::server::state::AppState;
use crate::session::TurnRecord;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::time::{sleep_until, Duration as TokioDuration, Instant as TokioInstant, Sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marker body distinguishing a retriable 5xx from an application error.
const RETRIABLE_5XX_MARKER: &[u8] = b"upstream_unavailable";

/// Cap on how much of a failed 5xx body is buffered while deciding whether
/// to retry it; the tail is relayed untouched when the attempt is not
/// retried.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Hop-by-hop headers never relayed in either direction.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| h == name) || name == &header::UPGRADE
}

/// Route and relay one completion request. `path` is the upstream path,
/// identical to the ingress path.
pub async fn forward(
    state: AppState,
    path: &'static str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let accepted = Instant::now();
    let started_at = Utc::now();
    let request_id = short_id();

    let ctx = RoutingContext::from_headers(&headers, &state.config.headers);

    let head = match RequestHead::parse(&body) {
        Ok(head) => head,
        Err(err) => {
            let err = ProxyError::BadRequest(format!("malformed request body: {err}"));
            record_unrouted_turn(&state, &ctx, "", &err, accepted, started_at, false);
            return Err(err);
        }
    };
    let Some(model) = head.model.filter(|m| !m.is_empty()) else {
        let err = ProxyError::BadRequest("request body is missing 'model'".to_string());
        record_unrouted_turn(&state, &ctx, "", &err, accepted, started_at, head.stream);
        return Err(err);
    };

    if !state.registry.has_model(&model) {
        let err = ProxyError::UnknownModel(model.clone());
        record_unrouted_turn(&state, &ctx, &model, &err, accepted, started_at, head.stream);
        return Err(err);
    }

    let deadline =
        TokioInstant::now() + TokioDuration::from_secs(state.config.proxy.request_timeout_s);
    let mut pending = Some(state.stats.begin_pending());
    let mut excluded: Vec<BackendId> = Vec::new();
    let mut attempts: u32 = 0;

    loop {
        let candidates: Vec<_> = state
            .registry
            .list_for_model(&model)
            .into_iter()
            .filter(|c| !excluded.contains(&c.id))
            .collect();
        let selection_ctx = SelectionContext {
            session_id: (!ctx.session_id.is_empty()).then_some(ctx.session_id.as_str()),
        };
        let Some(choice) = state.engine.select(&model, &candidates, &selection_ctx) else {
            let err = if attempts == 0 {
                ProxyError::NoBackendAvailable(model.clone())
            } else {
                ProxyError::UpstreamError {
                    message: format!("all candidates for '{model}' failed"),
                    backend_id: excluded.last().cloned(),
                }
            };
            record_unrouted_turn(&state, &ctx, &model, &err, accepted, started_at, head.stream);
            return Err(err);
        };
        let choice_id = choice.id.clone();
        let choice_load = choice.load;

        let Some(token) = state.registry.observe_start(&choice_id) else {
            // Raced with removal; try the next candidate without burning a
            // retry.
            excluded.push(choice_id);
            continue;
        };

        let url = format!("http://{}{}", token.endpoint(), path);
        debug!(request_id = %request_id, backend = %choice_id, url = %url, "dispatching");

        let send_at = Instant::now();
        let Some(remaining) = deadline.checked_duration_since(TokioInstant::now()) else {
            state.registry.observe_end(token, elapsed_ms(send_at), false);
            let err = ProxyError::UpstreamTimeout;
            record_routed_error(&state, &ctx, &model, &choice_id, choice_load, &err, accepted, send_at, started_at, head.stream);
            return Err(err);
        };

        let request = build_upstream_request(&state, &url, &headers, body.clone());
        let response = match tokio::time::timeout(remaining, request.send()).await {
            Err(_elapsed) => {
                // Overall deadline hit before response headers.
                state.registry.observe_end(token, elapsed_ms(send_at), false);
                let err = ProxyError::UpstreamTimeout;
                record_routed_error(&state, &ctx, &model, &choice_id, choice_load, &err, accepted, send_at, started_at, head.stream);
                return Err(err);
            }
            Ok(Err(send_err)) => {
                // Connect refused/timeout or close before headers: retriable.
                state.registry.observe_end(token, elapsed_ms(send_at), false);
                warn!(request_id = %request_id, backend = %choice_id, error = %send_err, "upstream attempt failed");
                excluded.push(choice_id.clone());
                attempts += 1;
                if attempts > state.config.proxy.max_retries {
                    let err = ProxyError::UpstreamError {
                        message: format!("upstream unreachable: {send_err}"),
                        backend_id: Some(choice_id.clone()),
                    };
                    record_routed_error(&state, &ctx, &model, &choice_id, choice_load, &err, accepted, send_at, started_at, head.stream);
                    return Err(err);
                }
                state.stats.record_retry();
                continue;
            }
            Ok(Ok(response)) => response,
        };

        // Connected: the request leaves the pending phase.
        drop(pending.take());
        let queue_wait_ms = send_at.duration_since(accepted).as_secs_f64() * 1000.0;
        let status = response.status();
        let response_headers = response.headers().clone();

        if status.is_server_error() && attempts < state.config.proxy.max_retries {
            // Peek at the front of the body for the retry marker. The tail
            // is kept so a non-retriable 5xx still reaches the client in
            // full.
            let mut rest = response.bytes_stream().boxed();
            let (prefix, peek_err) = peek_body(&mut rest, ERROR_BODY_LIMIT).await;
            if prefix
                .windows(RETRIABLE_5XX_MARKER.len())
                .any(|w| w == RETRIABLE_5XX_MARKER)
            {
                state.registry.observe_end(token, elapsed_ms(send_at), false);
                warn!(request_id = %request_id, backend = %choice_id, status = %status, "retriable upstream 5xx");
                excluded.push(choice_id);
                attempts += 1;
                state.stats.record_retry();
                pending = Some(state.stats.begin_pending());
                continue;
            }

            // Application error: relay the peeked prefix and the remaining
            // stream verbatim.
            let mut replayed: Vec<reqwest::Result<Bytes>> = Vec::new();
            if !prefix.is_empty() {
                replayed.push(Ok(Bytes::from(prefix)));
            }
            if let Some(err) = peek_err {
                replayed.push(Err(err));
            }
            let body = stream::iter(replayed).chain(rest).boxed();

            let finalizer = TurnFinalizer::new(
                &state, token, ctx, model, choice_id, choice_load, started_at, accepted, send_at,
                queue_wait_ms, head.stream,
            );
            return relay_streaming(status, &response_headers, body, finalizer, deadline);
        }

        info!(
            request_id = %request_id,
            backend = %choice_id,
            status = %status,
            attempts,
            streamed = head.stream,
            "relaying upstream response"
        );

        let finalizer = TurnFinalizer::new(
            &state, token, ctx, model, choice_id, choice_load, started_at, accepted, send_at,
            queue_wait_ms, head.stream,
        );
        return relay_streaming(
            status,
            &response_headers,
            response.bytes_stream().boxed(),
            finalizer,
            deadline,
        );
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

fn build_upstream_request(
    state: &AppState,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> reqwest::RequestBuilder {
    let mut request = state.upstream.post(url);
    for (name, value) in headers {
        // Host and content-length are derived from the rewritten request.
        if is_hop_by_hop(name) || name == &header::HOST || name == &header::CONTENT_LENGTH {
            continue;
        }
        request = request.header(name, value);
    }
    request.body(body)
}

/// Read up to `limit` bytes from the front of a body stream without
/// discarding the rest. Returns the collected prefix, plus the error that
/// interrupted the read if the upstream died mid-peek.
async fn peek_body(
    stream: &mut BoxStream<'static, reqwest::Result<Bytes>>,
    limit: usize,
) -> (Vec<u8>, Option<reqwest::Error>) {
    let mut prefix = Vec::new();
    while prefix.len() < limit {
        match stream.next().await {
            Some(Ok(chunk)) => prefix.extend_from_slice(&chunk),
            Some(Err(err)) => return (prefix, Some(err)),
            None => break,
        }
    }
    (prefix, None)
}

/// Relay an upstream response body to the client, preserving status,
/// headers, and the exact byte sequence. SSE frames pass through chunk by
/// chunk.
fn relay_streaming(
    status: StatusCode,
    headers: &HeaderMap,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    mut finalizer: TurnFinalizer,
    deadline: TokioInstant,
) -> Result<Response, ProxyError> {
    finalizer.status = status.as_u16();

    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }

    let relay = RelayBody {
        inner: body,
        deadline: Box::pin(sleep_until(deadline)),
        finalizer,
    };
    builder
        .body(Body::from_stream(relay))
        .map_err(ProxyError::from)
}

/// Everything needed to close out one dispatched turn exactly once.
struct TurnFinalizer {
    state: AppState,
    token: Option<InFlightToken>,
    ctx: RoutingContext,
    model: String,
    backend_id: BackendId,
    backend_load: Option<f64>,
    started_at: DateTime<Utc>,
    accepted: Instant,
    send_at: Instant,
    queue_wait_ms: f64,
    streamed: bool,
    status: u16,
    last_byte_at: Option<Instant>,
    done: bool,
}

impl TurnFinalizer {
    #[allow(clippy::too_many_arguments)]
    fn new(
        state: &AppState,
        token: InFlightToken,
        ctx: RoutingContext,
        model: String,
        backend_id: BackendId,
        backend_load: Option<f64>,
        started_at: DateTime<Utc>,
        accepted: Instant,
        send_at: Instant,
        queue_wait_ms: f64,
        streamed: bool,
    ) -> Self {
        Self {
            state: state.clone(),
            token: Some(token),
            ctx,
            model,
            backend_id,
            backend_load,
            started_at,
            accepted,
            send_at,
            queue_wait_ms,
            streamed,
            status: 0,
            last_byte_at: None,
            done: false,
        }
    }

    /// Close the turn: release the in-flight slot, fold the upstream
    /// duration into the backend's latency statistics, and append the turn
    /// record. `backend_ok` feeds the failure streak; client cancellation is
    /// not a backend failure.
    fn finalize(&mut self, status: u16, error_kind: Option<&str>, backend_ok: bool) {
        if self.done {
            return;
        }
        self.done = true;

        let upstream_ms = self
            .last_byte_at
            .map(|at| at.duration_since(self.send_at).as_secs_f64() * 1000.0)
            .unwrap_or_else(|| elapsed_ms(self.send_at));

        if let Some(token) = self.token.take() {
            self.state.registry.observe_end(token, upstream_ms, backend_ok);
        }

        let ctx = std::mem::take(&mut self.ctx);
        self.state.store.record(TurnRecord {
            session_id: ctx.session_id,
            task_id: ctx.task_id,
            client_id: ctx.client_id,
            model_name: std::mem::take(&mut self.model),
            backend_id: self.backend_id.clone(),
            queue_wait_ms: self.queue_wait_ms,
            inference_ms: upstream_ms,
            pre_ms: ctx.pre_ms,
            post_ms: ctx.post_ms,
            total_ms: elapsed_ms(self.accepted),
            status_code: status,
            streamed: self.streamed,
            error_kind: error_kind.map(str::to_string),
            backend_load: self.backend_load,
            started_at: self.started_at,
        });
    }
}

impl Drop for TurnFinalizer {
    fn drop(&mut self) {
        // Reaching drop unfinalized means the response body was abandoned
        // mid-relay: the client went away.
        if !self.done {
            let status = self.status;
            self.finalize(status, Some("client_cancelled"), true);
        }
    }
}

/// Upstream-to-client byte pump. Dropping the reqwest stream (on deadline,
/// error, or client disconnect) cancels the upstream request promptly.
struct RelayBody {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    deadline: Pin<Box<Sleep>>,
    finalizer: TurnFinalizer,
}

impl Stream for RelayBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finalizer.done {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            // Deadline elapsed mid-stream: truncate. Bytes already delivered
            // stand; the upstream connection drops with `inner`.
            let status = this.finalizer.status;
            this.finalizer.finalize(status, Some("upstream_timeout"), false);
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.finalizer.last_byte_at = Some(Instant::now());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let status = this.finalizer.status;
                this.finalizer.finalize(status, Some("upstream_error"), false);
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => {
                let status = this.finalizer.status;
                let ok = status < 500;
                let error_kind = if ok { None } else { Some("upstream_error") };
                this.finalizer.finalize(status, error_kind, ok);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Record a turn for a request that never reached a backend (or whose last
/// attempt already released its token).
fn record_unrouted_turn(
    state: &AppState,
    ctx: &RoutingContext,
    model: &str,
    err: &ProxyError,
    accepted: Instant,
    started_at: DateTime<Utc>,
    streamed: bool,
) {
    state.store.record(TurnRecord {
        session_id: ctx.session_id.clone(),
        task_id: ctx.task_id.clone(),
        client_id: ctx.client_id.clone(),
        model_name: model.to_string(),
        backend_id: String::new(),
        queue_wait_ms: 0.0,
        inference_ms: 0.0,
        pre_ms: ctx.pre_ms,
        post_ms: ctx.post_ms,
        total_ms: elapsed_ms(accepted),
        status_code: err.status().as_u16(),
        streamed,
        error_kind: Some(err.kind().to_string()),
        backend_load: None,
        started_at,
    });
}

/// Record a turn for a terminal failure on a specific backend whose token
/// was already returned.
#[allow(clippy::too_many_arguments)]
fn record_routed_error(
    state: &AppState,
    ctx: &RoutingContext,
    model: &str,
    backend_id: &str,
    backend_load: Option<f64>,
    err: &ProxyError,
    accepted: Instant,
    send_at: Instant,
    started_at: DateTime<Utc>,
    streamed: bool,
) {
    state.store.record(TurnRecord {
        session_id: ctx.session_id.clone(),
        task_id: ctx.task_id.clone(),
        client_id: ctx.client_id.clone(),
        model_name: model.to_string(),
        backend_id: backend_id.to_string(),
        queue_wait_ms: send_at.duration_since(accepted).as_secs_f64() * 1000.0,
        inference_ms: elapsed_ms(send_at),
        pre_ms: ctx.pre_ms,
        post_ms: ctx.post_ms,
        total_ms: elapsed_ms(accepted),
        status_code: err.status().as_u16(),
        streamed,
        error_kind: Some(err.kind().to_string()),
        backend_load,
        started_at,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop(&header::CONNECTION));
        assert!(is_hop_by_hop(&header::TRANSFER_ENCODING));
        assert!(is_hop_by_hop(&header::UPGRADE));
        assert!(is_hop_by_hop(&HeaderName::from_static("keep-alive")));
        assert!(!is_hop_by_hop(&header::CONTENT_TYPE));
        assert!(!is_hop_by_hop(&header::AUTHORIZATION));
    }

    #[test]
    fn test_short_id_length() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, short_id());
    }

    #[test]
    fn test_retriable_marker_match() {
        let body = Bytes::from_static(b"{\"error\":\"upstream_unavailable\"}");
        assert!(body
            .windows(RETRIABLE_5XX_MARKER.len())
            .any(|w| w == RETRIABLE_5XX_MARKER));

        let body = Bytes::from_static(b"{\"error\":\"capacity\"}");
        assert!(!body
            .windows(RETRIABLE_5XX_MARKER.len())
            .any(|w| w == RETRIABLE_5XX_MARKER));
    }
}
