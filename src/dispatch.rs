//! Request dispatch — director, response hook, and error hook.
//!
//! Structured as three phases to mirror a classic reverse-proxy split
//! (director / response / error), even though Axum's per-request handler
//! model lets us keep the bound worker as an owned local instead of
//! threading it back in through the outbound URL the way a director/
//! ModifyResponse/ErrorHandler callback triplet would have to. See
//! DESIGN.md for why that sidesteps the original "port read back from the
//! URL" fragility entirely.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use crate::worker::Worker;
use crate::AppState;

const X_WORKER: &str = "X-Worker";
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Headers that must not be forwarded verbatim between hops. RFC 7230 §6.1
/// plus the handful Go's `httputil.ReverseProxy` also strips.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub async fn dispatch(State(state): State<Arc<AppState>>, req: axum::extract::Request) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("failed to read request body: {e}"))
                .into_response();
        }
    };

    let timeout = resolve_timeout(&state, &parts.headers);
    let worker = state.pool.acquire().await;

    let outbound = build_request(
        &state.http,
        &worker,
        &parts.method,
        &parts.uri,
        &parts.headers,
        body_bytes,
    );

    match tokio::time::timeout(timeout, outbound.send()).await {
        Ok(Ok(resp)) => on_response(&state, worker, resp).await,
        Ok(Err(err)) => on_error(&state, worker, DispatchError::Transport(err)).await,
        Err(_elapsed) => on_error(&state, worker, DispatchError::Timeout).await,
    }
}

/// Resolve the per-request deadline: the override header, if configured and
/// parseable, otherwise the default. Any parse failure falls back silently —
/// never surfaced to the client as an error.
fn resolve_timeout(state: &AppState, headers: &HeaderMap) -> Duration {
    if state.config.header.is_empty() {
        return state.config.timeout;
    }
    let Some(value) = headers.get(state.config.header.as_str()) else {
        return state.config.timeout;
    };
    let Ok(value) = value.to_str() else {
        return state.config.timeout;
    };
    humantime::parse_duration(value).unwrap_or(state.config.timeout)
}

fn build_request(
    client: &reqwest::Client,
    worker: &Worker,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: axum::body::Bytes,
) -> reqwest::RequestBuilder {
    let url = target_url(worker.port, uri);
    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

    let mut builder = client.request(reqwest_method, url).body(body);

    let mut has_user_agent = false;
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        if lower == "user-agent" {
            has_user_agent = true;
        }
        if let Ok(v) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) {
            builder = builder.header(name.as_str(), v);
        }
    }
    // Suppress reqwest's default User-Agent when the client didn't send one.
    if !has_user_agent {
        builder = builder.header(reqwest::header::USER_AGENT, "");
    }

    builder
}

/// Worker endpoint URL: `http://127.0.0.1:<port>` joined with the request's
/// path and raw query. There is no per-worker path prefix in this design
/// (every worker runs the same backend), so the join degenerates to the
/// request path verbatim; `join_query` is kept general because it's a named
/// boundary behavior in the spec (concatenate with `&` only when both sides
/// are non-empty).
fn target_url(port: u16, uri: &Uri) -> String {
    const PATH_PREFIX: &str = "";
    let path = format!("{PATH_PREFIX}{}", uri.path());
    match uri.query() {
        Some(q) if !q.is_empty() => format!("http://127.0.0.1:{port}{path}?{}", join_query("", q)),
        _ => format!("http://127.0.0.1:{port}{path}"),
    }
}

fn join_query(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => String::new(),
        (true, false) => b.to_string(),
        (false, true) => a.to_string(),
        (false, false) => format!("{a}&{b}"),
    }
}

async fn on_response(state: &AppState, worker: Arc<Worker>, resp: reqwest::Response) -> Response {
    let status = resp.status();
    let headers = strip_hop_by_hop(resp.headers());
    let body = resp.bytes().await.unwrap_or_default();

    state.pool.release(worker.clone());

    let mut builder = Response::builder().status(status.as_u16());
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    let mut response = builder.body(Body::from(body)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
    });
    stamp_worker_header(&mut response, &worker);
    response
}

/// Drop hop-by-hop headers from an upstream response before relaying it, the
/// same way they're dropped when building the outbound request — the body
/// here is always fully buffered, so a worker-sent `Transfer-Encoding:
/// chunked` would otherwise describe framing the response no longer has.
fn strip_hop_by_hop(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
            if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                out.append(name, value);
            }
        }
    }
    out
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("worker did not respond before the deadline")]
    Timeout,
    #[error("worker request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

async fn on_error(state: &AppState, worker: Arc<Worker>, err: DispatchError) -> Response {
    state.pool.release(worker.clone());

    let pid = worker.pid();
    let body = match err {
        DispatchError::Timeout => {
            warn!(pid, port = worker.port, "worker timed out, forcing restart");
            state.metrics.worker_restarts.inc();
            worker.cancel();
            json!({
                "error": {
                    "code": 503,
                    "reason": "hss_worker_timeout",
                    "description": format!(
                        "Worker (pid: {pid}) failed to highlight file; restarting it"
                    ),
                }
            })
        }
        DispatchError::Transport(e) => {
            error!(pid, port = worker.port, err = %e, "worker request failed");
            json!({
                "error": {
                    "code": 503,
                    "reason": "hss_worker_unknown_error",
                    "description": format!("Worker (pid: {pid}) unknown error: {e}"),
                }
            })
        }
    };

    let mut response = (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response();
    stamp_worker_header(&mut response, &worker);
    response
}

fn stamp_worker_header(response: &mut Response, worker: &Worker) {
    if let Ok(value) = HeaderValue::from_str(&worker.pid().to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-worker"), value);
    }
}
