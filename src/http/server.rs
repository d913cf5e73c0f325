//! The agent's HTTP control plane.
//!
//! Every endpoint is also reachable under the `/node/1` prefix, kept as a
//! compatibility alias for older coordinators. Unknown GETs are answered
//! 404 and feed the ban list; other unknown methods get 400. Responses
//! are JSON on success and plain text on error, matching what the
//! coordinator expects.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, OriginalUri, Path, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::banlist::BanList;
use crate::node::ArrasNode;
use crate::session::Sessions;
use crate::{NodeError, Result};

/// Control plane API version reported by `/status`.
pub const NODE_API_VERSION: &str = "4.5";

/// Shared state behind every handler.
pub struct HttpState {
    pub node: Arc<ArrasNode>,
    pub sessions: Arc<Sessions>,
    pub ban_list: Option<Arc<BanList>>,
}

/// Bind the control plane and start serving.
///
/// `port` 0 lets the OS pick; the chosen port is returned.
///
/// # Errors
///
/// `NodeError::Io` when the listener cannot be bound.
pub async fn start(
    state: Arc<HttpState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<(u16, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let port = listener.local_addr()?.port();
    info!(port, "node control plane listening");

    let app = build_router(state);
    let handle = tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned());
        if let Err(err) = serve.await {
            warn!(%err, "http server exited with error");
        }
    });
    Ok((port, handle))
}

/// Build the route table. Public for in-process tests.
pub fn build_router(state: Arc<HttpState>) -> Router {
    let router = Router::new()
        .route("/node/1/health", get(get_health))
        .route("/node/1/status", get(get_status))
        .route("/node/1/sessions", get(get_sessions).post(post_sessions))
        .route("/node/1/sessions/:id/status", get(get_session_status).put(put_session_status))
        .route("/node/1/sessions/:id/performance", get(get_session_performance))
        .route("/node/1/sessions/modify", put(put_sessions_modify))
        .route("/node/1/sessions/:id", delete(delete_session))
        .route("/sessions", post(post_sessions))
        .route("/sessions/modify", put(put_sessions_modify))
        .route("/sessions/:id/status", put(put_session_status))
        .route("/sessions/:id", delete(delete_session))
        .route("/registration", put(put_status))
        .route("/status", put(put_status))
        .route("/node/tags", put(put_tags).delete(delete_tags))
        .route("/node/tag/:name", delete(delete_tag))
        // keep browsers from getting banned over their icon requests
        .route("/favicon.ico", get(|| async { StatusCode::NOT_FOUND }))
        .fallback(unknown_endpoint)
        .with_state(Arc::clone(&state));
    router.layer(middleware::from_fn_with_state(state, ban_check))
}

/// Refuse banned sources before routing. Only GET traffic is subject to
/// the ban; the coordinator's own methods are never refused.
async fn ban_check(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::GET {
        if let Some(ban_list) = &state.ban_list {
            if ban_list.is_banned(&addr.ip().to_string()) {
                return StatusCode::TOO_MANY_REQUESTS.into_response();
            }
        }
    }
    next.run(request).await
}

async fn unknown_endpoint(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    OriginalUri(uri): OriginalUri,
) -> Response {
    if method == Method::GET {
        warn!(%uri, "unsupported GET endpoint");
        if let Some(ban_list) = &state.ban_list {
            ban_list.track(&addr.ip().to_string());
        }
        (StatusCode::NOT_FOUND, format!("Unsupported GET endpoint: {uri}")).into_response()
    } else {
        warn!(%method, %uri, "unsupported endpoint");
        (
            StatusCode::BAD_REQUEST,
            format!("Unsupported {method} endpoint: {uri}"),
        )
            .into_response()
    }
}

// ── GET ─────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<HttpState>>) -> Response {
    match state.node.check_health() {
        Ok(()) => ok_json(serde_json::json!({ "status": "UP" })),
        Err(err) => down_response(&err),
    }
}

/// Health plus idle timings, the ban list summary and the API version.
async fn get_status(State(state): State<Arc<HttpState>>) -> Response {
    match state.node.check_health() {
        Ok(()) => {
            let mut body = serde_json::json!({ "status": "UP" });
            merge(&mut body, state.sessions.get_idle_status());
            if let Some(ban_list) = &state.ban_list {
                merge(&mut body, ban_list.summary());
            }
            body["apiVersion"] = Value::String(NODE_API_VERSION.into());
            ok_json(body)
        }
        Err(err) => down_response(&err),
    }
}

async fn get_sessions(State(state): State<Arc<HttpState>>) -> Response {
    let ids: Vec<String> = state
        .sessions
        .active_session_ids()
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    ok_json(serde_json::json!(ids))
}

async fn get_session_status(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Response {
    respond(parse_id(&id).and_then(|id| state.sessions.get_status(id)))
}

async fn get_session_performance(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Response {
    respond(parse_id(&id).and_then(|id| state.sessions.get_performance(id)))
}

// ── Session lifecycle ───────────────────────────────────────────────────

async fn post_sessions(State(state): State<Arc<HttpState>>, body: String) -> Response {
    let sessions = Arc::clone(&state.sessions);
    respond(sessions.create_session(payload(&body)).await)
}

async fn put_sessions_modify(State(state): State<Arc<HttpState>>, body: String) -> Response {
    respond(state.sessions.modify_session(payload(&body)))
}

async fn put_session_status(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    respond(
        parse_id(&id)
            .and_then(|id| state.sessions.signal_session(id, &payload(&body)))
            .map(|()| success()),
    )
}

async fn delete_session(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let reason = headers
        .get("X-Session-Delete-Reason")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    respond(
        parse_id(&id)
            .and_then(|id| state.sessions.delete_session(id, &reason))
            .map(|()| success()),
    )
}

// ── Node status and tags ────────────────────────────────────────────────

/// `{"status": "shutdown" | "close" | "unregistered"}`.
async fn put_status(State(state): State<Arc<HttpState>>, body: String) -> Response {
    respond(state.node.set_status(&payload(&body)).map(|()| success()))
}

async fn put_tags(State(state): State<Arc<HttpState>>, body: String) -> Response {
    respond(state.node.update_tags(payload(&body)).map(|()| success()))
}

async fn delete_tag(State(state): State<Arc<HttpState>>, Path(name): Path<String>) -> Response {
    respond(
        state
            .node
            .delete_tags(serde_json::json!([name]))
            .map(|()| success()),
    )
}

async fn delete_tags(State(state): State<Arc<HttpState>>, body: String) -> Response {
    respond(state.node.delete_tags(payload(&body)).map(|()| success()))
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn payload(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or(Value::Null)
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| NodeError::NotFound(format!("invalid session id '{raw}'")))
}

fn success() -> Value {
    serde_json::json!({ "success": "true" })
}

fn respond(result: Result<Value>) -> Response {
    match result {
        Ok(body) => ok_json(body),
        Err(err) => error_response(&err),
    }
}

fn ok_json(body: Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn error_response(err: &NodeError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

fn down_response(err: &NodeError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({ "status": "DOWN", "info": err.to_string() })),
    )
        .into_response()
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        for (key, value) in extra {
            target.insert(key, value);
        }
    }
}
