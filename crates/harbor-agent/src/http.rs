//! Health endpoint and preview proxy.
//!
//! ## Endpoints
//!
//! - `GET /health` - Readiness of the dev server and realtime link
//! - everything else - Proxied to the dev server on `127.0.0.1:{port}`
//!
//! Requests addressed to another session's preview host are answered with a
//! one-time replay hint (`307` + `harbor-replay: instance=...`) when the
//! owning instance can be found, and `421 Misdirected Request` otherwise.

use crate::env::BootEnv;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, Uri, HeaderName, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use harbor_core::realtime::ConnectionState;
use harbor_core::SessionId;
use harbor_machine::Provisioner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Header carrying the replay target; its presence on a request marks the
/// replay as already attempted.
pub const REPLAY_HEADER: &str = "harbor-replay";

/// Largest request body forwarded to the dev server.
const MAX_PROXY_BODY: usize = 32 * 1024 * 1024;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared request-handling state.
#[derive(Clone)]
pub struct AgentState {
    session_id: String,
    project_id: String,
    preview_domain: String,
    upstream: String,
    dev_ready: Arc<AtomicBool>,
    realtime: Option<watch::Receiver<ConnectionState>>,
    replay: Option<Provisioner>,
    http: reqwest::Client,
}

impl AgentState {
    pub fn new(env: &BootEnv, dev_ready: Arc<AtomicBool>) -> anyhow::Result<Self> {
        Ok(Self {
            session_id: env.session_id.clone(),
            project_id: env.project_id.clone(),
            preview_domain: env.preview_domain.clone(),
            upstream: format!("http://127.0.0.1:{}", env.preview_port),
            dev_ready,
            realtime: None,
            replay: None,
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(Duration::from_secs(60))
                .build()?,
        })
    }

    /// Report realtime link state on `/health`.
    pub fn with_realtime(mut self, state: watch::Receiver<ConnectionState>) -> Self {
        self.realtime = Some(state);
        self
    }

    /// Enable replay lookups for misdirected requests.
    pub fn with_replay(mut self, provisioner: Provisioner) -> Self {
        self.replay = Some(provisioner);
        self
    }

    fn realtime_status(&self) -> &'static str {
        match self.realtime.as_ref().map(|rx| *rx.borrow()) {
            None => "disabled",
            Some(ConnectionState::Idle) => "idle",
            Some(ConnectionState::Connected) => "connected",
            Some(ConnectionState::Reconnecting { .. }) => "reconnecting",
            Some(ConnectionState::Disconnected) => "disconnected",
        }
    }

    /// Session a preview host names, if it is not ours.
    fn foreign_session(&self, headers: &HeaderMap) -> Option<String> {
        let host = headers.get(header::HOST)?.to_str().ok()?;
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        };
        let label = host.strip_suffix(&format!(".{}", self.preview_domain))?;
        let (session, port) = label.rsplit_once('-')?;
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        (session != self.session_id).then(|| session.to_string())
    }
}

/// Build the agent router.
pub fn build_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(proxy_handler)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AgentState>) -> impl IntoResponse {
    let ready = state.dev_ready.load(Ordering::Relaxed);
    Json(serde_json::json!({
        "status": if ready { "ready" } else { "starting" },
        "sessionId": state.session_id,
        "projectId": state.project_id,
        "devServerReady": ready,
        "realtime": state.realtime_status(),
    }))
}

async fn proxy_handler(State(state): State<AgentState>, request: Request) -> Response {
    if let Some(other) = state.foreign_session(request.headers()) {
        return misdirected(&state, &other, request.headers(), request.uri()).await;
    }
    if !state.dev_ready.load(Ordering::Relaxed) {
        return starting_page();
    }

    match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "Proxy to dev server failed");
            (StatusCode::BAD_GATEWAY, "dev server unavailable").into_response()
        }
    }
}

async fn misdirected(state: &AgentState, other: &str, headers: &HeaderMap, uri: &Uri) -> Response {
    if headers.contains_key(REPLAY_HEADER) {
        tracing::warn!(target_session = %other, "Replayed request still misdirected");
        return StatusCode::MISDIRECTED_REQUEST.into_response();
    }
    let Some(provisioner) = &state.replay else {
        return StatusCode::MISDIRECTED_REQUEST.into_response();
    };

    let name = SessionId::from(other).machine_name();
    match provisioner.find_by_name(&name).await {
        Ok(Some(instance_id)) => {
            tracing::info!(target_session = %other, %instance_id, "Replaying misdirected request");
            let location = uri
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_string();
            let replay = format!("instance={instance_id}");
            let mut response = StatusCode::TEMPORARY_REDIRECT.into_response();
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&replay) {
                headers.insert(HeaderName::from_static(REPLAY_HEADER), value);
            }
            if let Ok(value) = HeaderValue::from_str(&location) {
                headers.insert(header::LOCATION, value);
            }
            response
        }
        Ok(None) => {
            tracing::warn!(target_session = %other, "No instance for misdirected request");
            StatusCode::MISDIRECTED_REQUEST.into_response()
        }
        Err(e) => {
            tracing::warn!(target_session = %other, error = %e, "Replay lookup failed");
            StatusCode::MISDIRECTED_REQUEST.into_response()
        }
    }
}

fn starting_page() -> Response {
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        Html(
            r#"<!DOCTYPE html>
<html>
<head>
    <title>Starting preview</title>
    <meta http-equiv="refresh" content="2">
    <style>
        body { font-family: system-ui; max-width: 600px; margin: 80px auto; text-align: center; }
    </style>
</head>
<body>
    <h1>Starting preview</h1>
    <p>The dev server is booting. This page refreshes automatically.</p>
</body>
</html>"#,
        ),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("2"));
    response
}

async fn forward(state: &AgentState, request: Request) -> anyhow::Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let body = to_bytes(body, MAX_PROXY_BODY).await?;

    let mut upstream = state
        .http
        .request(parts.method.clone(), format!("{}{path}", state.upstream))
        .body(body);
    for (name, value) in &parts.headers {
        if name != header::HOST && !is_hop_by_hop(name) {
            upstream = upstream.header(name, value);
        }
    }
    let reply = upstream.send().await?;

    let mut response = Response::builder().status(reply.status());
    if let Some(headers) = response.headers_mut() {
        for (name, value) in reply.headers() {
            if !is_hop_by_hop(name) {
                headers.append(name, value.clone());
            }
        }
    }
    let bytes = reply.bytes().await?;
    Ok(response.body(Body::from(bytes))?)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Start the HTTP server.
///
/// Runs until `shutdown` resolves.
pub async fn serve(
    state: AgentState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting agent HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
