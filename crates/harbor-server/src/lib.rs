//! # harbor-server
//!
//! HTTP and WebSocket API in front of the Harbor session registry, the
//! versioned project file store and the realtime channel bus.
//!
//! ## Endpoints
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /sessions` | Create a preview session |
//! | `GET /sessions/:id` | Session status |
//! | `DELETE /sessions/:id` | Destroy a session (idempotent) |
//! | `POST /sessions/:id/error` | Agent-reported boot failure |
//! | `GET /users/:user_id/sessions` | A user's sessions |
//! | `GET/PUT/DELETE /projects/:project/files?path=` | Versioned file access |
//! | `GET /projects/:project/files/all` | Current (non-deleted) files |
//! | `POST /projects/:project/files/bulk` | All-or-nothing batch write |
//! | `GET/POST /projects/:project/snapshot` | `tar.gz` export and import |
//! | `GET /realtime/:channel` | WebSocket subscription |
//! | `POST /realtime/:channel` | Publish an event |
//! | `GET /health` | Health check |
//!
//! Every route except `/health` is subject to a per-user rate limit.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{ConfigError, ServerConfig};
pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Largest accepted request body (snapshot imports).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    let api = Router::new()
        .route("/sessions", post(routes::sessions::create))
        .route(
            "/sessions/:id",
            get(routes::sessions::status).delete(routes::sessions::destroy),
        )
        .route("/sessions/:id/error", post(routes::sessions::report_failure))
        .route("/users/:user_id/sessions", get(routes::sessions::list_for_user))
        .route(
            "/projects/:project/files",
            get(routes::files::get_file)
                .put(routes::files::put_file)
                .delete(routes::files::delete_file),
        )
        .route("/projects/:project/files/all", get(routes::files::list_files))
        .route("/projects/:project/files/bulk", post(routes::files::bulk))
        .route(
            "/projects/:project/snapshot",
            get(routes::files::export_snapshot).post(routes::files::import_snapshot),
        )
        .route(
            "/realtime/:channel",
            get(routes::realtime::subscribe).post(routes::realtime::publish),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::rate_limit,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// Runs until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting Harbor API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
