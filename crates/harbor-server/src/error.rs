//! Mapping of core errors onto HTTP responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use harbor_core::CoreError;
use serde_json::json;

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl ApiError {
    /// Status code and stable error code for the wrapped error.
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            CoreError::SessionNotFound(_) | CoreError::FileNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            CoreError::ConcurrencyConflict { .. } => (StatusCode::CONFLICT, "version_conflict"),
            CoreError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            CoreError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            CoreError::AccessDenied(_) => (StatusCode::FORBIDDEN, "access_denied"),
            CoreError::QuotaExceeded(_) => (StatusCode::FORBIDDEN, "quota_exceeded"),
            CoreError::Provisioning { .. } | CoreError::Machine(_) => {
                (StatusCode::BAD_GATEWAY, "provisioning_failed")
            }
            CoreError::Validation(_) | CoreError::Json(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            CoreError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "invalid_path"),
            CoreError::Snapshot(_) => (StatusCode::BAD_REQUEST, "invalid_snapshot"),
            CoreError::ChannelClosed(_) => (StatusCode::SERVICE_UNAVAILABLE, "channel_closed"),
            CoreError::Hydration(_) | CoreError::Store(_) | CoreError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, code, "Request rejected");
        }

        let mut body = json!({ "error": code, "message": self.0.to_string() });
        match &self.0 {
            CoreError::ConcurrencyConflict {
                path,
                current_version,
            } => {
                body["path"] = json!(path);
                body["currentVersion"] = json!(current_version);
            }
            CoreError::Provisioning { session_id, .. } => {
                body["sessionId"] = json!(session_id);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let CoreError::RateLimited { retry_after } = &self.0 {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
