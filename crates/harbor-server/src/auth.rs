//! Caller identity and the API-boundary rate limit.
//!
//! Authentication happens at the gateway, which forwards the caller's id in
//! `x-harbor-user` and project roles in `x-harbor-roles`
//! (`project:role,project:role`).

use crate::error::ApiError;
use crate::state::AppState;
use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use harbor_core::realtime::{files_channel, Access, Role, Subject, ROLES_HEADER, USER_HEADER};
use harbor_core::{CoreError, PublicSession};

/// The subject making a request.
#[derive(Debug, Clone)]
pub struct Caller(pub Subject);

impl Caller {
    /// Fail unless the caller is authenticated.
    pub fn require_user(&self) -> Result<&str, ApiError> {
        if self.0.authenticated {
            Ok(&self.0.id)
        } else {
            Err(CoreError::AccessDenied("authentication required".into()).into())
        }
    }

    /// Fail unless the caller holds one of `roles` in `project_id`.
    pub fn require_role(&self, project_id: &str, roles: &[Role]) -> Result<(), ApiError> {
        self.require_user()?;
        if self.0.system
            || self
                .0
                .project_roles
                .get(project_id)
                .is_some_and(|role| roles.contains(role))
        {
            Ok(())
        } else {
            Err(CoreError::AccessDenied(format!(
                "{} lacks the required role in project {project_id}",
                self.0.id
            ))
            .into())
        }
    }

    /// Fail unless the caller created `session` or serves its project.
    pub fn require_session_access(&self, session: &PublicSession) -> Result<(), ApiError> {
        let id = self.require_user()?;
        if self.0.system
            || id == session.user_id
            || self.0.project_roles.get(&session.project_id) == Some(&Role::Service)
        {
            Ok(())
        } else {
            Err(CoreError::AccessDenied(format!(
                "{id} may not access session {}",
                session.session_id
            ))
            .into())
        }
    }

    /// Authorise file access through the project's file channel policy.
    pub fn authorize_files(
        &self,
        state: &AppState,
        project_id: &str,
        access: Access,
    ) -> Result<(), ApiError> {
        state
            .bus
            .policies()
            .evaluate(&files_channel(project_id), &self.0, access, 0)?;
        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Subject described by the gateway headers.
pub fn subject_from_headers(headers: &HeaderMap) -> Result<Subject, CoreError> {
    let Some(user) = header(headers, USER_HEADER) else {
        return Ok(Subject::anonymous());
    };
    let subject = Subject::user(user);
    match header(headers, ROLES_HEADER) {
        Some(roles) => subject.with_roles_header(roles),
        None => Ok(subject),
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller(subject_from_headers(&parts.headers)?))
    }
}

/// Reject callers that exceed their per-minute budget.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let key = header(request.headers(), USER_HEADER).unwrap_or("anonymous");
    let decision = state.api_limiter.check_and_increment(&format!("api|{key}"));
    if !decision.allowed {
        let retry_after = decision
            .retry_after
            .unwrap_or(std::time::Duration::from_secs(1));
        tracing::debug!(user = %key, ?retry_after, "API rate limit exceeded");
        return ApiError(CoreError::RateLimited { retry_after }).into_response();
    }
    next.run(request).await
}
