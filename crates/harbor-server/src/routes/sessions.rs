//! Session lifecycle endpoints.

use crate::auth::Caller;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use harbor_core::realtime::Role;
use harbor_core::{CoreError, CreateSessionRequest, PublicSession, SessionId};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub project_id: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FailureBody {
    pub message: String,
}

/// `POST /sessions`
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<(StatusCode, Json<PublicSession>)> {
    caller.require_role(&body.project_id, &[Role::Owner, Role::Editor])?;
    let request = CreateSessionRequest {
        project_id: body.project_id,
        user_id: caller.0.id.clone(),
        device_type: body.device_type.unwrap_or_else(|| "desktop".into()),
        tier: body.tier,
    };
    let session = state.registry.create_session(request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /sessions/:id`
pub async fn status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<PublicSession>> {
    let session = lookup(&state, &id.into()).await?;
    caller.require_session_access(&session)?;
    Ok(Json(session))
}

/// `DELETE /sessions/:id`
pub async fn destroy(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<PublicSession>> {
    let id = SessionId::from(id);
    let session = lookup(&state, &id).await?;
    caller.require_role(&session.project_id, &[Role::Owner, Role::Editor, Role::Service])?;
    Ok(Json(state.registry.destroy_session(&id).await?))
}

/// `POST /sessions/:id/error`, used by agents that cannot boot.
pub async fn report_failure(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<FailureBody>,
) -> ApiResult<Json<PublicSession>> {
    let id = SessionId::from(id);
    let session = lookup(&state, &id).await?;
    caller.require_role(&session.project_id, &[Role::Service])?;
    Ok(Json(state.registry.report_failure(&id, body.message).await?))
}

/// `GET /users/:user_id/sessions`
pub async fn list_for_user(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<PublicSession>>> {
    let id = caller.require_user()?;
    if id != user_id && !caller.0.system {
        return Err(CoreError::AccessDenied(format!("{id} may not list sessions of {user_id}")).into());
    }
    Ok(Json(state.registry.list_sessions(&user_id).await?))
}

pub(crate) async fn lookup(state: &AppState, id: &SessionId) -> ApiResult<PublicSession> {
    state
        .registry
        .get_session_status(id)
        .await?
        .ok_or_else(|| CoreError::SessionNotFound(id.clone()).into())
}
