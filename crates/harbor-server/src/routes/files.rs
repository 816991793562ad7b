//! Versioned project file endpoints.

use crate::auth::Caller;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use harbor_core::files::{BulkEntry, BulkResult, FileKind, FileRecord, FileSummary};
use harbor_core::realtime::Access;
use harbor_core::CoreError;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathQuery {
    pub path: String,
    /// Return tombstones too (audit lookups).
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertBody {
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: FileKind,
    /// Version the writer believes current; omitted for a new file.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkBody {
    pub files: Vec<BulkEntry>,
}

/// `GET /projects/:project/files?path=`
pub async fn get_file(
    State(state): State<AppState>,
    caller: Caller,
    Path(project): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<FileRecord>> {
    caller.authorize_files(&state, &project, Access::Subscribe)?;
    let record = state
        .files
        .get(&project, &query.path, query.include_deleted)
        .await?
        .ok_or_else(|| CoreError::FileNotFound(query.path.clone()))?;
    Ok(Json(record))
}

/// `PUT /projects/:project/files?path=`
pub async fn put_file(
    State(state): State<AppState>,
    caller: Caller,
    Path(project): Path<String>,
    Query(query): Query<PathQuery>,
    Json(body): Json<UpsertBody>,
) -> ApiResult<Json<FileSummary>> {
    caller.authorize_files(&state, &project, Access::Publish)?;
    let summary = state
        .files
        .upsert(
            &project,
            &query.path,
            body.content,
            body.kind,
            body.expected_version,
        )
        .await?;
    Ok(Json(summary))
}

/// `DELETE /projects/:project/files?path=&expectedVersion=`
pub async fn delete_file(
    State(state): State<AppState>,
    caller: Caller,
    Path(project): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<FileSummary>> {
    caller.authorize_files(&state, &project, Access::Publish)?;
    let record = state
        .files
        .delete(&project, &query.path, query.expected_version)
        .await?;
    Ok(Json(record.summary()))
}

/// `GET /projects/:project/files/all`
pub async fn list_files(
    State(state): State<AppState>,
    caller: Caller,
    Path(project): Path<String>,
) -> ApiResult<Json<Vec<FileRecord>>> {
    caller.authorize_files(&state, &project, Access::Subscribe)?;
    Ok(Json(state.files.list_current(&project).await?))
}

/// `POST /projects/:project/files/bulk`
///
/// A rejected batch answers `409` with the per-file outcomes.
pub async fn bulk(
    State(state): State<AppState>,
    caller: Caller,
    Path(project): Path<String>,
    Json(body): Json<BulkBody>,
) -> ApiResult<(StatusCode, Json<BulkResult>)> {
    caller.authorize_files(&state, &project, Access::Publish)?;
    let result = state.files.bulk_upsert(&project, body.files).await?;
    Ok((batch_status(&result), Json(result)))
}

/// `GET /projects/:project/snapshot`
pub async fn export_snapshot(
    State(state): State<AppState>,
    caller: Caller,
    Path(project): Path<String>,
) -> ApiResult<Response> {
    caller.authorize_files(&state, &project, Access::Subscribe)?;
    let archive = state.files.export_snapshot(&project).await?;
    let disposition = format!("attachment; filename=\"{project}.tar.gz\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}

/// `POST /projects/:project/snapshot` with a `tar.gz` body.
pub async fn import_snapshot(
    State(state): State<AppState>,
    caller: Caller,
    Path(project): Path<String>,
    archive: Bytes,
) -> ApiResult<(StatusCode, Json<BulkResult>)> {
    caller.authorize_files(&state, &project, Access::Publish)?;
    let result = state.files.import_snapshot(&project, archive.to_vec()).await?;
    Ok((batch_status(&result), Json(result)))
}

fn batch_status(result: &BulkResult) -> StatusCode {
    if result.applied {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    }
}
