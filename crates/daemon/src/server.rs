use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sitevault_core::{
    ArchiveRecord, BackupOutcome, DbCredentials, ErrorKind, OpError, ProjectConfig, RestoreOutcome,
    RestoreScope, SourceLocation, TimeOfDay,
};

use crate::vault::{ProjectSummary, RemovedProject, Vault};

#[derive(Clone)]
pub struct AppState {
    pub vault: Vault,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/projects", get(list_projects))
        .route(
            "/api/v1/projects/{name}",
            put(upsert_project).delete(delete_project),
        )
        .route("/api/v1/projects/{name}/backup", post(backup_project))
        .route("/api/v1/projects/{name}/archives", get(list_archives))
        .route("/api/v1/projects/{name}/restore", post(restore_project))
        .with_state(state)
}

/// Error body: `{ "kind": ..., "message": ... }`.
pub struct ApiError(OpError);

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::LockContention => StatusCode::CONFLICT,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(self.0.kind()), Json(self.0)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProjectSummary>>, Response> {
    require_api_auth(&state, &headers).map_err(IntoResponse::into_response)?;
    let projects = state
        .vault
        .projects()
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(projects))
}

/// Registration payload. The name comes from the path.
#[derive(Debug, Deserialize)]
pub struct ProjectRequest {
    /// `/srv/app` or `[user@]host[#port]:/srv/app`.
    pub source: String,
    pub database: DbCredentials,
    #[serde(default)]
    pub backup_time: Option<String>,
}

impl ProjectRequest {
    pub fn into_config(self, name: &str) -> Result<ProjectConfig, OpError> {
        let source: SourceLocation = self.source.parse()?;
        let backup_time = match self.backup_time.as_deref() {
            None | Some("") => TimeOfDay::default(),
            Some(raw) => raw.parse()?,
        };
        Ok(ProjectConfig {
            name: name.to_owned(),
            source,
            database: self.database,
            backup_time,
        })
    }
}

async fn upsert_project(
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProjectRequest>,
) -> Result<Json<ProjectSummary>, Response> {
    require_api_auth(&state, &headers).map_err(IntoResponse::into_response)?;
    let summary = body
        .into_config(&name)
        .and_then(|config| state.vault.register(config))
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(summary))
}

async fn delete_project(
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RemovedProject>, Response> {
    require_api_auth(&state, &headers).map_err(IntoResponse::into_response)?;
    let removed = state
        .vault
        .remove(&name)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(removed))
}

async fn backup_project(
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    require_api_auth(&state, &headers)?;
    let outcome = state.vault.backup(&name).await;
    let status = match &outcome {
        BackupOutcome::Success { .. } | BackupOutcome::Partial { .. } => StatusCode::OK,
        BackupOutcome::Skipped { .. } => StatusCode::CONFLICT,
        BackupOutcome::Failed { error } => status_for(error.kind()),
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Debug, Serialize)]
struct ArchiveView {
    key: String,
    file_name: String,
    size: u64,
    last_modified: chrono::DateTime<chrono::Utc>,
}

impl From<ArchiveRecord> for ArchiveView {
    fn from(record: ArchiveRecord) -> Self {
        Self {
            file_name: record.file_name().to_owned(),
            key: record.key,
            size: record.size,
            last_modified: record.last_modified,
        }
    }
}

async fn list_archives(
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ArchiveView>>, Response> {
    require_api_auth(&state, &headers).map_err(IntoResponse::into_response)?;
    let archives = state
        .vault
        .archives(&name)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(archives.into_iter().map(ArchiveView::from).collect()))
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    archive_key: String,
    scope: String,
}

async fn restore_project(
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RestoreRequest>,
) -> Result<Response, Response> {
    require_api_auth(&state, &headers).map_err(IntoResponse::into_response)?;
    let scope: RestoreScope = body
        .scope
        .parse()
        .map_err(|e| ApiError(e).into_response())?;
    let outcome = state.vault.restore(&name, &body.archive_key, scope).await;
    let status = match &outcome {
        RestoreOutcome::Restored { .. } => StatusCode::OK,
        RestoreOutcome::Failed { error, .. } => status_for(error.kind()),
    };
    Ok((status, Json(outcome)).into_response())
}
