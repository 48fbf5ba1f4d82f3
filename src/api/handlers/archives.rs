use crate::api::error::AppError;
use crate::api::handlers::files::range_header;
use crate::entities::archives::{self, ArchiveStatus, ArchiveType};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Deserialize, ToSchema, Validate)]
pub struct CreateArchiveRequest {
    #[serde(rename = "type")]
    pub archive_type: ArchiveType,
    #[validate(length(min = 1, max = 10000, message = "file_ids must not be empty"))]
    pub file_ids: Option<Vec<String>>,
}

#[derive(Serialize, ToSchema)]
pub struct ArchiveResponse {
    pub id: String,
    pub shoot_id: String,
    #[serde(rename = "type")]
    pub archive_type: ArchiveType,
    pub status: ArchiveStatus,
    pub size_bytes: i64,
    pub estimated_size_bytes: i64,
    pub file_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Present once the archive can be downloaded.
    pub download_url: Option<String>,
}

impl From<archives::Model> for ArchiveResponse {
    fn from(archive: archives::Model) -> Self {
        let download_url = (archive.status == ArchiveStatus::Completed)
            .then(|| format!("/archives/{}/download", archive.id));

        Self {
            id: archive.id,
            shoot_id: archive.shoot_id,
            archive_type: archive.archive_type,
            status: archive.status,
            size_bytes: archive.size_bytes,
            estimated_size_bytes: archive.estimated_size_bytes,
            file_count: archive.file_count,
            error_message: archive.error_message,
            created_at: archive.created_at,
            completed_at: archive.completed_at,
            expires_at: archive.expires_at,
            download_url,
        }
    }
}

#[utoipa::path(
    post,
    path = "/shoots/{shoot_id}/archives",
    params(
        ("shoot_id" = String, Path, description = "Shoot ID")
    ),
    request_body = CreateArchiveRequest,
    responses(
        (status = 202, description = "Archive accepted for generation", body = ArchiveResponse),
        (status = 413, description = "Archive would exceed the size limit"),
        (status = 422, description = "No files matched")
    ),
    tag = "archives"
)]
pub async fn create_archive(
    State(state): State<crate::AppState>,
    Path(shoot_id): Path<String>,
    Json(req): Json<CreateArchiveRequest>,
) -> Result<(StatusCode, Json<ArchiveResponse>), AppError> {
    req.validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let archive = state
        .archive_service
        .create(&shoot_id, req.archive_type, req.file_ids)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(archive.into())))
}

#[utoipa::path(
    get,
    path = "/shoots/{shoot_id}/archives",
    params(
        ("shoot_id" = String, Path, description = "Shoot ID")
    ),
    responses(
        (status = 200, description = "Archives of the shoot", body = Vec<ArchiveResponse>)
    ),
    tag = "archives"
)]
pub async fn list_archives(
    State(state): State<crate::AppState>,
    Path(shoot_id): Path<String>,
) -> Result<Json<Vec<ArchiveResponse>>, AppError> {
    let archives = state.archive_service.list(&shoot_id).await?;
    Ok(Json(archives.into_iter().map(ArchiveResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/archives/{id}",
    params(
        ("id" = String, Path, description = "Archive ID")
    ),
    responses(
        (status = 200, description = "Archive status", body = ArchiveResponse),
        (status = 404, description = "Archive not found")
    ),
    tag = "archives"
)]
pub async fn get_archive(
    State(state): State<crate::AppState>,
    Path(archive_id): Path<String>,
) -> Result<Json<ArchiveResponse>, AppError> {
    let archive = state.archive_service.get(&archive_id).await?;
    Ok(Json(archive.into()))
}

#[utoipa::path(
    get,
    path = "/archives/{id}/download",
    params(
        ("id" = String, Path, description = "Archive ID")
    ),
    responses(
        (status = 200, description = "ZIP stream"),
        (status = 206, description = "Partial content"),
        (status = 404, description = "Archive not found or not ready"),
        (status = 410, description = "Archive expired"),
        (status = 416, description = "Range not satisfiable")
    ),
    tag = "archives"
)]
pub async fn download_archive(
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Path(archive_id): Path<String>,
) -> Result<Response, AppError> {
    state
        .archive_service
        .download(&archive_id, range_header(&headers))
        .await
}

#[utoipa::path(
    delete,
    path = "/archives/{id}",
    params(
        ("id" = String, Path, description = "Archive ID")
    ),
    responses(
        (status = 204, description = "Archive deleted"),
        (status = 404, description = "Archive not found")
    ),
    tag = "archives"
)]
pub async fn delete_archive(
    State(state): State<crate::AppState>,
    Path(archive_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.archive_service.delete(&archive_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
