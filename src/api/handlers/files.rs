use crate::api::error::AppError;
use crate::entities::stored_files::{self, FileKind, ProcessingStatus};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::io::StreamReader;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct FileResponse {
    pub id: String,
    pub shoot_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub kind: FileKind,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
}

impl From<stored_files::Model> for FileResponse {
    fn from(file: stored_files::Model) -> Self {
        Self {
            id: file.id,
            shoot_id: file.shoot_id,
            original_name: file.original_name,
            mime_type: file.mime_type,
            size_bytes: file.size_bytes,
            kind: file.kind,
            processing_status: file.processing_status,
            created_at: file.created_at,
        }
    }
}

pub(crate) fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

#[utoipa::path(
    post,
    path = "/shoots/{shoot_id}/files",
    params(
        ("shoot_id" = String, Path, description = "Shoot the file belongs to")
    ),
    request_body(content = Multipart, description = "Multipart form with a `file` field"),
    responses(
        (status = 201, description = "File stored", body = FileResponse),
        (status = 400, description = "Missing or invalid file"),
        (status = 413, description = "File too large")
    ),
    tag = "files"
)]
pub async fn upload_file(
    State(state): State<crate::AppState>,
    Path(shoot_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<FileResponse>), AppError> {
    let mut stored = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        let err_msg = e.to_string();
        if err_msg.contains("length limit exceeded") {
            AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
        } else {
            AppError::BadRequest(err_msg)
        }
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or("unnamed").to_string();
        let content_type = field.content_type().map(|s| s.to_string());

        let reader = StreamReader::new(field.map_err(std::io::Error::other));

        stored = Some(
            state
                .file_service
                .store_file(&shoot_id, reader, &original_name, content_type.as_deref())
                .await?,
        );
        break;
    }

    let file = stored.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;

    Ok((StatusCode::CREATED, Json(file.into())))
}

#[utoipa::path(
    get,
    path = "/shoots/{shoot_id}/files",
    params(
        ("shoot_id" = String, Path, description = "Shoot ID")
    ),
    responses(
        (status = 200, description = "Files of the shoot", body = Vec<FileResponse>)
    ),
    tag = "files"
)]
pub async fn list_files(
    State(state): State<crate::AppState>,
    Path(shoot_id): Path<String>,
) -> Result<Json<Vec<FileResponse>>, AppError> {
    let files = state.file_service.list_files(&shoot_id).await?;
    Ok(Json(files.into_iter().map(FileResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/files/{id}",
    params(
        ("id" = String, Path, description = "File ID")
    ),
    responses(
        (status = 200, description = "File record", body = FileResponse),
        (status = 404, description = "File not found")
    ),
    tag = "files"
)]
pub async fn get_file(
    State(state): State<crate::AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<FileResponse>, AppError> {
    let file = state.file_service.get_file(&file_id).await?;
    Ok(Json(file.into()))
}

#[utoipa::path(
    get,
    path = "/files/{id}/download",
    params(
        ("id" = String, Path, description = "File ID")
    ),
    responses(
        (status = 200, description = "Full file stream"),
        (status = 206, description = "Partial content"),
        (status = 404, description = "File or file data not found"),
        (status = 416, description = "Range not satisfiable")
    ),
    tag = "files"
)]
pub async fn download_file(
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    state
        .downloads
        .file_response(&file_id, range_header(&headers))
        .await
}

#[utoipa::path(
    delete,
    path = "/files/{id}",
    params(
        ("id" = String, Path, description = "File ID")
    ),
    responses(
        (status = 204, description = "File deleted"),
        (status = 404, description = "File not found")
    ),
    tag = "files"
)]
pub async fn delete_file(
    State(state): State<crate::AppState>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.file_service.delete_file(&file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
