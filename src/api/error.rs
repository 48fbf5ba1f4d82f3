use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::services::chunk_store::ChunkError;
use crate::services::storage::StorageError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File data missing from storage: {0}")]
    FileDataNotFound(String),

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Archive too large: estimated {estimated} bytes exceeds limit of {limit} bytes")]
    ArchiveTooLarge { estimated: u64, limit: u64 },

    #[error("No files matched the archive request")]
    NoFilesMatched,

    #[error("Archive not ready (status: {0})")]
    ArchiveNotReady(String),

    #[error("Archive has expired")]
    ArchiveExpired,

    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code, returned alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::StorageWrite(_) => "STORAGE_WRITE_ERROR",
            AppError::FileNotFound(_) => "FILE_NOT_FOUND",
            AppError::FileDataNotFound(_) => "FILE_DATA_NOT_FOUND",
            AppError::ArchiveNotFound(_) => "ARCHIVE_NOT_FOUND",
            AppError::ArchiveTooLarge { .. } => "ARCHIVE_TOO_LARGE",
            AppError::NoFilesMatched => "NO_FILES_MATCHED",
            AppError::ArchiveNotReady(_) => "ARCHIVE_NOT_READY",
            AppError::ArchiveExpired => "ARCHIVE_EXPIRED",
            AppError::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            AppError::Internal(_) | AppError::Anyhow(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_)
            | AppError::StorageWrite(_)
            | AppError::Internal(_)
            | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::FileNotFound(_)
            | AppError::FileDataNotFound(_)
            | AppError::ArchiveNotFound(_)
            | AppError::ArchiveNotReady(_) => StatusCode::NOT_FOUND,
            AppError::ArchiveTooLarge { .. } | AppError::PayloadTooLarge(_) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            AppError::NoFilesMatched => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ArchiveExpired => StatusCode::GONE,
            AppError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(path) => AppError::FileDataNotFound(path),
            StorageError::Write(e) => AppError::StorageWrite(e.to_string()),
            StorageError::InvalidPath(path) => {
                AppError::Internal(format!("Invalid storage path: {}", path))
            }
            StorageError::InvalidRange { .. } => AppError::Internal(err.to_string()),
            StorageError::Io(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<ChunkError> for AppError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Database(e) => AppError::Database(e),
            ChunkError::Storage(e) => e.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Internal Server Error".to_string()
            }
            AppError::StorageWrite(msg) => {
                tracing::error!("Storage write error: {}", msg);
                "Failed to persist file".to_string()
            }
            AppError::FileDataNotFound(path) => {
                // Metadata exists but the blob does not; operators alert on this.
                tracing::error!(path = %path, "File metadata/blob desync detected");
                "File data not found".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal Server Error".to_string()
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                "Internal Server Error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        let mut response = (status, body).into_response();

        if let AppError::RangeNotSatisfiable { size } = self {
            if let Ok(value) = format!("bytes */{}", size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}
