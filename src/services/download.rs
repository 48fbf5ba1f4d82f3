use async_trait::async_trait;
use axum::{
    body::Body,
    http::{StatusCode, header},
    response::Response,
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use sea_orm::{DatabaseConnection, EntityTrait};
use std::sync::Arc;

use crate::api::error::AppError;
use crate::entities::{archives, prelude::*, stored_files};
use crate::services::chunk_store::ChunkStore;
use crate::services::storage::{BlobStore, ByteStream};
use crate::utils::range::{ByteRange, RangeRequest, resolve_range};

const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Something that can stream an inclusive byte range of a known-size payload.
#[async_trait]
pub trait RangeSource: Send + Sync {
    fn size(&self) -> u64;

    /// `None` streams the whole payload.
    async fn open(&self, range: Option<ByteRange>) -> Result<ByteStream, AppError>;
}

/// Reads straight from the blob store.
pub struct BlobSource {
    blobs: Arc<dyn BlobStore>,
    path: String,
    size: u64,
}

impl BlobSource {
    pub fn new(blobs: Arc<dyn BlobStore>, path: impl Into<String>, size: u64) -> Self {
        Self {
            blobs,
            path: path.into(),
            size,
        }
    }
}

#[async_trait]
impl RangeSource for BlobSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self, range: Option<ByteRange>) -> Result<ByteStream, AppError> {
        let stream = match range {
            Some(r) => {
                self.blobs
                    .open_range(&self.path, Some(r.start), Some(r.end))
                    .await?
            }
            None => self.blobs.open_range(&self.path, None, None).await?,
        };
        Ok(stream)
    }
}

/// Reassembles bytes from the chunk cache, rebuilding it once if a chunk vanished.
pub struct ChunkedSource {
    chunks: ChunkStore,
    file_id: String,
    blob_path: String,
    size: u64,
}

#[async_trait]
impl RangeSource for ChunkedSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self, range: Option<ByteRange>) -> Result<ByteStream, AppError> {
        let range = match range {
            Some(r) => r,
            None if self.size == 0 => return Ok(Box::pin(futures::stream::empty())),
            None => ByteRange {
                start: 0,
                end: self.size - 1,
            },
        };

        Ok(self
            .chunks
            .read_range_repairing(&self.file_id, &self.blob_path, range.start, range.end))
    }
}

#[derive(Clone)]
pub struct DownloadService {
    db: DatabaseConnection,
    blobs: Arc<dyn BlobStore>,
    chunks: ChunkStore,
}

impl DownloadService {
    pub fn new(db: DatabaseConnection, blobs: Arc<dyn BlobStore>, chunks: ChunkStore) -> Self {
        Self { db, blobs, chunks }
    }

    /// Pick the byte source for a stored file: chunk cache for large files,
    /// direct blob reads otherwise.
    pub async fn source_for_file(
        &self,
        file: &stored_files::Model,
    ) -> Result<Box<dyn RangeSource>, AppError> {
        let stat = self.blobs.stat(&file.storage_path).await?;
        if !stat.exists {
            return Err(AppError::FileDataNotFound(file.id.clone()));
        }

        let recorded = file.size_bytes.max(0) as u64;
        if stat.size_bytes != recorded {
            tracing::warn!(
                file_id = %file.id,
                recorded,
                actual = stat.size_bytes,
                "Stored size differs from blob size, serving the blob"
            );
        }
        let size = stat.size_bytes;

        if self.chunks.should_chunk(size) {
            self.chunks
                .ensure_chunks(&file.id, &file.storage_path)
                .await?;

            return Ok(Box::new(ChunkedSource {
                chunks: self.chunks.clone(),
                file_id: file.id.clone(),
                blob_path: file.storage_path.clone(),
                size,
            }));
        }

        Ok(Box::new(BlobSource::new(
            self.blobs.clone(),
            file.storage_path.clone(),
            size,
        )))
    }

    pub async fn file_response(
        &self,
        file_id: &str,
        range_header: Option<&str>,
    ) -> Result<Response, AppError> {
        let file = StoredFiles::find_by_id(file_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::FileNotFound(file_id.to_string()))?;

        let source = self.source_for_file(&file).await?;
        tracing::debug!(file_id = %file.id, size = source.size(), "Serving file");

        respond(
            source.as_ref(),
            &file.original_name,
            &file.mime_type,
            range_header,
        )
        .await
    }

    /// Stream a completed archive. Status and expiry are checked by the caller.
    pub async fn archive_response(
        &self,
        archive: &archives::Model,
        range_header: Option<&str>,
    ) -> Result<Response, AppError> {
        let stat = self.blobs.stat(&archive.download_path).await?;
        if !stat.exists {
            return Err(AppError::FileDataNotFound(archive.id.clone()));
        }

        let source = BlobSource::new(
            self.blobs.clone(),
            archive.download_path.clone(),
            archive.size_bytes.max(0) as u64,
        );
        let filename = archive_filename(archive);

        respond(&source, &filename, ZIP_CONTENT_TYPE, range_header).await
    }
}

pub fn archive_filename(archive: &archives::Model) -> String {
    let kind = serde_json::to_value(archive.archive_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "archive".to_string());
    format!("{}-{}.zip", archive.shoot_id, kind)
}

/// Build a 200 or 206 streaming response for `source`.
pub async fn respond(
    source: &dyn RangeSource,
    filename: &str,
    content_type: &str,
    range_header: Option<&str>,
) -> Result<Response, AppError> {
    let size = source.size();

    let (status, range) = match resolve_range(range_header, size) {
        RangeRequest::Full => (StatusCode::OK, None),
        RangeRequest::Partial(r) => (StatusCode::PARTIAL_CONTENT, Some(r)),
        RangeRequest::Unsatisfiable => return Err(AppError::RangeNotSatisfiable { size }),
    };

    let stream = source.open(range).await?;
    let content_length = range.map_or(size, |r| r.len());

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_DISPOSITION, content_disposition(filename))
        .header(header::CACHE_CONTROL, "private, max-age=0");

    if let Some(r) = range {
        builder = builder.header(header::CONTENT_RANGE, r.content_range(size));
    }

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8 name.
pub fn content_disposition(filename: &str) -> String {
    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .take(64)
        .collect::<String>();
    let fallback_filename = if ascii_filename.is_empty() {
        "file"
    } else {
        &ascii_filename
    };

    let encoded_filename = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback_filename, encoded_filename
    )
}
