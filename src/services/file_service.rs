use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::api::error::AppError;
use crate::entities::{
    prelude::*,
    stored_files::{self, FileKind, ProcessingStatus},
};
use crate::services::chunk_store::ChunkStore;
use crate::services::events::{EventPublisher, StorageEvent};
use crate::services::storage::BlobStore;
use crate::utils::validation::{sanitize_filename, validate_file_size};

pub struct FileService {
    db: DatabaseConnection,
    blobs: Arc<dyn BlobStore>,
    chunks: ChunkStore,
    events: Arc<dyn EventPublisher>,
    max_upload_size: u64,
}

impl FileService {
    pub fn new(
        db: DatabaseConnection,
        blobs: Arc<dyn BlobStore>,
        chunks: ChunkStore,
        events: Arc<dyn EventPublisher>,
        max_upload_size: u64,
    ) -> Self {
        Self {
            db,
            blobs,
            chunks,
            events,
            max_upload_size,
        }
    }

    /// Persist an upload and record its metadata.
    ///
    /// The id is issued before the blob write starts; the record is only
    /// inserted once the blob is fully on disk, with the size actually written.
    pub async fn store_file<'a>(
        &self,
        shoot_id: &str,
        reader: impl AsyncRead + Unpin + Send + 'a,
        original_name: &str,
        mime_type: Option<&str>,
    ) -> Result<stored_files::Model, AppError> {
        let filename =
            sanitize_filename(original_name).map_err(|e| AppError::BadRequest(e.to_string()))?;
        let mime_type = mime_type
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| mime_guess_from_name(&filename));

        let file_id = Uuid::new_v4().to_string();

        // One byte past the limit is enough to detect an oversized upload
        let limited = reader.take(self.max_upload_size.saturating_add(1));
        let put = self.blobs.put(&file_id, Box::new(limited), &filename).await?;

        if let Err(e) = validate_file_size(put.size_bytes, self.max_upload_size) {
            self.discard_blob(&put.storage_path).await;
            return Err(AppError::PayloadTooLarge(e.to_string()));
        }

        let record = stored_files::ActiveModel {
            id: Set(file_id.clone()),
            shoot_id: Set(shoot_id.to_string()),
            original_name: Set(filename.clone()),
            mime_type: Set(mime_type),
            size_bytes: Set(put.size_bytes as i64),
            storage_path: Set(put.storage_path.clone()),
            kind: Set(FileKind::from_filename(&filename)),
            processing_status: Set(ProcessingStatus::Pending),
            created_at: Set(Utc::now()),
        };

        let file = match record.insert(&self.db).await {
            Ok(file) => file,
            Err(e) => {
                self.discard_blob(&put.storage_path).await;
                return Err(e.into());
            }
        };

        tracing::info!(
            file_id = %file.id,
            shoot_id = %file.shoot_id,
            size_bytes = put.size_bytes,
            path = %file.storage_path,
            "📦 File stored"
        );

        self.events.publish(StorageEvent::FileUploaded {
            file_id: file.id.clone(),
            shoot_id: file.shoot_id.clone(),
            size_bytes: put.size_bytes,
            kind: file.kind,
        });

        Ok(file)
    }

    pub async fn get_file(&self, file_id: &str) -> Result<stored_files::Model, AppError> {
        StoredFiles::find_by_id(file_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::FileNotFound(file_id.to_string()))
    }

    pub async fn list_files(&self, shoot_id: &str) -> Result<Vec<stored_files::Model>, AppError> {
        let files = StoredFiles::find()
            .filter(stored_files::Column::ShootId.eq(shoot_id))
            .order_by_asc(stored_files::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(files)
    }

    /// Remove a file's chunks, record and blob.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), AppError> {
        let file = self.get_file(file_id).await?;

        self.chunks.delete_chunks(&file.id).await?;
        let storage_path = file.storage_path.clone();
        let shoot_id = file.shoot_id.clone();
        file.delete(&self.db).await?;

        // The record is gone, so a leftover blob is only wasted space
        if let Err(e) = self.blobs.delete(&storage_path).await {
            tracing::warn!(file_id = %file_id, path = %storage_path, "Failed to delete blob: {}", e);
        }

        tracing::info!(file_id = %file_id, "🗑️ File deleted");

        self.events.publish(StorageEvent::FileDeleted {
            file_id: file_id.to_string(),
            shoot_id,
        });

        Ok(())
    }

    async fn discard_blob(&self, storage_path: &str) {
        if let Err(e) = self.blobs.delete(storage_path).await {
            tracing::warn!(path = %storage_path, "Failed to discard blob: {}", e);
        }
    }
}

/// Fallback content type derived from the extension.
fn mime_guess_from_name(filename: &str) -> String {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => mime::IMAGE_JPEG.to_string(),
        "png" => mime::IMAGE_PNG.to_string(),
        "gif" => mime::IMAGE_GIF.to_string(),
        "webp" => "image/webp".to_string(),
        "tif" | "tiff" => "image/tiff".to_string(),
        "heic" => "image/heic".to_string(),
        "mp4" | "m4v" => "video/mp4".to_string(),
        "mov" => "video/quicktime".to_string(),
        "webm" => "video/webm".to_string(),
        "xmp" | "xml" => mime::TEXT_XML.to_string(),
        _ => mime::APPLICATION_OCTET_STREAM.to_string(),
    }
}
