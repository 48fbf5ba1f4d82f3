use axum::response::Response;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set,
};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::AppError;
use crate::config::StorageConfig;
use crate::entities::{
    archives::{self, ArchiveStatus, ArchiveType},
    prelude::*,
    stored_files::{self, FileKind},
};
use crate::services::archive_worker::ArchiveQueue;
use crate::services::download::DownloadService;
use crate::services::events::{EventPublisher, StorageEvent};
use crate::services::paths;
use crate::services::storage::BlobStore;

pub struct ArchiveService {
    db: DatabaseConnection,
    blobs: Arc<dyn BlobStore>,
    downloads: DownloadService,
    events: Arc<dyn EventPublisher>,
    queue: ArchiveQueue,
    max_size: u64,
}

impl ArchiveService {
    pub fn new(
        db: DatabaseConnection,
        blobs: Arc<dyn BlobStore>,
        downloads: DownloadService,
        events: Arc<dyn EventPublisher>,
        queue: ArchiveQueue,
        config: &StorageConfig,
    ) -> Self {
        Self {
            db,
            blobs,
            downloads,
            events,
            queue,
            max_size: config.archive_max_size,
        }
    }

    /// Record a pending archive and queue it for generation.
    pub async fn create(
        &self,
        shoot_id: &str,
        archive_type: ArchiveType,
        file_ids: Option<Vec<String>>,
    ) -> Result<archives::Model, AppError> {
        let explicit = file_ids.is_some();
        let files = self
            .resolve_files(shoot_id, archive_type, file_ids.as_deref())
            .await?;

        if files.is_empty() {
            return Err(AppError::NoFilesMatched);
        }

        let estimated: u64 = files.iter().map(|f| f.size_bytes.max(0) as u64).sum();
        if estimated > self.max_size {
            return Err(AppError::ArchiveTooLarge {
                estimated,
                limit: self.max_size,
            });
        }

        let ids: Vec<String> = files.iter().map(|f| f.id.clone()).collect();

        if !explicit {
            if let Some(existing) = self.find_in_flight(shoot_id, archive_type, &ids).await? {
                tracing::info!(
                    archive_id = %existing.id,
                    shoot_id = %shoot_id,
                    "Archive already in progress, reusing"
                );
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let archive_id = Uuid::new_v4().to_string();

        let archive = archives::ActiveModel {
            id: Set(archive_id.clone()),
            shoot_id: Set(shoot_id.to_string()),
            archive_type: Set(archive_type),
            status: Set(ArchiveStatus::Pending),
            size_bytes: Set(0),
            estimated_size_bytes: Set(estimated as i64),
            file_ids: Set(serde_json::json!(ids)),
            file_count: Set(ids.len() as i32),
            download_path: Set(paths::archive_path(&archive_id, now)),
            error_message: Set(None),
            created_at: Set(now),
            completed_at: Set(None),
            expires_at: Set(None),
        }
        .insert(&self.db)
        .await?;

        tracing::info!(
            archive_id = %archive.id,
            shoot_id = %shoot_id,
            file_count = archive.file_count,
            estimated_size_bytes = estimated,
            "📝 Archive requested"
        );

        self.events.publish(StorageEvent::ArchiveCreated {
            archive_id: archive.id.clone(),
            shoot_id: shoot_id.to_string(),
            archive_type,
            file_count: ids.len(),
        });

        self.queue.enqueue(&archive.id);

        Ok(archive)
    }

    /// Files an archive request selects, in entry order.
    ///
    /// Explicit ids are restricted to the shoot; without them the whole shoot
    /// is filtered by archive type.
    pub async fn resolve_files(
        &self,
        shoot_id: &str,
        archive_type: ArchiveType,
        file_ids: Option<&[String]>,
    ) -> Result<Vec<stored_files::Model>, AppError> {
        let mut query = StoredFiles::find().filter(stored_files::Column::ShootId.eq(shoot_id));

        if let Some(ids) = file_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let unique: HashSet<String> = ids.iter().cloned().collect();
            query = query.filter(stored_files::Column::Id.is_in(unique));
        }

        let files = query
            .order_by_asc(stored_files::Column::CreatedAt)
            .order_by_asc(stored_files::Column::OriginalName)
            .all(&self.db)
            .await?;

        if file_ids.is_some() {
            return Ok(files);
        }

        Ok(files
            .into_iter()
            .filter(|f| matches_type(f, archive_type))
            .collect())
    }

    async fn find_in_flight(
        &self,
        shoot_id: &str,
        archive_type: ArchiveType,
        ids: &[String],
    ) -> Result<Option<archives::Model>, AppError> {
        let candidates = Archives::find()
            .filter(archives::Column::ShootId.eq(shoot_id))
            .filter(archives::Column::ArchiveType.eq(archive_type))
            .filter(
                archives::Column::Status
                    .is_in([ArchiveStatus::Pending, ArchiveStatus::Processing]),
            )
            .order_by_desc(archives::Column::CreatedAt)
            .all(&self.db)
            .await?;

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();

        Ok(candidates.into_iter().find(|archive| {
            let existing = archive.file_id_list();
            existing.len() == wanted.len() && existing.iter().all(|id| wanted.contains(id.as_str()))
        }))
    }

    pub async fn get(&self, archive_id: &str) -> Result<archives::Model, AppError> {
        Archives::find_by_id(archive_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::ArchiveNotFound(archive_id.to_string()))
    }

    pub async fn list(&self, shoot_id: &str) -> Result<Vec<archives::Model>, AppError> {
        let archives = Archives::find()
            .filter(archives::Column::ShootId.eq(shoot_id))
            .order_by_desc(archives::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(archives)
    }

    /// Remove an archive's blob and record.
    pub async fn delete(&self, archive_id: &str) -> Result<(), AppError> {
        let archive = self.get(archive_id).await?;

        if let Err(e) = self.blobs.delete(&archive.download_path).await {
            tracing::warn!(archive_id = %archive_id, "Failed to delete archive blob: {}", e);
        }
        archive.delete(&self.db).await?;

        tracing::info!(archive_id = %archive_id, "🗑️ Archive deleted");
        Ok(())
    }

    pub async fn download(
        &self,
        archive_id: &str,
        range_header: Option<&str>,
    ) -> Result<Response, AppError> {
        let archive = self.get(archive_id).await?;

        if archive.is_expired_at(Utc::now()) {
            return Err(AppError::ArchiveExpired);
        }
        if archive.status != ArchiveStatus::Completed {
            return Err(AppError::ArchiveNotReady(archive.status.as_str().to_string()));
        }

        self.downloads.archive_response(&archive, range_header).await
    }

    /// Expire completed archives past their deadline, deleting blob then
    /// record. An archive whose blob cannot be removed stays `expired` and is
    /// retried next time. Returns how many records were removed.
    pub async fn sweep_expired(&self) -> Result<u64, AppError> {
        let now = Utc::now();

        archives::transition(ArchiveStatus::Completed, ArchiveStatus::Expired)
            .filter(archives::Column::ExpiresAt.lt(now))
            .exec(&self.db)
            .await?;

        let expired = Archives::find()
            .filter(archives::Column::Status.eq(ArchiveStatus::Expired))
            .all(&self.db)
            .await?;

        let mut removed = 0;
        for archive in expired {
            if let Err(e) = self.blobs.delete(&archive.download_path).await {
                tracing::error!(archive_id = %archive.id, "Failed to delete expired archive: {}", e);
                continue;
            }

            let archive_id = archive.id.clone();
            match archive.delete(&self.db).await {
                Ok(_) => {
                    tracing::info!(archive_id = %archive_id, "Expired archive removed");
                    removed += 1;
                }
                Err(e) => {
                    tracing::error!(archive_id = %archive_id, "Failed to remove archive record: {}", e)
                }
            }
        }

        Ok(removed)
    }
}

fn matches_type(file: &stored_files::Model, archive_type: ArchiveType) -> bool {
    match archive_type {
        ArchiveType::SubsetJpeg => file.is_jpeg(),
        ArchiveType::SubsetRaw => file.kind == FileKind::Raw,
        ArchiveType::Complete => true,
    }
}
