//! Time-bounded chunk cache for large blobs.
//!
//! A blob is sliced into `chunk_size` records keyed by `(file_id, chunk_index)`.
//! Chunk 0 is always inserted last, and only after every other index has been
//! confirmed present and unexpired, so an unexpired chunk 0 means the whole
//! set is present. Builders never delete unexpired rows: another process may
//! be filling the same set, and inserts ignore conflicts instead. Every read
//! filters on `expires_at > now`, independent of how often the sweeper runs.

use async_stream::try_stream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::entities::{file_chunks, prelude::*};
use crate::services::storage::{BlobStore, ByteStream, StorageError};
use crate::utils::keyed_mutex::KeyedMutex;

pub type ChunkResult<T> = Result<T, ChunkError>;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Chunk {chunk_index} of file {file_id} is missing, expired or truncated")]
    Missing { file_id: String, chunk_index: u64 },

    #[error("I/O error while chunking: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChunkError> for std::io::Error {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }
}

#[derive(Clone)]
pub struct ChunkStore {
    db: DatabaseConnection,
    blobs: Arc<dyn BlobStore>,
    locks: KeyedMutex,
    chunk_size: u64,
    large_file_threshold: u64,
    ttl: chrono::Duration,
    insert_batch: usize,
    read_window: u64,
}

impl ChunkStore {
    pub fn new(db: DatabaseConnection, blobs: Arc<dyn BlobStore>, config: &StorageConfig) -> Self {
        Self {
            db,
            blobs,
            locks: KeyedMutex::new(),
            chunk_size: config.chunk_size.max(1),
            large_file_threshold: config.large_file_threshold,
            ttl: config.chunk_ttl(),
            insert_batch: config.chunk_insert_batch.max(1),
            read_window: config.chunk_read_window.max(1),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn should_chunk(&self, size_bytes: u64) -> bool {
        size_bytes >= self.large_file_threshold
    }

    /// Make sure a complete, unexpired chunk set exists for `file_id`.
    pub async fn ensure_chunks(&self, file_id: &str, blob_path: &str) -> ChunkResult<()> {
        let _guard = self.locks.lock(file_id).await;

        match self.marker_expiry(file_id).await? {
            Some(expires_at) if expires_at > Utc::now() => return Ok(()),
            Some(_) => {
                tracing::debug!(file_id = %file_id, "Chunk set expired, rebuilding");
            }
            None => {}
        }

        self.rebuild_locked(file_id, blob_path).await
    }

    /// Slice the blob again, filling in whatever the cached set is missing.
    pub async fn rebuild_chunks(&self, file_id: &str, blob_path: &str) -> ChunkResult<()> {
        let _guard = self.locks.lock(file_id).await;
        self.rebuild_locked(file_id, blob_path).await
    }

    /// Stream bytes `[start, end]` (inclusive) reassembled from chunk records.
    pub fn read_range(&self, file_id: &str, start: u64, end: u64) -> ByteStream {
        self.chunk_slices(file_id.to_string(), None, start, end)
            .boxed()
    }

    /// Like [`ChunkStore::read_range`], but a missing chunk triggers one
    /// rebuild from `blob_path` before the read resumes.
    pub fn read_range_repairing(
        &self,
        file_id: &str,
        blob_path: &str,
        start: u64,
        end: u64,
    ) -> ByteStream {
        self.chunk_slices(file_id.to_string(), Some(blob_path.to_string()), start, end)
            .boxed()
    }

    /// Delete every chunk whose lifetime has elapsed. Returns the number removed.
    pub async fn sweep_expired(&self) -> ChunkResult<u64> {
        let result = FileChunks::delete_many()
            .filter(file_chunks::Column::ExpiresAt.lt(Utc::now()))
            .exec(&self.db)
            .await?;

        self.locks.cleanup();

        Ok(result.rows_affected)
    }

    pub async fn delete_chunks(&self, file_id: &str) -> ChunkResult<u64> {
        let result = FileChunks::delete_many()
            .filter(file_chunks::Column::FileId.eq(file_id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Only rows that are already invisible to readers are removed.
    async fn delete_expired_for(&self, file_id: &str, now: DateTime<Utc>) -> ChunkResult<u64> {
        let result = FileChunks::delete_many()
            .filter(file_chunks::Column::FileId.eq(file_id))
            .filter(file_chunks::Column::ExpiresAt.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn marker_expiry(&self, file_id: &str) -> ChunkResult<Option<DateTime<Utc>>> {
        let expiry = FileChunks::find()
            .select_only()
            .column(file_chunks::Column::ExpiresAt)
            .filter(file_chunks::Column::FileId.eq(file_id))
            .filter(file_chunks::Column::ChunkIndex.eq(0i64))
            .into_tuple::<DateTime<Utc>>()
            .one(&self.db)
            .await?;
        Ok(expiry)
    }

    /// Caller must hold the per-file lock.
    async fn rebuild_locked(&self, file_id: &str, blob_path: &str) -> ChunkResult<()> {
        let now = Utc::now();
        let cleared = self.delete_expired_for(file_id, now).await?;
        if cleared > 0 {
            tracing::debug!(file_id = %file_id, cleared, "Removed expired chunks before rebuild");
        }

        let mut writer = ChunkWriter {
            file_id,
            created_at: now,
            expires_at: now + self.ttl,
            batch_size: self.insert_batch,
            batch: Vec::with_capacity(self.insert_batch),
            marker: None,
            next_index: 0,
        };

        let chunk_size = self.chunk_size as usize;
        let mut pending: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut stream = self.blobs.open_range(blob_path, None, None).await?;

        while let Some(piece) = stream.next().await {
            let piece = piece?;
            let mut rest: &[u8] = &piece;
            while !rest.is_empty() {
                let take = (chunk_size - pending.len()).min(rest.len());
                pending.extend_from_slice(&rest[..take]);
                rest = &rest[take..];

                if pending.len() == chunk_size {
                    let full = std::mem::replace(&mut pending, Vec::with_capacity(chunk_size));
                    writer.push(&self.db, full).await?;
                }
            }
        }

        if !pending.is_empty() || writer.next_index == 0 {
            writer.push(&self.db, pending).await?;
        }

        let chunk_count = writer.finish(&self.db).await?;

        tracing::info!(
            file_id = %file_id,
            chunk_count,
            expires_at = %writer.expires_at,
            "🧩 Chunk set created"
        );

        Ok(())
    }

    async fn fetch_window(
        &self,
        file_id: &str,
        first: u64,
        last: u64,
    ) -> ChunkResult<Vec<file_chunks::Model>> {
        let rows = FileChunks::find()
            .filter(file_chunks::Column::FileId.eq(file_id))
            .filter(file_chunks::Column::ChunkIndex.between(first as i64, last as i64))
            .filter(file_chunks::Column::ExpiresAt.gt(Utc::now()))
            .order_by_asc(file_chunks::Column::ChunkIndex)
            .all(&self.db)
            .await?;

        for (offset, row) in rows.iter().enumerate() {
            let expected = first + offset as u64;
            if row.chunk_index != expected as i64 {
                return Err(ChunkError::Missing {
                    file_id: file_id.to_string(),
                    chunk_index: expected,
                });
            }
        }

        let fetched = rows.len() as u64;
        if fetched != last - first + 1 {
            return Err(ChunkError::Missing {
                file_id: file_id.to_string(),
                chunk_index: first + fetched,
            });
        }

        Ok(rows)
    }

    fn chunk_slices(
        &self,
        file_id: String,
        repair_from: Option<String>,
        start: u64,
        end: u64,
    ) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        let store = self.clone();

        try_stream! {
            ensure_ordered(&file_id, start, end)?;

            let chunk_size = store.chunk_size;
            let last = end / chunk_size;
            let mut next = start / chunk_size;
            let mut repaired = false;

            while next <= last {
                let window_end = (next + store.read_window - 1).min(last);

                let rows = match store.fetch_window(&file_id, next, window_end).await {
                    Ok(rows) => rows,
                    Err(ChunkError::Missing { chunk_index, .. })
                        if !repaired && repair_from.is_some() =>
                    {
                        tracing::warn!(
                            file_id = %file_id,
                            chunk_index,
                            "Chunk missing mid-read, rebuilding chunk set"
                        );
                        repaired = true;
                        if let Some(blob_path) = &repair_from {
                            store
                                .rebuild_chunks(&file_id, blob_path)
                                .await
                                .map_err(std::io::Error::from)?;
                        }
                        continue;
                    }
                    Err(e) => Err(std::io::Error::from(e))?,
                };

                for row in rows {
                    let (lo, hi) = slice_bounds(&row, start, end, last, chunk_size)
                        .map_err(std::io::Error::from)?;
                    yield Bytes::from(row.data).slice(lo..=hi);
                }

                next = window_end + 1;
            }
        }
    }
}

fn ensure_ordered(file_id: &str, start: u64, end: u64) -> std::io::Result<()> {
    if start > end {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("empty chunk range {}-{} for file {}", start, end, file_id),
        ));
    }
    Ok(())
}

/// Offsets of `[start, end]` within `row`, checking the chunk is intact.
/// Every chunk but the file's last one is full-sized.
fn slice_bounds(
    row: &file_chunks::Model,
    start: u64,
    end: u64,
    last: u64,
    chunk_size: u64,
) -> ChunkResult<(usize, usize)> {
    let index = row.chunk_index as u64;
    let chunk_start = index * chunk_size;
    let lo = start.max(chunk_start) - chunk_start;
    let hi = end.min(chunk_start + chunk_size - 1) - chunk_start;

    let len = row.data.len() as u64;
    if hi >= len || (index < last && len != chunk_size) {
        return Err(ChunkError::Missing {
            file_id: row.file_id.clone(),
            chunk_index: index,
        });
    }

    Ok((lo as usize, hi as usize))
}

/// Batches chunk inserts, holding chunk 0 back until everything else is stored.
struct ChunkWriter<'a> {
    file_id: &'a str,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    batch_size: usize,
    batch: Vec<file_chunks::ActiveModel>,
    marker: Option<file_chunks::ActiveModel>,
    next_index: i64,
}

impl ChunkWriter<'_> {
    async fn push(&mut self, db: &DatabaseConnection, data: Vec<u8>) -> ChunkResult<()> {
        let record = file_chunks::ActiveModel {
            file_id: Set(self.file_id.to_string()),
            chunk_index: Set(self.next_index),
            data: Set(data),
            created_at: Set(self.created_at),
            expires_at: Set(self.expires_at),
        };

        if self.next_index == 0 {
            self.marker = Some(record);
        } else {
            self.batch.push(record);
            if self.batch.len() >= self.batch_size {
                self.flush(db).await?;
            }
        }

        self.next_index += 1;
        Ok(())
    }

    async fn flush(&mut self, db: &DatabaseConnection) -> ChunkResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.batch);
        insert_ignoring_conflicts(db, records).await
    }

    /// Write the remaining batch, confirm indices `1..n` are all live, then
    /// write the marker. Returns the chunk count.
    async fn finish(&mut self, db: &DatabaseConnection) -> ChunkResult<i64> {
        self.flush(db).await?;
        self.verify_complete(db).await?;
        if let Some(marker) = self.marker.take() {
            insert_ignoring_conflicts(db, vec![marker]).await?;
        }
        Ok(self.next_index)
    }

    async fn verify_complete(&self, db: &DatabaseConnection) -> ChunkResult<()> {
        let expected = (self.next_index - 1).max(0) as u64;
        if expected == 0 {
            return Ok(());
        }

        let live = || {
            FileChunks::find()
                .filter(file_chunks::Column::FileId.eq(self.file_id))
                .filter(file_chunks::Column::ChunkIndex.between(1i64, self.next_index - 1))
                .filter(file_chunks::Column::ExpiresAt.gt(Utc::now()))
        };

        let present = live().count(db).await?;
        if present == expected {
            return Ok(());
        }

        let indices: Vec<i64> = live()
            .select_only()
            .column(file_chunks::Column::ChunkIndex)
            .order_by_asc(file_chunks::Column::ChunkIndex)
            .into_tuple::<i64>()
            .all(db)
            .await?;
        let chunk_index = indices
            .iter()
            .zip(1i64..)
            .find(|(found, wanted)| **found != *wanted)
            .map(|(_, wanted)| wanted)
            .unwrap_or(indices.len() as i64 + 1);

        tracing::warn!(
            file_id = %self.file_id,
            chunk_index,
            present,
            expected,
            "Chunk set incomplete after write, leaving marker unset"
        );

        Err(ChunkError::Missing {
            file_id: self.file_id.to_string(),
            chunk_index: chunk_index as u64,
        })
    }
}

async fn insert_ignoring_conflicts(
    db: &DatabaseConnection,
    records: Vec<file_chunks::ActiveModel>,
) -> ChunkResult<()> {
    FileChunks::insert_many(records)
        .on_conflict(
            OnConflict::columns([file_chunks::Column::FileId, file_chunks::Column::ChunkIndex])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::stored_files::{self, FileKind, ProcessingStatus};
    use crate::infrastructure::database::run_migrations;
    use crate::services::storage::{BlobStat, LocalBlobStore, PutResult, StorageResult};
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use sea_orm::sea_query::Expr;
    use sea_orm::{ActiveModelTrait, ConnectOptions, Database};
    use tempfile::TempDir;
    use tokio::io::AsyncRead;
    use tokio::sync::Notify;

    struct Fixture {
        _dir: TempDir,
        db: DatabaseConnection,
        blobs: Arc<dyn BlobStore>,
        config: StorageConfig,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);
        let db = Database::connect(opt).await.unwrap();
        run_migrations(&db).await.unwrap();

        let mut config = StorageConfig::development();
        config.storage_root = dir.path().to_path_buf();
        config.chunk_size = 100;
        config.chunk_insert_batch = 3;
        config.chunk_read_window = 2;

        let blobs: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(config.storage_root.clone(), 64));

        Fixture {
            _dir: dir,
            db,
            blobs,
            config,
        }
    }

    async fn seed_file(fx: &Fixture, id: &str, data: &[u8]) -> String {
        let path = format!("2024/01/{}.bin", id);
        fx.blobs
            .put_at(&path, Box::new(std::io::Cursor::new(data.to_vec())))
            .await
            .unwrap();

        stored_files::ActiveModel {
            id: Set(id.to_string()),
            shoot_id: Set("shoot-1".to_string()),
            original_name: Set(format!("{}.bin", id)),
            mime_type: Set("application/octet-stream".to_string()),
            size_bytes: Set(data.len() as i64),
            storage_path: Set(path.clone()),
            kind: Set(FileKind::Config),
            processing_status: Set(ProcessingStatus::Completed),
            created_at: Set(Utc::now()),
        }
        .insert(&fx.db)
        .await
        .unwrap();

        path
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn collect(stream: ByteStream) -> std::io::Result<Vec<u8>> {
        let parts: Vec<Bytes> = stream.try_collect().await?;
        Ok(parts.concat())
    }

    async fn chunk_count(db: &DatabaseConnection, file_id: &str) -> u64 {
        FileChunks::find()
            .filter(file_chunks::Column::FileId.eq(file_id))
            .count(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_chunks_slices_blob() {
        let fx = fixture().await;
        let data = payload(1050);
        let path = seed_file(&fx, "f1", &data).await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);

        store.ensure_chunks("f1", &path).await.unwrap();
        assert_eq!(chunk_count(&fx.db, "f1").await, 11);

        let last = FileChunks::find_by_id(("f1".to_string(), 10i64))
            .one(&fx.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.data.len(), 50);

        // Second call is a no-op
        store.ensure_chunks("f1", &path).await.unwrap();
        assert_eq!(chunk_count(&fx.db, "f1").await, 11);
    }

    #[tokio::test]
    async fn test_read_range_matches_original_slices() {
        let fx = fixture().await;
        let data = payload(1050);
        let path = seed_file(&fx, "f2", &data).await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);
        store.ensure_chunks("f2", &path).await.unwrap();

        for (start, end) in [(0, 1049), (0, 0), (99, 100), (150, 749), (1000, 1049), (250, 250)] {
            let bytes = collect(store.read_range("f2", start, end)).await.unwrap();
            assert_eq!(bytes, &data[start as usize..=end as usize], "range {start}-{end}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_ensure_yields_one_set() {
        let fx = fixture().await;
        let data = payload(777);
        let path = seed_file(&fx, "f3", &data).await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                store.ensure_chunks("f3", &path).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(chunk_count(&fx.db, "f3").await, 8);
        let bytes = collect(store.read_range("f3", 0, 776)).await.unwrap();
        assert_eq!(bytes, data);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_an_error() {
        let fx = fixture().await;
        let data = payload(500);
        let path = seed_file(&fx, "f4", &data).await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);
        store.ensure_chunks("f4", &path).await.unwrap();

        FileChunks::delete_by_id(("f4".to_string(), 2i64))
            .exec(&fx.db)
            .await
            .unwrap();

        assert!(collect(store.read_range("f4", 0, 499)).await.is_err());
        // Ranges that avoid the hole still work
        let head = collect(store.read_range("f4", 0, 199)).await.unwrap();
        assert_eq!(head, &data[..200]);
    }

    #[tokio::test]
    async fn test_repairing_read_rebuilds_once() {
        let fx = fixture().await;
        let data = payload(500);
        let path = seed_file(&fx, "f5", &data).await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);
        store.ensure_chunks("f5", &path).await.unwrap();

        FileChunks::delete_by_id(("f5".to_string(), 3i64))
            .exec(&fx.db)
            .await
            .unwrap();

        let bytes = collect(store.read_range_repairing("f5", &path, 120, 480))
            .await
            .unwrap();
        assert_eq!(bytes, &data[120..=480]);
        assert_eq!(chunk_count(&fx.db, "f5").await, 5);
    }

    /// Backdate every chunk of `file_id` so it reads as expired.
    async fn expire_chunks(db: &DatabaseConnection, file_id: &str) {
        FileChunks::update_many()
            .col_expr(
                file_chunks::Column::ExpiresAt,
                Expr::value(Utc::now() - chrono::Duration::hours(1)),
            )
            .filter(file_chunks::Column::FileId.eq(file_id))
            .exec(db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_chunks_are_invisible_and_swept() {
        let fx = fixture().await;
        let data = payload(300);
        let path = seed_file(&fx, "f6", &data).await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);

        store.ensure_chunks("f6", &path).await.unwrap();
        expire_chunks(&fx.db, "f6").await;
        assert_eq!(chunk_count(&fx.db, "f6").await, 3);
        assert!(collect(store.read_range("f6", 0, 10)).await.is_err());

        let removed = store.sweep_expired().await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(chunk_count(&fx.db, "f6").await, 0);
    }

    #[tokio::test]
    async fn test_expired_set_is_rebuilt() {
        let fx = fixture().await;
        let data = payload(300);
        let path = seed_file(&fx, "f7", &data).await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);

        store.ensure_chunks("f7", &path).await.unwrap();
        expire_chunks(&fx.db, "f7").await;

        store.ensure_chunks("f7", &path).await.unwrap();
        let bytes = collect(store.read_range("f7", 0, 299)).await.unwrap();
        assert_eq!(bytes, data);
        assert_eq!(chunk_count(&fx.db, "f7").await, 3);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_rows_another_writer_owns() {
        let fx = fixture().await;
        let data = payload(500);
        let path = seed_file(&fx, "f8", &data).await;

        // A second process is midway through the same set: chunks 1 and 2
        // are stored, chunk 0 is not
        let other_stamp = Utc::now() - chrono::Duration::minutes(5);
        let partial: Vec<file_chunks::ActiveModel> = (1i64..=2)
            .map(|index| file_chunks::ActiveModel {
                file_id: Set("f8".to_string()),
                chunk_index: Set(index),
                data: Set(data[index as usize * 100..(index as usize + 1) * 100].to_vec()),
                created_at: Set(other_stamp),
                expires_at: Set(Utc::now() + chrono::Duration::hours(24)),
            })
            .collect();
        insert_ignoring_conflicts(&fx.db, partial).await.unwrap();

        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);
        store.ensure_chunks("f8", &path).await.unwrap();

        let kept = FileChunks::find_by_id(("f8".to_string(), 1i64))
            .one(&fx.db)
            .await
            .unwrap()
            .unwrap();
        assert!(kept.created_at < Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(chunk_count(&fx.db, "f8").await, 5);
        assert_eq!(collect(store.read_range("f8", 0, 499)).await.unwrap(), data);
    }

    /// Delegates to a real store but parks every read after `pause_after`
    /// pieces until the test lets it continue.
    struct PausingBlobs {
        inner: Arc<dyn BlobStore>,
        pause_after: usize,
        reached: Arc<Notify>,
        resume: Arc<Notify>,
    }

    #[async_trait]
    impl BlobStore for PausingBlobs {
        async fn put<'a>(
            &self,
            file_id: &str,
            reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
            original_name: &str,
        ) -> StorageResult<PutResult> {
            self.inner.put(file_id, reader, original_name).await
        }

        async fn put_at<'a>(
            &self,
            path: &str,
            reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        ) -> StorageResult<u64> {
            self.inner.put_at(path, reader).await
        }

        async fn stat(&self, path: &str) -> StorageResult<BlobStat> {
            self.inner.stat(path).await
        }

        async fn open_range(
            &self,
            path: &str,
            start: Option<u64>,
            end: Option<u64>,
        ) -> StorageResult<ByteStream> {
            let mut inner = self.inner.open_range(path, start, end).await?;
            let pause_after = self.pause_after;
            let reached = self.reached.clone();
            let resume = self.resume.clone();

            Ok(Box::pin(async_stream::stream! {
                let mut seen = 0;
                while let Some(piece) = inner.next().await {
                    if seen == pause_after {
                        reached.notify_one();
                        resume.notified().await;
                    }
                    seen += 1;
                    yield piece;
                }
            }))
        }

        async fn delete(&self, path: &str) -> StorageResult<()> {
            self.inner.delete(path).await
        }

        fn create_writer(&self, path: &str) -> StorageResult<std::fs::File> {
            self.inner.create_writer(path)
        }
    }

    fn pausing(fx: &Fixture, pause_after: usize) -> (Arc<dyn BlobStore>, Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(PausingBlobs {
            inner: fx.blobs.clone(),
            pause_after,
            reached: reached.clone(),
            resume: resume.clone(),
        });
        (blobs, reached, resume)
    }

    #[tokio::test]
    async fn test_two_stores_sharing_a_database_build_one_set() {
        let fx = fixture().await;
        let data = payload(1000);
        let path = seed_file(&fx, "f9", &data).await;

        // Separate instances share no lock, like two server processes
        let (slow_blobs, reached, resume) = pausing(&fx, 10);
        let slow = ChunkStore::new(fx.db.clone(), slow_blobs, &fx.config);
        let fast = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);

        let slow_build = {
            let path = path.clone();
            tokio::spawn(async move { slow.ensure_chunks("f9", &path).await })
        };
        reached.notified().await;
        assert!(chunk_count(&fx.db, "f9").await > 0);

        fast.ensure_chunks("f9", &path).await.unwrap();
        resume.notify_one();
        slow_build.await.unwrap().unwrap();

        assert_eq!(chunk_count(&fx.db, "f9").await, 10);
        assert_eq!(collect(fast.read_range("f9", 0, 999)).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_marker_withheld_when_a_chunk_vanishes_mid_build() {
        let fx = fixture().await;
        let data = payload(1000);
        let path = seed_file(&fx, "f10", &data).await;

        let (slow_blobs, reached, resume) = pausing(&fx, 10);
        let store = ChunkStore::new(fx.db.clone(), slow_blobs, &fx.config);

        let build = {
            let path = path.clone();
            tokio::spawn(async move { store.ensure_chunks("f10", &path).await })
        };
        reached.notified().await;

        // Chunks 1..=3 were flushed in the first batch
        FileChunks::delete_by_id(("f10".to_string(), 2i64))
            .exec(&fx.db)
            .await
            .unwrap();
        resume.notify_one();

        match build.await.unwrap() {
            Err(ChunkError::Missing { chunk_index, .. }) => assert_eq!(chunk_index, 2),
            other => panic!("expected a missing chunk, got {:?}", other.map(|_| ())),
        }
        let marker = FileChunks::find_by_id(("f10".to_string(), 0i64))
            .one(&fx.db)
            .await
            .unwrap();
        assert!(marker.is_none());

        // The next build fills the hole and publishes the set
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);
        store.ensure_chunks("f10", &path).await.unwrap();
        assert_eq!(collect(store.read_range("f10", 0, 999)).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_should_chunk_threshold() {
        let fx = fixture().await;
        let store = ChunkStore::new(fx.db.clone(), fx.blobs.clone(), &fx.config);
        let threshold = fx.config.large_file_threshold;
        assert!(!store.should_chunk(threshold - 1));
        assert!(store.should_chunk(threshold));
    }
}
