use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::services::paths;

/// Incremental byte stream handed to HTTP bodies and the archive pipeline.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// Disk full, permission denied and similar. Not retried; the caller
    /// checks `stat` before trying again.
    #[error("Blob write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("Invalid range {start}-{end} for blob of {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub exists: bool,
    pub size_bytes: u64,
}

pub struct PutResult {
    pub storage_path: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `reader` under the path allocated for `file_id`.
    async fn put<'a>(
        &self,
        file_id: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        original_name: &str,
    ) -> StorageResult<PutResult>;

    /// Persist `reader` at an explicit relative path.
    async fn put_at<'a>(
        &self,
        path: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> StorageResult<u64>;

    async fn stat(&self, path: &str) -> StorageResult<BlobStat>;

    /// Stream the inclusive byte range `[start, end]`; missing bounds mean
    /// the start or end of the blob.
    async fn open_range(
        &self,
        path: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> StorageResult<ByteStream>;

    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Blocking, seekable handle used by the ZIP writer. Call from a
    /// blocking context.
    fn create_writer(&self, path: &str) -> StorageResult<std::fs::File>;
}

/// Local filesystem blob store.
pub struct LocalBlobStore {
    root: PathBuf,
    read_buffer_size: usize,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf, read_buffer_size: usize) -> Self {
        Self {
            root,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative storage path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn write_atomically<'a>(
        &self,
        target: &Path,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> StorageResult<u64> {
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(target.display().to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(StorageError::Write)?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{}.{}.part", file_name, Uuid::new_v4()));

        let result: StorageResult<u64> = async {
            let mut file = fs::File::create(&temp_path)
                .await
                .map_err(StorageError::Write)?;
            let mut buffer = vec![0u8; self.read_buffer_size];
            let mut total: u64 = 0;

            loop {
                let n = reader.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buffer[..n])
                    .await
                    .map_err(StorageError::Write)?;
                total += n as u64;
            }

            file.flush().await.map_err(StorageError::Write)?;
            file.sync_all().await.map_err(StorageError::Write)?;
            drop(file);
            fs::rename(&temp_path, target)
                .await
                .map_err(StorageError::Write)?;
            Ok(total)
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put<'a>(
        &self,
        file_id: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        original_name: &str,
    ) -> StorageResult<PutResult> {
        let storage_path = paths::blob_path(file_id, original_name, Utc::now());
        let size_bytes = self.put_at(&storage_path, reader).await?;

        tracing::debug!(
            file_id = %file_id,
            path = %storage_path,
            size_bytes,
            "Blob persisted"
        );

        Ok(PutResult {
            storage_path,
            size_bytes,
        })
    }

    async fn put_at<'a>(
        &self,
        path: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> StorageResult<u64> {
        let target = self.resolve(path)?;
        self.write_atomically(&target, reader).await
    }

    async fn stat(&self, path: &str) -> StorageResult<BlobStat> {
        let target = self.resolve(path)?;
        match fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => Ok(BlobStat {
                exists: true,
                size_bytes: meta.len(),
            }),
            Ok(_) => Ok(BlobStat {
                exists: false,
                size_bytes: 0,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlobStat {
                exists: false,
                size_bytes: 0,
            }),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn open_range(
        &self,
        path: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> StorageResult<ByteStream> {
        let target = self.resolve(path)?;
        let mut file = fs::File::open(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        let size = file.metadata().await?.len();
        if size == 0 && start.is_none() && end.is_none() {
            return Ok(futures::stream::empty().boxed());
        }

        let start = start.unwrap_or(0);
        let end = end.unwrap_or(size.saturating_sub(1));
        if start > end || end >= size {
            return Err(StorageError::InvalidRange { start, end, size });
        }

        file.seek(SeekFrom::Start(start)).await?;
        let limited = file.take(end - start + 1);

        Ok(ReaderStream::with_capacity(limited, self.read_buffer_size).boxed())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // Already deleted
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn create_writer(&self, path: &str) -> StorageResult<std::fs::File> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(StorageError::Write)?;
        }
        std::fs::File::create(&target).map_err(StorageError::Write)
    }
}
