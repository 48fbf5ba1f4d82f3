#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, Bytes},
    http::{Request, Response, StatusCode},
};
use gallery_storage::config::StorageConfig;
use gallery_storage::infrastructure::database::run_migrations;
use gallery_storage::services::archive_worker::ArchiveJob;
use async_trait::async_trait;
use gallery_storage::services::storage::{
    BlobStat, BlobStore, ByteStream, LocalBlobStore, PutResult, StorageResult,
};
use gallery_storage::{AppState, create_app};
use http_body_util::BodyExt;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tokio::io::AsyncRead;
use tokio::sync::{Notify, mpsc};
use tower::ServiceExt;

pub struct TestContext {
    pub dir: TempDir,
    pub state: AppState,
    pub app: Router,
    pub jobs: mpsc::Receiver<ArchiveJob>,
}

pub async fn setup_test_db() -> DatabaseConnection {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(opt).await.unwrap();
    run_migrations(&db).await.unwrap();
    db
}

pub async fn setup() -> TestContext {
    setup_with(|_| {}).await
}

pub async fn setup_with(tweak: impl FnOnce(&mut StorageConfig)) -> TestContext {
    setup_on(tweak, |blobs| blobs).await
}

/// Like [`setup_with`], but reads from stored blobs can be held open.
pub async fn setup_stalling(
    tweak: impl FnOnce(&mut StorageConfig),
) -> (TestContext, Arc<StallingBlobs>) {
    let mut stalling = None;
    let ctx = setup_on(tweak, |inner| {
        let blobs = Arc::new(StallingBlobs::new(inner));
        stalling = Some(blobs.clone());
        blobs as Arc<dyn BlobStore>
    })
    .await;
    (ctx, stalling.unwrap())
}

async fn setup_on(
    tweak: impl FnOnce(&mut StorageConfig),
    wrap: impl FnOnce(Arc<dyn BlobStore>) -> Arc<dyn BlobStore>,
) -> TestContext {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::development();
    config.storage_root = dir.path().to_path_buf();
    tweak(&mut config);

    let db = setup_test_db().await;
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        config.storage_root.clone(),
        config.read_buffer_size,
    ));

    let (state, jobs) = AppState::new(db, wrap(blobs), config);
    let app = create_app(state.clone());

    TestContext {
        dir,
        state,
        app,
        jobs,
    }
}

/// Blob store whose reads, once stalled, hang until [`StallingBlobs::release`]
/// and then fail. Writes and stats pass straight through.
pub struct StallingBlobs {
    inner: Arc<dyn BlobStore>,
    stalled: AtomicBool,
    released: Arc<Notify>,
}

impl StallingBlobs {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            stalled: AtomicBool::new(false),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Let one stalled read continue; it ends with an I/O error.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl BlobStore for StallingBlobs {
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
        if !self.stalled.load(Ordering::SeqCst) {
            return self.inner.open_range(path, start, end).await;
        }

        let released = self.released.clone();
        Ok(Box::pin(async_stream::stream! {
            released.notified().await;
            yield Err::<Bytes, _>(std::io::Error::other("blob read aborted"));
        }))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.inner.delete(path).await
    }

    fn create_writer(&self, path: &str) -> StorageResult<std::fs::File> {
        self.inner.create_writer(path)
    }
}

/// Deterministic, non-repeating-per-chunk payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

pub fn multipart_body(boundary: &str, filename: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
            Content-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

pub async fn upload(
    app: &Router,
    shoot_id: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
) -> Value {
    let boundary = "---------------------------123456789012345678901234567";
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/shoots/{}/files", shoot_id))
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(multipart_body(
                    boundary,
                    filename,
                    content_type,
                    data,
                )))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

pub async fn get(app: &Router, uri: &str, range: Option<&str>) -> Response<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(range) = range {
        builder = builder.header("Range", range);
    }
    app.clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn send_json(app: &Router, method: &str, uri: &str, json: Value) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn delete(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap()
}

pub fn header(response: &Response<Body>, name: &str) -> String {
    response.headers()[name].to_str().unwrap().to_string()
}
