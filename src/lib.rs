pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::StorageConfig;
use crate::services::archive_service::ArchiveService;
use crate::services::archive_worker::{ArchiveGenerator, ArchiveJob, ArchiveQueue, ArchiveWorkerPool};
use crate::services::chunk_store::ChunkStore;
use crate::services::download::DownloadService;
use crate::services::events::{BroadcastPublisher, EventPublisher};
use crate::services::file_service::FileService;
use crate::services::storage::BlobStore;
use crate::services::worker::BackgroundWorker;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::get,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Extra room for multipart framing on top of the upload limit.
const MULTIPART_OVERHEAD: u64 = 10 * 1024 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::files::upload_file,
        api::handlers::files::list_files,
        api::handlers::files::get_file,
        api::handlers::files::download_file,
        api::handlers::files::delete_file,
        api::handlers::archives::create_archive,
        api::handlers::archives::list_archives,
        api::handlers::archives::get_archive,
        api::handlers::archives::download_archive,
        api::handlers::archives::delete_archive,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::files::FileResponse,
            api::handlers::archives::CreateArchiveRequest,
            api::handlers::archives::ArchiveResponse,
            entities::stored_files::FileKind,
            entities::stored_files::ProcessingStatus,
            entities::archives::ArchiveType,
            entities::archives::ArchiveStatus,
        )
    ),
    tags(
        (name = "files", description = "File storage and download endpoints"),
        (name = "archives", description = "ZIP archive generation and delivery"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub blobs: Arc<dyn BlobStore>,
    pub chunks: ChunkStore,
    pub downloads: DownloadService,
    pub file_service: Arc<FileService>,
    pub archive_service: Arc<ArchiveService>,
    pub archive_generator: ArchiveGenerator,
    pub archive_queue: ArchiveQueue,
    pub events: Arc<BroadcastPublisher>,
    pub config: StorageConfig,
}

impl AppState {
    /// Wire the services together. The receiver is the consuming end of the
    /// archive job queue; hand it to [`AppState::archive_pool`] or drop it
    /// when this process runs no archive workers.
    pub fn new(
        db: DatabaseConnection,
        blobs: Arc<dyn BlobStore>,
        config: StorageConfig,
    ) -> (Self, mpsc::Receiver<ArchiveJob>) {
        let events = Arc::new(BroadcastPublisher::default());
        let publisher: Arc<dyn EventPublisher> = events.clone();

        let chunks = ChunkStore::new(db.clone(), blobs.clone(), &config);
        let downloads = DownloadService::new(db.clone(), blobs.clone(), chunks.clone());
        let (archive_queue, receiver) = ArchiveQueue::channel(config.archive_queue_capacity);

        let file_service = Arc::new(FileService::new(
            db.clone(),
            blobs.clone(),
            chunks.clone(),
            publisher.clone(),
            config.max_upload_size,
        ));
        let archive_service = Arc::new(ArchiveService::new(
            db.clone(),
            blobs.clone(),
            downloads.clone(),
            publisher.clone(),
            archive_queue.clone(),
            &config,
        ));
        let archive_generator = ArchiveGenerator::new(
            db.clone(),
            blobs.clone(),
            downloads.clone(),
            publisher,
            &config,
        );

        let state = Self {
            db,
            blobs,
            chunks,
            downloads,
            file_service,
            archive_service,
            archive_generator,
            archive_queue,
            events,
            config,
        };

        (state, receiver)
    }

    pub fn archive_pool(
        &self,
        receiver: mpsc::Receiver<ArchiveJob>,
        shutdown: watch::Receiver<bool>,
    ) -> ArchiveWorkerPool {
        ArchiveWorkerPool::new(
            self.archive_generator.clone(),
            self.archive_queue.clone(),
            receiver,
            &self.config,
            shutdown,
        )
    }

    pub fn sweeper(&self, shutdown: watch::Receiver<bool>) -> BackgroundWorker {
        BackgroundWorker::new(
            self.chunks.clone(),
            self.archive_service.clone(),
            &self.config,
            shutdown,
        )
    }
}

pub fn create_app(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.max_upload_size.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/shoots/:shoot_id/files",
            get(api::handlers::files::list_files)
                .post(api::handlers::files::upload_file)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/shoots/:shoot_id/archives",
            get(api::handlers::archives::list_archives)
                .post(api::handlers::archives::create_archive),
        )
        .route(
            "/files/:id",
            get(api::handlers::files::get_file).delete(api::handlers::files::delete_file),
        )
        .route(
            "/files/:id/download",
            get(api::handlers::files::download_file),
        )
        .route(
            "/archives/:id",
            get(api::handlers::archives::get_archive)
                .delete(api::handlers::archives::delete_archive),
        )
        .route(
            "/archives/:id/download",
            get(api::handlers::archives::download_archive),
        )
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors)
        .with_state(state)
}
