//! Background archive generation.
//!
//! Jobs arrive on a bounded mpsc queue and run on a pool gated by a
//! semaphore. Each archive id runs at most once at a time: an in-memory
//! in-flight set guards this process, the `pending -> processing` claim in
//! the database guards against other processes. Jobs wait for a permit in
//! their own task, so the dispatch loop always sees shutdown.

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashSet;
use futures::StreamExt;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::StorageConfig;
use crate::entities::{
    archives::{self, ArchiveStatus},
    prelude::*,
    stored_files,
};
use crate::services::download::DownloadService;
use crate::services::events::{EventPublisher, StorageEvent};
use crate::services::storage::BlobStore;
use crate::utils::validation::EntryNamer;

pub const INTERRUPTED_MESSAGE: &str = "generation interrupted";

/// Buffered commands between the async feeder and the blocking ZIP writer.
const ZIP_CHANNEL_CAPACITY: usize = 8;
const ZIP_WRITE_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub archive_id: String,
}

/// Producer side of the archive job queue.
#[derive(Clone)]
pub struct ArchiveQueue {
    sender: mpsc::Sender<ArchiveJob>,
}

impl ArchiveQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ArchiveJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Hand a job to the local pool without waiting. A full or absent pool is
    /// fine: the record stays `pending` and the pending-archive poll finds it.
    pub fn enqueue(&self, archive_id: &str) {
        let job = ArchiveJob {
            archive_id: archive_id.to_string(),
        };
        match self.sender.try_send(job) {
            Ok(()) => tracing::debug!(archive_id = %archive_id, "Archive job queued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(archive_id = %archive_id, "Archive queue full, deferring to poll")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(archive_id = %archive_id, "No local archive workers, left pending")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { size_bytes: u64 },
    Failed(String),
    /// Another run already claimed the archive, or it is no longer pending.
    Skipped,
}

enum ZipCommand {
    StartEntry(String),
    Data(Bytes),
}

/// Runs a single archive job from claim to completion.
#[derive(Clone)]
pub struct ArchiveGenerator {
    db: DatabaseConnection,
    blobs: Arc<dyn BlobStore>,
    downloads: DownloadService,
    events: Arc<dyn EventPublisher>,
    archive_ttl: chrono::Duration,
}

impl ArchiveGenerator {
    pub fn new(
        db: DatabaseConnection,
        blobs: Arc<dyn BlobStore>,
        downloads: DownloadService,
        events: Arc<dyn EventPublisher>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            db,
            blobs,
            downloads,
            events,
            archive_ttl: config.archive_ttl(),
        }
    }

    pub async fn generate(&self, archive_id: &str) -> Result<GenerationOutcome> {
        if !self.claim(archive_id).await? {
            tracing::debug!(archive_id = %archive_id, "Archive already claimed, skipping");
            return Ok(GenerationOutcome::Skipped);
        }

        let archive = Archives::find_by_id(archive_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| anyhow!("Archive {} vanished after claim", archive_id))?;

        tracing::info!(
            archive_id = %archive.id,
            shoot_id = %archive.shoot_id,
            file_count = archive.file_count,
            estimated_size_bytes = archive.estimated_size_bytes,
            "🗜️ Generating archive"
        );

        match self.build(&archive).await {
            Ok(()) => self.complete(&archive).await,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(archive_id = %archive.id, error = %message, "Archive generation failed");
                if self.fail(&archive, &message).await? {
                    Ok(GenerationOutcome::Failed(message))
                } else {
                    Ok(GenerationOutcome::Skipped)
                }
            }
        }
    }

    /// Conditional `pending -> processing`; false if someone else got there first.
    async fn claim(&self, archive_id: &str) -> Result<bool> {
        let result = archives::transition(ArchiveStatus::Pending, ArchiveStatus::Processing)
            .filter(archives::Column::Id.eq(archive_id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn build(&self, archive: &archives::Model) -> Result<()> {
        let files = self.load_files(archive).await?;
        if files.is_empty() {
            bail!("none of the selected files exist anymore");
        }

        let output = self
            .blobs
            .create_writer(&archive.download_path)
            .with_context(|| format!("failed to open {}", archive.download_path))?;

        let (tx, rx) = mpsc::channel::<ZipCommand>(ZIP_CHANNEL_CAPACITY);
        let writer = tokio::task::spawn_blocking(move || write_zip(output, rx));

        let fed = self.feed(&files, &tx).await;
        drop(tx);

        let written = writer.await.context("ZIP writer task panicked")?;
        // A writer failure also surfaces as a closed channel in the feeder
        written?;
        fed
    }

    async fn load_files(&self, archive: &archives::Model) -> Result<Vec<stored_files::Model>> {
        let ids = archive.file_id_list();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let files = StoredFiles::find()
            .filter(stored_files::Column::Id.is_in(ids.clone()))
            .order_by_asc(stored_files::Column::CreatedAt)
            .order_by_asc(stored_files::Column::OriginalName)
            .all(&self.db)
            .await?;

        if files.len() != ids.len() {
            tracing::warn!(
                archive_id = %archive.id,
                requested = ids.len(),
                found = files.len(),
                "Some archive files were deleted before generation"
            );
        }

        Ok(files)
    }

    async fn feed(&self, files: &[stored_files::Model], tx: &mpsc::Sender<ZipCommand>) -> Result<()> {
        let mut namer = EntryNamer::new();

        for file in files {
            let entry_name = namer.next_name(&file.original_name, &file.id);
            let source = self
                .downloads
                .source_for_file(file)
                .await
                .with_context(|| format!("cannot read file {}", file.id))?;
            let mut stream = source
                .open(None)
                .await
                .with_context(|| format!("cannot open file {}", file.id))?;

            tx.send(ZipCommand::StartEntry(entry_name))
                .await
                .map_err(|_| anyhow!("ZIP writer stopped"))?;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.with_context(|| format!("read failed for file {}", file.id))?;
                tx.send(ZipCommand::Data(chunk))
                    .await
                    .map_err(|_| anyhow!("ZIP writer stopped"))?;
            }
        }

        Ok(())
    }

    async fn complete(&self, archive: &archives::Model) -> Result<GenerationOutcome> {
        let stat = self.blobs.stat(&archive.download_path).await?;
        if !stat.exists {
            let message = "archive blob missing after write".to_string();
            if self.fail(archive, &message).await? {
                return Ok(GenerationOutcome::Failed(message));
            }
            return Ok(GenerationOutcome::Skipped);
        }

        let now = Utc::now();
        let expires_at = now + self.archive_ttl;

        let result = archives::transition(ArchiveStatus::Processing, ArchiveStatus::Completed)
            .col_expr(archives::Column::SizeBytes, Expr::value(stat.size_bytes as i64))
            .col_expr(archives::Column::CompletedAt, Expr::value(now))
            .col_expr(archives::Column::ExpiresAt, Expr::value(expires_at))
            .filter(archives::Column::Id.eq(archive.id.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Deleted while generating
            tracing::info!(archive_id = %archive.id, "Archive removed during generation, discarding output");
            self.discard_blob(archive).await;
            return Ok(GenerationOutcome::Skipped);
        }

        tracing::info!(
            archive_id = %archive.id,
            size_bytes = stat.size_bytes,
            expires_at = %expires_at,
            "✅ Archive ready"
        );

        self.events.publish(StorageEvent::ArchiveReady {
            archive_id: archive.id.clone(),
            shoot_id: archive.shoot_id.clone(),
            size_bytes: stat.size_bytes,
            expires_at,
        });

        Ok(GenerationOutcome::Completed {
            size_bytes: stat.size_bytes,
        })
    }

    /// Move a `processing` archive to `failed`. Returns false, and publishes
    /// nothing, when the record was deleted or already left `processing`.
    async fn fail(&self, archive: &archives::Model, message: &str) -> Result<bool> {
        self.discard_blob(archive).await;

        let result = archives::transition(ArchiveStatus::Processing, ArchiveStatus::Failed)
            .col_expr(archives::Column::ErrorMessage, Expr::value(message))
            .filter(archives::Column::Id.eq(archive.id.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            tracing::info!(archive_id = %archive.id, "Archive left processing before it could be failed");
            return Ok(false);
        }

        self.events.publish(StorageEvent::ArchiveFailed {
            archive_id: archive.id.clone(),
            shoot_id: archive.shoot_id.clone(),
            error: message.to_string(),
        });

        Ok(true)
    }

    async fn discard_blob(&self, archive: &archives::Model) {
        if let Err(e) = self.blobs.delete(&archive.download_path).await {
            tracing::warn!(archive_id = %archive.id, "Failed to remove partial archive: {}", e);
        }
    }

    /// Fail archives a crashed process left `processing`. Returns how many.
    pub async fn fail_interrupted(&self) -> Result<u64> {
        let interrupted = Archives::find()
            .filter(archives::Column::Status.eq(ArchiveStatus::Processing))
            .all(&self.db)
            .await?;

        let mut failed = 0;
        for archive in &interrupted {
            tracing::warn!(archive_id = %archive.id, "Archive generation was interrupted");
            if self.fail(archive, INTERRUPTED_MESSAGE).await? {
                failed += 1;
            }
        }

        Ok(failed)
    }

    /// Ids of archives waiting for a worker, oldest first.
    pub async fn pending_ids(&self) -> Result<Vec<String>> {
        let pending = Archives::find()
            .filter(archives::Column::Status.eq(ArchiveStatus::Pending))
            .order_by_asc(archives::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(pending.into_iter().map(|a| a.id).collect())
    }
}

/// Blocking side of the pipeline: drains commands into a deflated ZIP.
fn write_zip(output: std::fs::File, mut rx: mpsc::Receiver<ZipCommand>) -> Result<()> {
    let mut zip = ZipWriter::new(BufWriter::with_capacity(ZIP_WRITE_BUFFER, output));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    let mut entry_open = false;

    while let Some(command) = rx.blocking_recv() {
        match command {
            ZipCommand::StartEntry(name) => {
                zip.start_file(name, options)?;
                entry_open = true;
            }
            ZipCommand::Data(bytes) => {
                if !entry_open {
                    bail!("data received before any ZIP entry");
                }
                zip.write_all(&bytes)?;
            }
        }
    }

    let buffered = zip.finish()?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Consumes the job queue with at most `workers` concurrent generations.
pub struct ArchiveWorkerPool {
    generator: ArchiveGenerator,
    queue: ArchiveQueue,
    receiver: mpsc::Receiver<ArchiveJob>,
    workers: usize,
    poll_interval: Duration,
    shutdown_grace: Duration,
    in_flight: Arc<DashSet<String>>,
    shutdown: watch::Receiver<bool>,
}

impl ArchiveWorkerPool {
    pub fn new(
        generator: ArchiveGenerator,
        queue: ArchiveQueue,
        receiver: mpsc::Receiver<ArchiveJob>,
        config: &StorageConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            generator,
            queue,
            receiver,
            workers: config.archive_workers.max(1),
            poll_interval: Duration::from_secs(config.archive_poll_interval_secs.max(1)),
            shutdown_grace: Duration::from_secs(config.archive_shutdown_grace_secs),
            in_flight: Arc::new(DashSet::new()),
            shutdown,
        }
    }

    /// Startup recovery: fail interrupted runs, requeue everything pending.
    pub async fn recover(&self) -> Result<()> {
        let failed = self.generator.fail_interrupted().await?;
        let pending = self.generator.pending_ids().await?;

        tracing::info!(
            interrupted = failed,
            requeued = pending.len(),
            "🔁 Archive queue recovered"
        );

        for id in pending {
            self.queue.enqueue(&id);
        }
        Ok(())
    }

    pub async fn run(mut self) {
        tracing::info!(workers = self.workers, "🚀 Archive worker pool started");

        if let Err(e) = self.recover().await {
            tracing::error!("Archive recovery failed: {:#}", e);
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Archive worker pool shutting down");
                    break;
                }
                job = self.receiver.recv() => {
                    let Some(job) = job else { break };
                    self.dispatch(job, &semaphore);
                }
                _ = poll.tick() => {
                    match self.generator.pending_ids().await {
                        Ok(ids) => {
                            for archive_id in ids {
                                if !self.in_flight.contains(&archive_id) {
                                    self.dispatch(ArchiveJob { archive_id }, &semaphore);
                                }
                            }
                        }
                        Err(e) => tracing::error!("Pending archive poll failed: {:#}", e),
                    }
                }
            }
        }

        // Let running generations finish before the process exits. Jobs still
        // waiting for a permit give up on shutdown and stay pending.
        let drained = tokio::time::timeout(
            self.shutdown_grace,
            semaphore.acquire_many(self.workers as u32),
        )
        .await;
        if drained.is_err() {
            tracing::warn!(
                in_flight = self.in_flight.len(),
                "Archive generations still running at shutdown"
            );
        }
    }

    /// Never blocks: the job waits for a worker slot in its own task.
    fn dispatch(&self, job: ArchiveJob, semaphore: &Arc<Semaphore>) {
        if !self.in_flight.insert(job.archive_id.clone()) {
            tracing::debug!(archive_id = %job.archive_id, "Archive already in flight");
            return;
        }

        let semaphore = semaphore.clone();
        let generator = self.generator.clone();
        let in_flight = self.in_flight.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let archive_id = job.archive_id;

            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                _ = shutdown.wait_for(|stop| *stop) => None,
            };
            let Some(_permit) = permit else {
                tracing::debug!(archive_id = %archive_id, "Pool stopping, archive left pending");
                in_flight.remove(&archive_id);
                return;
            };

            match generator.generate(&archive_id).await {
                Ok(outcome) => tracing::debug!(archive_id = %archive_id, ?outcome, "Archive job finished"),
                Err(e) => tracing::error!(archive_id = %archive_id, "Archive job error: {:#}", e),
            }

            in_flight.remove(&archive_id);
        });
    }
}
