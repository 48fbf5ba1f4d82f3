use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::config::StorageConfig;
use crate::services::archive_service::ArchiveService;
use crate::services::chunk_store::ChunkStore;

/// Periodic cleanup of expired chunk sets and archives.
///
/// Read paths check expiry on their own, so a missed cycle only delays
/// reclaiming space.
pub struct BackgroundWorker {
    chunks: ChunkStore,
    archives: Arc<ArchiveService>,
    chunk_interval: Duration,
    archive_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        chunks: ChunkStore,
        archives: Arc<ArchiveService>,
        config: &StorageConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chunks,
            archives,
            chunk_interval: Duration::from_secs(config.chunk_sweep_interval_secs.max(1)),
            archive_interval: Duration::from_secs(config.archive_sweep_interval_secs.max(1)),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            chunk_interval_secs = self.chunk_interval.as_secs(),
            archive_interval_secs = self.archive_interval.as_secs(),
            "🚀 Background worker started"
        );

        let mut chunk_tick = interval(self.chunk_interval);
        let mut archive_tick = interval(self.archive_interval);
        chunk_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        archive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = chunk_tick.tick() => {
                    self.sweep_chunks().await;
                }
                _ = archive_tick.tick() => {
                    self.sweep_archives().await;
                }
            }
        }
    }

    pub async fn sweep_chunks(&self) -> u64 {
        match self.chunks.sweep_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "🧹 Expired chunks swept");
                }
                removed
            }
            Err(e) => {
                tracing::error!("Chunk sweep failed: {}", e);
                0
            }
        }
    }

    pub async fn sweep_archives(&self) -> u64 {
        match self.archives.sweep_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "🧹 Expired archives swept");
                }
                removed
            }
            Err(e) => {
                tracing::error!("Archive sweep failed: {}", e);
                0
            }
        }
    }
}
