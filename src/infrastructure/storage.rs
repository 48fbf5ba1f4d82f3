use crate::config::StorageConfig;
use crate::services::paths::ARCHIVE_DIR;
use crate::services::storage::LocalBlobStore;
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

/// Prepare the storage root and the blob store on top of it.
pub async fn setup_storage(config: &StorageConfig) -> anyhow::Result<Arc<LocalBlobStore>> {
    let root = &config.storage_root;

    tokio::fs::create_dir_all(root.join(ARCHIVE_DIR))
        .await
        .with_context(|| format!("cannot create storage root {}", root.display()))?;

    let root = tokio::fs::canonicalize(root)
        .await
        .with_context(|| format!("cannot resolve storage root {}", config.storage_root.display()))?;

    info!("💾 Blob storage: {}", root.display());

    Ok(Arc::new(LocalBlobStore::new(root, config.read_buffer_size)))
}
