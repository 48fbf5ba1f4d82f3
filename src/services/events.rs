//! Outbound lifecycle notifications.
//!
//! Delivery is fire-and-forget: a publisher never blocks or fails the
//! operation that produced the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::entities::archives::ArchiveType;
use crate::entities::stored_files::FileKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum StorageEvent {
    #[serde(rename = "file.uploaded")]
    FileUploaded {
        file_id: String,
        shoot_id: String,
        size_bytes: u64,
        kind: FileKind,
    },
    #[serde(rename = "file.deleted")]
    FileDeleted { file_id: String, shoot_id: String },
    #[serde(rename = "archive.created")]
    ArchiveCreated {
        archive_id: String,
        shoot_id: String,
        archive_type: ArchiveType,
        file_count: usize,
    },
    #[serde(rename = "archive.ready")]
    ArchiveReady {
        archive_id: String,
        shoot_id: String,
        size_bytes: u64,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "archive.failed")]
    ArchiveFailed {
        archive_id: String,
        shoot_id: String,
        error: String,
    },
}

impl StorageEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StorageEvent::FileUploaded { .. } => "file.uploaded",
            StorageEvent::FileDeleted { .. } => "file.deleted",
            StorageEvent::ArchiveCreated { .. } => "archive.created",
            StorageEvent::ArchiveReady { .. } => "archive.ready",
            StorageEvent::ArchiveFailed { .. } => "archive.failed",
        }
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: StorageEvent);
}

/// In-process publisher; collaborators attach through [`BroadcastPublisher::subscribe`].
pub struct BroadcastPublisher {
    sender: broadcast::Sender<StorageEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: StorageEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(event = event.name(), payload = %payload, "📣 Lifecycle event");

        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}
