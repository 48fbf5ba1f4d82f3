use std::env;
use std::path::PathBuf;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Storage, chunking and archive configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory for blobs and archives (default: "./data/storage")
    pub storage_root: PathBuf,

    /// Files at or above this size are served through the chunk store (default: 25 MB)
    pub large_file_threshold: u64,

    /// Size of a single chunk record in bytes (default: 255 KB)
    pub chunk_size: u64,

    /// Lifetime of a chunk set in hours (default: 24)
    pub chunk_ttl_hours: i64,

    /// Number of chunk records inserted per statement (default: 16)
    pub chunk_insert_batch: usize,

    /// Number of chunk records fetched per query while reading (default: 8)
    pub chunk_read_window: u64,

    /// Read window for direct blob streams in bytes (default: 64 KB)
    pub read_buffer_size: usize,

    /// Maximum upload size in bytes (default: 50 GB)
    pub max_upload_size: u64,

    /// Ceiling for the estimated size of an archive (default: 50 GB)
    pub archive_max_size: u64,

    /// Days a completed archive stays downloadable (default: 7)
    pub archive_expiration_days: i64,

    /// Concurrent archive generations (default: 2)
    pub archive_workers: usize,

    /// Pending archive jobs buffered in memory (default: 64)
    pub archive_queue_capacity: usize,

    /// How often workers look for pending archives nobody queued locally (default: 30 s)
    pub archive_poll_interval_secs: u64,

    /// How long shutdown waits for running generations (default: 30 s)
    pub archive_shutdown_grace_secs: u64,

    /// Interval between chunk expiry sweeps in seconds (default: 1 hour)
    pub chunk_sweep_interval_secs: u64,

    /// Interval between archive expiry sweeps in seconds (default: 6 hours)
    pub archive_sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data/storage"),
            large_file_threshold: 25 * MIB,
            chunk_size: 255 * KIB,
            chunk_ttl_hours: 24,
            chunk_insert_batch: 16,
            chunk_read_window: 8,
            read_buffer_size: 64 * KIB as usize,
            max_upload_size: 50 * GIB,
            archive_max_size: 50 * GIB,
            archive_expiration_days: 7,
            archive_workers: 2,
            archive_queue_capacity: 64,
            archive_poll_interval_secs: 30,
            archive_shutdown_grace_secs: 30,
            chunk_sweep_interval_secs: 3600,
            archive_sweep_interval_secs: 6 * 3600,
        }
    }
}

impl StorageConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            storage_root: env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.storage_root),

            large_file_threshold: parse_env("LARGE_FILE_THRESHOLD")
                .unwrap_or(default.large_file_threshold),

            chunk_size: parse_env("CHUNK_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(default.chunk_size),

            chunk_ttl_hours: parse_env("CHUNK_TTL_HOURS").unwrap_or(default.chunk_ttl_hours),

            chunk_insert_batch: parse_env("CHUNK_INSERT_BATCH")
                .filter(|batch| *batch > 0)
                .unwrap_or(default.chunk_insert_batch),

            chunk_read_window: parse_env("CHUNK_READ_WINDOW")
                .filter(|window| *window > 0)
                .unwrap_or(default.chunk_read_window),

            read_buffer_size: parse_env("READ_BUFFER_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(default.read_buffer_size),

            max_upload_size: parse_env("MAX_UPLOAD_SIZE").unwrap_or(default.max_upload_size),

            archive_max_size: parse_env("ARCHIVE_MAX_SIZE").unwrap_or(default.archive_max_size),

            archive_expiration_days: parse_env("ARCHIVE_EXPIRATION_DAYS")
                .unwrap_or(default.archive_expiration_days),

            archive_workers: parse_env("ARCHIVE_WORKERS")
                .filter(|workers| *workers > 0)
                .unwrap_or(default.archive_workers),

            archive_queue_capacity: parse_env("ARCHIVE_QUEUE_CAPACITY")
                .filter(|capacity| *capacity > 0)
                .unwrap_or(default.archive_queue_capacity),

            archive_poll_interval_secs: parse_env("ARCHIVE_POLL_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(default.archive_poll_interval_secs),

            archive_shutdown_grace_secs: parse_env("ARCHIVE_SHUTDOWN_GRACE_SECS")
                .unwrap_or(default.archive_shutdown_grace_secs),

            chunk_sweep_interval_secs: parse_env("CHUNK_SWEEP_INTERVAL_SECS")
                .unwrap_or(default.chunk_sweep_interval_secs),

            archive_sweep_interval_secs: parse_env("ARCHIVE_SWEEP_INTERVAL_SECS")
                .unwrap_or(default.archive_sweep_interval_secs),
        }
    }

    /// Create config for development and tests (small thresholds, frequent sweeps)
    pub fn development() -> Self {
        Self {
            large_file_threshold: 64 * KIB,
            chunk_size: 4 * KIB,
            chunk_insert_batch: 4,
            chunk_read_window: 3,
            read_buffer_size: 1024,
            archive_poll_interval_secs: 2,
            chunk_sweep_interval_secs: 60,
            archive_sweep_interval_secs: 300,
            ..Self::default()
        }
    }

    pub fn chunk_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.chunk_ttl_hours)
    }

    pub fn archive_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.archive_expiration_days)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.large_file_threshold, 25 * 1024 * 1024);
        assert_eq!(config.chunk_size, 255 * 1024);
        assert_eq!(config.chunk_ttl_hours, 24);
        assert_eq!(config.archive_max_size, 50 * 1024 * 1024 * 1024);
        assert_eq!(config.archive_expiration_days, 7);
        assert_eq!(config.chunk_sweep_interval_secs, 3600);
        assert_eq!(config.archive_sweep_interval_secs, 21600);
        assert_eq!(config.archive_shutdown_grace_secs, 30);
    }

    #[test]
    fn test_development_config() {
        let config = StorageConfig::development();
        assert!(config.large_file_threshold < StorageConfig::default().large_file_threshold);
        assert!(config.chunk_size < config.large_file_threshold);
        assert_eq!(config.archive_expiration_days, 7);
    }

    #[test]
    fn test_ttl_helpers() {
        let config = StorageConfig::default();
        assert_eq!(config.chunk_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.archive_ttl(), chrono::Duration::days(7));
    }
}
