//! Storage path allocation.
//!
//! Blobs live at `{year}/{month}/{id}.{ext}` and archives at
//! `archives/{year}/{month}/{id}.zip`, both relative to the storage root.

use chrono::{DateTime, Datelike, Utc};

pub const ARCHIVE_DIR: &str = "archives";
const FALLBACK_EXTENSION: &str = "bin";
const MAX_EXTENSION_LEN: usize = 10;

/// Path for a stored file, partitioned by the period it was issued in.
pub fn blob_path(file_id: &str, original_name: &str, issued_at: DateTime<Utc>) -> String {
    format!(
        "{:04}/{:02}/{}.{}",
        issued_at.year(),
        issued_at.month(),
        file_id,
        extension_of(original_name)
    )
}

/// Path for a generated archive.
pub fn archive_path(archive_id: &str, issued_at: DateTime<Utc>) -> String {
    format!(
        "{}/{:04}/{:02}/{}.zip",
        ARCHIVE_DIR,
        issued_at.year(),
        issued_at.month(),
        archive_id
    )
}

/// Lowercased extension of `original_name`, restricted to ASCII alphanumerics.
pub fn extension_of(original_name: &str) -> String {
    let Some((stem, ext)) = original_name.rsplit_once('.') else {
        return FALLBACK_EXTENSION.to_string();
    };

    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return FALLBACK_EXTENSION.to_string();
    }

    ext.to_ascii_lowercase()
}
