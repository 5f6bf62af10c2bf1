//! Utility functions shared by the storage layers
//!
//! - **Hashing**: SHA-256 content addressing for the content store
//! - **Time**: millisecond timestamps used by change sets and log records
//! - **Files**: atomic replacement of small metadata files
//! - **Formatting**: human readable sizes for log output

use crate::error::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

/// Hash arbitrary data using SHA-256
///
/// Returns the hash as a 64-character hexadecimal string.
///
/// # Example
///
/// ```rust,ignore
/// let hash = hash_data(b"Hello, world!");
/// assert_eq!(hash.len(), 64);
/// ```
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Atomically replace a file's content
///
/// Writes into a temporary file in the same directory and persists it over
/// the target, so readers see either the old or the new content.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
