//! Error types for the chronik library
//!
//! Errors fall into four families, and the rest of the crate treats them
//! differently:
//!
//! - **Unavailable content** is not an error at all. Reads return `None`.
//! - **Structural inconsistencies** (a change refers to a path that is not in
//!   the tree) are logged and skipped where they occur; they only surface as
//!   [`ChronikError::EntryNotFound`] from the live-tree mutation API.
//! - **Storage corruption** (I/O failures, cyclic record chains, header
//!   mismatches) triggers a rebuild of the log storage and is then returned
//!   to the caller of the failed operation.
//! - **Contract violations** (adding a change outside a change set) panic.

use thiserror::Error;

/// Type alias for Results in the chronik library
pub type Result<T> = std::result::Result<T, ChronikError>;

/// Main error type for all chronik operations
#[derive(Debug, Error)]
pub enum ChronikError {
    /// I/O errors during storage operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization of storage metadata
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors while encoding or decoding log records
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Record id outside the record table or pointing at a free slot
    #[error("Record not found: {0}")]
    RecordNotFound(u32),

    /// Corruption detected in the change log
    #[error("Corruption detected: {0}")]
    CorruptionDetected(String),

    /// A record chain loops back on itself
    #[error("Cyclic record chain detected at record {0}")]
    CyclicRecordChain(u32),

    /// Persisted header does not match the expected format
    #[error("Header mismatch - expected: {expected}, actual: {actual}")]
    HeaderMismatch {
        /// Expected header value
        expected: String,
        /// Persisted header value
        actual: String,
    },

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Log storage was rebuilt after corruption during this operation
    #[error("History was reset: {0}")]
    HistoryReset(String),

    /// Log storage could not be rebuilt and is inert for this process
    #[error("History storage is unavailable")]
    StorageUnavailable,

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Path does not resolve to an entry in the tree
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Path already resolves to an entry in the tree
    #[error("Entry already exists: {0}")]
    EntryAlreadyExists(String),

    /// Change set or change is not in the log (never recorded or purged)
    #[error("Revision not found: {0}")]
    RevisionNotFound(u64),

    /// Path is malformed or points into a file
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Transient content reached a persistence path
    #[error("Transient content cannot be stored")]
    TransientContent,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid name pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// Directory walk error from the filesystem resource provider
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for ChronikError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ChronikError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ChronikError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ChronikError::Bincode(err.to_string())
    }
}

impl ChronikError {
    /// Create a storage error with a custom message
    pub fn storage(msg: impl Into<String>) -> Self {
        ChronikError::Storage(msg.into())
    }

    /// Create a corruption error with a custom message
    pub fn corruption(msg: impl Into<String>) -> Self {
        ChronikError::CorruptionDetected(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        ChronikError::Compression(msg.into())
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        ChronikError::Decompression(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ChronikError::Internal(msg.into())
    }

    /// Check if this error means the path state disagrees with the tree
    ///
    /// These are absorbed by replay: the log is a cache over a filesystem the
    /// host still owns.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChronikError::EntryNotFound(_)
                | ChronikError::EntryAlreadyExists(_)
                | ChronikError::InvalidPath(_)
        )
    }

    /// Check if this error should trigger a rebuild of the log storage
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ChronikError::Io(_)
                | ChronikError::Bincode(_)
                | ChronikError::RecordNotFound(_)
                | ChronikError::CorruptionDetected(_)
                | ChronikError::CyclicRecordChain(_)
                | ChronikError::HeaderMismatch { .. }
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ChronikError::HistoryReset(_) => {
                "Local history was corrupted and has been reset. Older revisions are no longer available.".to_string()
            }
            ChronikError::StorageUnavailable => {
                "Local history storage could not be rebuilt. History is disabled until restart.".to_string()
            }
            ChronikError::EntryNotFound(path) => {
                format!("'{}' is not tracked by local history.", path)
            }
            _ => self.to_string(),
        }
    }
}
