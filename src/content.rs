//! Content references held by file entries and changes
//!
//! A [`Content`] never owns stored bytes; it names them. Bytes live in a
//! [`ContentStore`](crate::content_store::ContentStore) and are read on
//! demand, which keeps tree copies and log traversal cheap.

use crate::content_store::{ContentId, ContentStore};
use crate::error::Result;
use std::sync::Arc;
use tracing::{trace, warn};

/// Default cap on captured content (1 MiB)
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 1024 * 1024;

/// Reference to the bytes of a file at some moment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Handle into the content store
    Stored(ContentId),
    /// Content that was too large to capture or has been released
    Unavailable,
    /// Current bytes supplied by the host; never persisted or released
    Transient(Arc<[u8]>),
}

impl Content {
    /// Handle into the content store, if this content was stored
    pub fn stored_id(&self) -> Option<ContentId> {
        match self {
            Content::Stored(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether bytes can currently be read for this content
    pub fn is_available(&self, store: &dyn ContentStore) -> bool {
        match self {
            Content::Stored(id) => store.is_available(*id),
            Content::Unavailable => false,
            Content::Transient(_) => true,
        }
    }

    /// Read the bytes, `None` when the content is unavailable
    pub fn bytes(&self, store: &dyn ContentStore) -> Result<Option<Vec<u8>>> {
        match self {
            Content::Stored(id) => store.bytes(*id),
            Content::Unavailable => Ok(None),
            Content::Transient(bytes) => Ok(Some(bytes.to_vec())),
        }
    }

    /// Read the bytes, treating storage failures as unavailable content
    pub fn bytes_if_available(&self, store: &dyn ContentStore) -> Option<Vec<u8>> {
        match self.bytes(store) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Content {:?} could not be read: {}", self, e);
                None
            }
        }
    }

    /// Give the stored bytes back to the store
    ///
    /// Transient and unavailable content own nothing, so this is a no-op for
    /// them.
    pub fn release(&self, store: &dyn ContentStore) -> Result<()> {
        match self {
            Content::Stored(id) => store.release(*id),
            Content::Unavailable => Ok(()),
            Content::Transient(_) => {
                trace!("Ignoring release of transient content");
                Ok(())
            }
        }
    }

    /// Byte equality: both sides available and identical
    pub fn same_bytes(&self, other: &Content, store: &dyn ContentStore) -> bool {
        if let (Content::Stored(a), Content::Stored(b)) = (self, other) {
            if a == b {
                return store.is_available(*a);
            }
        }
        match (self.bytes_if_available(store), other.bytes_if_available(store)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Decides how captured bytes become [`Content`]
#[derive(Debug, Clone, Copy)]
pub struct ContentFactory {
    max_size: usize,
}

impl Default for ContentFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT_SIZE)
    }
}

impl ContentFactory {
    /// Create a factory that refuses to store more than `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Largest content that is still stored
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Capture bytes into the store, or mark them unavailable if too large
    pub fn create(&self, store: &dyn ContentStore, bytes: &[u8]) -> Result<Content> {
        if bytes.len() > self.max_size {
            trace!("Content of {} bytes exceeds limit of {}", bytes.len(), self.max_size);
            return Ok(Content::Unavailable);
        }
        Ok(Content::Stored(store.store(bytes)?))
    }

    /// Wrap current host bytes without storing them
    pub fn transient(bytes: impl Into<Arc<[u8]>>) -> Content {
        Content::Transient(bytes.into())
    }
}
