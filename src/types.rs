//! Core data types shared by the history facade and its callers
//!
//! ## Overview
//!
//! - **Configuration**: [`HistoryConfig`], persisted in `metadata.json` as
//!   part of [`StorageMetadata`]
//! - **Query results**: [`RevisionPoint`], [`Revision`], [`RecentChange`]
//! - **Diagnostics**: [`HistoryStats`]
//! - **Injected behavior**: [`Clock`], [`ResetNotifier`]
//!
//! ## Examples
//!
//! ```rust
//! use chronik::types::HistoryConfig;
//!
//! let config = HistoryConfig {
//!     case_sensitive: false,
//!     ..Default::default()
//! };
//! assert_eq!(config.max_content_size, 1024 * 1024);
//! ```

use crate::change::ChangeId;
use crate::compression::CompressionStrategy;
use crate::content::DEFAULT_MAX_CONTENT_SIZE;
use crate::content_store::ContentStoreStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Source of millisecond timestamps for new change sets
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Called once each time the change log had to be rebuilt after corruption
pub type ResetNotifier = Arc<dyn Fn(&str) + Send + Sync>;

/// Wall-clock [`Clock`]
pub fn system_clock() -> Clock {
    Arc::new(crate::utils::now_millis)
}

/// History configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Whether names differing only in case are distinct
    pub case_sensitive: bool,
    /// Largest content captured into the content store
    pub max_content_size: usize,
    /// Compression for stored contents
    pub compression_strategy: CompressionStrategy,
    /// Identity of the tracked filesystem; a log written for another
    /// identity is discarded on open
    pub fs_identity: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
            compression_strategy: CompressionStrategy::default(),
            fs_identity: 0,
        }
    }
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Version of the change log format
    pub format_version: u32,
    /// Crate version that wrote the storage
    pub version: String,
    /// When the storage was created
    pub created_at: DateTime<Utc>,
    /// When the storage was last opened
    pub last_accessed: DateTime<Utc>,
    /// Configuration the storage was opened with
    pub config: HistoryConfig,
}

/// A moment in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevisionPoint {
    /// The live tree
    Current,
    /// Just before the change set with this id
    Before(ChangeId),
    /// Just after the change set with this id
    After(ChangeId),
}

/// One entry of a resource's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Id of the change set
    pub change_set_id: ChangeId,
    /// When the change set was opened
    pub timestamp: u64,
    /// Change set name, if any
    pub name: Option<String>,
    /// Label names put in this change set
    pub labels: Vec<String>,
    /// Path of the tracked resource right after this change set
    pub path: String,
    /// State before the change set
    pub before: RevisionPoint,
    /// State after the change set
    pub after: RevisionPoint,
}

/// A named change set shown in "recent changes"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChange {
    /// Id of the change set
    pub change_set_id: ChangeId,
    /// Change set name
    pub name: String,
    /// When the change set was opened
    pub timestamp: u64,
    /// State before the change set
    pub before: RevisionPoint,
    /// State after the change set
    pub after: RevisionPoint,
}

/// History statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    /// Persisted change sets
    pub change_sets: usize,
    /// Last allocated change id
    pub last_change_id: u64,
    /// Entries in the live tree, root included
    pub tree_entries: usize,
    /// Content store counters
    pub content: ContentStoreStats,
    /// Whether the change log stopped accepting writes after a failed rebuild
    pub storage_unavailable: bool,
}
