//! # Chronik - Local change history for resource trees
//!
//! An embedded engine that records every mutation made to a tracked resource
//! tree into a persistent log and reconstructs the state of any resource at
//! any past point by replaying recorded changes backward.
//!
//! ## Overview
//!
//! Chronik sits next to a host that owns the real files. The host reports
//! what happened and Chronik keeps the history:
//! - File and directory creation, content edits, renames, moves, read-only
//!   flips and deletions are recorded as [`Change`]s
//! - Changes are grouped into [`ChangeSet`]s; compound host operations nest
//!   and coalesce into one set
//! - User and system labels mark interesting moments
//! - Any past tree, or any file's past bytes, can be materialized on demand
//! - Old history is purged by elapsed activity time, not wall time
//!
//! ## Architecture
//!
//! - **Content Store**: File bytes are stored once per handle, deduplicated
//!   by SHA-256 and compressed with LZ4
//! - **Change Log**: A doubly linked record table on disk; change sets are
//!   encoded with bincode in a fixed big-endian layout
//! - **Change List**: Nesting, sequencing and newest-first traversal with a
//!   guard against damaged record chains
//! - **Replay Engine**: Reverts changes onto a copy of the live tree, tracking
//!   a path through renames and moves
//! - **Recovery**: A corrupted log is rebuilt and the host is notified once
//!
//! ## Quick Start
//!
//! ```rust
//! use chronik::{LocalHistoryBuilder, RevisionPoint};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let history = LocalHistoryBuilder::new().in_memory();
//!
//! {
//!     let _scope = history.change_set_scope(Some("Create project".to_string()))?;
//!     history.record_create_directory("/src")?;
//!     history.record_create_file("/src/main.rs", b"fn main() {}", 0, false)?;
//! }
//! history.record_content_change("/src/main.rs", b"fn main() { run() }", 1)?;
//! history.record_rename("/src/main.rs", "app.rs")?;
//!
//! let revisions = history.revisions_for("/src/app.rs", None, None)?;
//! assert_eq!(revisions.len(), 3);
//!
//! let original = history.content_at("/src/app.rs", RevisionPoint::After(revisions[2].change_set_id))?;
//! assert_eq!(original.as_deref(), Some(&b"fn main() {}"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, ChronikError>`. Unavailable content is
//! `None`, not an error. When the change log turns out to be corrupted the
//! failing operation returns [`ChronikError::HistoryReset`] after the log was
//! rebuilt, and the configured reset notifier is called once.
//!
//! ## Module Organization
//!
//! - [`history`]: The [`LocalHistory`] facade and its builder
//! - [`change`]: Changes and change sets
//! - [`change_list`]: Nesting, traversal and visitors
//! - [`revert`]: Replay engine and revision collection
//! - [`entry`]: The resource tree
//! - [`content`] / [`content_store`]: Content references and storage
//! - [`log_storage`] / [`record_table`]: Change log storage
//! - [`codec`]: Binary layout of change sets and trees
//! - [`purge`]: Retention policy
//! - [`provider`] / [`listener`]: Host collaborators
//! - [`types`]: Configuration and query results
//! - [`error`]: Error types and handling

// Public API modules
pub mod change;
pub mod change_list;
pub mod codec;
pub mod compression;
pub mod content;
pub mod content_store;
pub mod entry;
pub mod error;
pub mod history;
pub mod listener;
pub mod log_storage;
pub mod paths;
pub mod provider;
pub mod purge;
pub mod record_table;
pub mod revert;
pub mod types;

// Internal modules (not part of public API)
mod collections;
mod utils;

// Re-export main types for convenience
pub use change::{Change, ChangeId, ChangeKind, ChangeSet};
pub use compression::{CompressionEngine, CompressionStrategy};
pub use content::{Content, ContentFactory};
pub use content_store::{ContentId, ContentStore, FileContentStore, MemoryContentStore};
pub use entry::{Entry, RootEntry};
pub use error::{ChronikError, Result};
pub use history::{ChangeSetScope, Label, LocalHistory, LocalHistoryBuilder};
pub use listener::{HistoryListener, ListenerRegistration};
pub use provider::{FsResourceProvider, MemoryResourceProvider, ResourceProvider};
pub use types::*;
