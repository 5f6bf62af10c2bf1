//! The local history facade
//!
//! [`LocalHistory`] is the entry point for hosts. It owns the live tree, the
//! change list and the content store, and turns host notifications
//! (`record_*`) into recorded changes and history queries into replays.
//!
//! ## Storage layout
//!
//! ```text
//! history/
//! ├── metadata.json      # Format version, crate version, configuration
//! ├── tree.bin           # Live tree as of the last flush
//! ├── changes/
//! │   ├── records.idx    # Header and fixed-size record slots
//! │   └── records.dat    # Encoded change sets
//! └── contents/
//!     ├── handles.bin    # Handle to object hash table
//!     └── objects/       # Compressed content objects
//! ```
//!
//! ## Thread Safety
//!
//! The live tree and the change list sit behind two separate locks, always
//! taken in that order. Recording takes both for writing, queries take both
//! for reading and labels only need the change list. Listeners are called
//! after both locks were released.
//!
//! ## Examples
//!
//! ```rust
//! use chronik::LocalHistoryBuilder;
//! use chronik::types::RevisionPoint;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let history = LocalHistoryBuilder::new().in_memory();
//!
//! history.record_create_file("/notes.txt", b"first", 1, false)?;
//! history.record_content_change("/notes.txt", b"second", 2)?;
//!
//! let revisions = history.revisions_for("/notes.txt", None, None)?;
//! assert_eq!(revisions.len(), 2);
//!
//! let before = history.content_at("/notes.txt", RevisionPoint::Before(revisions[0].change_set_id))?;
//! assert_eq!(before.as_deref(), Some(&b"first"[..]));
//! # Ok(())
//! # }
//! ```

use crate::change::{Change, ChangeId, ChangeKind, ChangeSet};
use crate::change_list::ChangeList;
use crate::codec;
use crate::content::{Content, ContentFactory};
use crate::content_store::{ContentStore, FileContentStore, MemoryContentStore};
use crate::entry::{Entry, RootEntry};
use crate::error::{ChronikError, Result};
use crate::listener::{HistoryListener, ListenerRegistration, Listeners};
use crate::log_storage::{ChangeLogStorage, MemoryLogStorage};
use crate::paths::{self, Paths};
use crate::provider::ResourceProvider;
use crate::purge::PurgePolicy;
use crate::record_table::{FileChangeLogStorage, FORMAT_VERSION};
use crate::revert::{self, RevertTarget};
use crate::types::*;
use crate::utils;
use chrono::Utc;
use globset::GlobBuilder;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Most entries returned by [`LocalHistory::recent_changes`]
pub const RECENT_CHANGES_LIMIT: usize = 20;

const METADATA_FILE: &str = "metadata.json";
const TREE_FILE: &str = "tree.bin";
const CHANGES_DIR: &str = "changes";
const CONTENTS_DIR: &str = "contents";

/// Records changes to a resource tree and answers history queries
///
/// # Examples
///
/// ```rust,no_run
/// use chronik::LocalHistoryBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let history = LocalHistoryBuilder::new()
///     .case_sensitive(false)
///     .open("./.history")?;
///
/// history.begin_change_set()?;
/// history.record_create_directory("/src")?;
/// history.record_create_file("/src/main.rs", b"fn main() {}", 0, false)?;
/// history.end_change_set(Some("Create project".to_string()))?;
///
/// history.close()?;
/// # Ok(())
/// # }
/// ```
pub struct LocalHistory {
    /// Storage directory, `None` for in-memory histories
    storage_path: Option<PathBuf>,
    /// Configuration
    config: HistoryConfig,
    /// Persisted metadata, for on-disk histories
    metadata: Option<Arc<RwLock<StorageMetadata>>>,
    /// Live tree
    entries: Arc<RwLock<RootEntry>>,
    /// Change list over the log storage
    changes: Arc<RwLock<ChangeList>>,
    /// Content store
    contents: Arc<dyn ContentStore>,
    factory: ContentFactory,
    provider: Option<Arc<dyn ResourceProvider>>,
    listeners: Listeners,
    on_reset: Option<ResetNotifier>,
    clock: Clock,
    closed: AtomicBool,
}

impl std::fmt::Debug for LocalHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHistory")
            .field("storage_path", &self.storage_path)
            .field("config", &self.config)
            .field("changes", &self.changes)
            .field("contents", &self.contents)
            .field("provider", &self.provider.is_some())
            .field("listeners", &self.listeners)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalHistory {
    /// Open or create an on-disk history with default settings
    pub fn open(storage_path: impl Into<PathBuf>) -> Result<Self> {
        LocalHistoryBuilder::new().open(storage_path)
    }

    /// Create a history that keeps everything in memory
    pub fn in_memory() -> Self {
        LocalHistoryBuilder::new().in_memory()
    }

    /// Storage directory, `None` for in-memory histories
    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    /// Configuration the history was opened with
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Path rules of the live tree
    pub fn paths(&self) -> Paths {
        *self.entries.read().paths()
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record a new file
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub fn record_create_file(&self, path: &str, content: &[u8], timestamp: u64, read_only: bool) -> Result<()> {
        let path = paths::normalize(path);
        self.record(|_| {
            let content = self.factory.create(self.contents.as_ref(), content)?;
            Ok(vec![ChangeKind::CreateFile {
                path,
                content,
                timestamp,
                read_only,
            }])
        })
    }

    /// Record a new, empty directory
    #[instrument(skip(self))]
    pub fn record_create_directory(&self, path: &str) -> Result<()> {
        let path = paths::normalize(path);
        self.record(|_| Ok(vec![ChangeKind::CreateDirectory { path }]))
    }

    /// Record a file or a whole directory subtree read from the resource
    /// provider
    ///
    /// # Errors
    ///
    /// - [`ChronikError::InvalidConfiguration`] if no provider was configured
    /// - any error the provider reports
    #[instrument(skip(self))]
    pub fn record_create(&self, path: &str) -> Result<()> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| ChronikError::InvalidConfiguration("no resource provider configured".to_string()))?;
        let path = paths::normalize(path);
        self.record(|_| {
            let mut kinds = Vec::new();
            if let Err(e) = self.capture(provider.as_ref(), &path, &mut kinds) {
                self.release_captured(&kinds);
                return Err(e);
            }
            debug!("Captured {} entries under {}", kinds.len(), path);
            Ok(kinds)
        })
    }

    fn capture(&self, provider: &dyn ResourceProvider, path: &str, kinds: &mut Vec<ChangeKind>) -> Result<()> {
        if provider.is_directory(path)? {
            kinds.push(ChangeKind::CreateDirectory { path: path.to_string() });
            for name in provider.list(path)? {
                self.capture(provider, &paths::append(path, &name), kinds)?;
            }
            return Ok(());
        }
        let bytes = provider.content(path)?;
        kinds.push(ChangeKind::CreateFile {
            path: path.to_string(),
            content: self.factory.create(self.contents.as_ref(), &bytes)?,
            timestamp: provider.timestamp(path)?,
            read_only: provider.is_read_only(path)?,
        });
        Ok(())
    }

    /// Give back contents stored for changes that were never recorded
    fn release_captured(&self, kinds: &[ChangeKind]) {
        for kind in kinds {
            let content = match kind {
                ChangeKind::CreateFile { content, .. } => content,
                ChangeKind::ContentChange { new_content, .. } => new_content,
                _ => continue,
            };
            if let Err(e) = content.release(self.contents.as_ref()) {
                warn!("Failed to release captured content: {}", e);
            }
        }
    }

    /// Record new bytes for a file
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub fn record_content_change(&self, path: &str, content: &[u8], timestamp: u64) -> Result<()> {
        let path = paths::normalize(path);
        self.record(|tree| {
            let file = tree
                .find(&path)
                .ok_or_else(|| ChronikError::EntryNotFound(path.clone()))?
                .as_file()
                .ok_or_else(|| ChronikError::InvalidPath(format!("{} is a directory", path)))?;
            let (old_content, old_timestamp) = (file.content.clone(), file.timestamp);
            let new_content = self.factory.create(self.contents.as_ref(), content)?;
            Ok(vec![ChangeKind::ContentChange {
                path: path.clone(),
                old_content,
                old_timestamp,
                new_content,
                new_timestamp: timestamp,
            }])
        })
    }

    /// Record that the entry at `path` was renamed to `new_name`
    #[instrument(skip(self))]
    pub fn record_rename(&self, path: &str, new_name: &str) -> Result<()> {
        let path = paths::normalize(path);
        if new_name.is_empty() || new_name.contains(paths::SEPARATOR) {
            return Err(ChronikError::InvalidPath(format!("invalid name '{}'", new_name)));
        }
        self.record(|tree| {
            if !tree.has(&path) {
                return Err(ChronikError::EntryNotFound(path.clone()));
            }
            Ok(vec![ChangeKind::Rename {
                path: paths::renamed(&path, new_name),
                old_name: paths::name(&path).to_string(),
            }])
        })
    }

    /// Record that the entry at `path` moved into the directory `new_parent`
    #[instrument(skip(self))]
    pub fn record_move(&self, path: &str, new_parent: &str) -> Result<()> {
        let path = paths::normalize(path);
        let new_parent = paths::normalize(new_parent);
        self.record(|tree| {
            if !tree.has(&path) {
                return Err(ChronikError::EntryNotFound(path.clone()));
            }
            let old_parent_path = paths::parent(&path)
                .ok_or_else(|| ChronikError::InvalidPath("cannot move the root".to_string()))?;
            Ok(vec![ChangeKind::Move {
                path: paths::append(&new_parent, paths::name(&path)),
                old_parent_path,
            }])
        })
    }

    /// Record a read-only flag change; a flag that did not change is ignored
    #[instrument(skip(self))]
    pub fn record_read_only_change(&self, path: &str, read_only: bool) -> Result<()> {
        let path = paths::normalize(path);
        self.record(|tree| {
            let file = tree
                .find(&path)
                .ok_or_else(|| ChronikError::EntryNotFound(path.clone()))?
                .as_file()
                .ok_or_else(|| ChronikError::InvalidPath(format!("{} is a directory", path)))?;
            if file.read_only == read_only {
                trace!("Read-only flag of {} unchanged", path);
                return Ok(Vec::new());
            }
            Ok(vec![ChangeKind::ReadOnlyStatusChange {
                path: path.clone(),
                old_read_only: file.read_only,
            }])
        })
    }

    /// Record that the entry at `path` and everything below it was deleted
    #[instrument(skip(self))]
    pub fn record_delete(&self, path: &str) -> Result<()> {
        let path = paths::normalize(path);
        self.record(|tree| {
            let deleted = tree
                .find(&path)
                .cloned()
                .ok_or_else(|| ChronikError::EntryNotFound(path.clone()))?;
            Ok(vec![ChangeKind::Delete { path: path.clone(), deleted }])
        })
    }

    /// Build changes against the live tree, apply them and add them to the
    /// open change set (or a set of their own)
    fn record<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&RootEntry) -> Result<Vec<ChangeKind>>,
    {
        let mut added = Vec::new();
        let (result, finished) = self.record_locked(build, &mut added);
        let result = self.reported(result);

        for change in &added {
            self.listeners.change_added(change);
        }
        if finished {
            self.listeners.change_set_finished();
        }
        result
    }

    /// Everything `record` does under the write locks
    ///
    /// Returns whether an outermost set was finished alongside the outcome;
    /// a set can be finished even when a later change in it was rejected.
    fn record_locked<F>(&self, build: F, added: &mut Vec<Change>) -> (Result<()>, bool)
    where
        F: FnOnce(&RootEntry) -> Result<Vec<ChangeKind>>,
    {
        let mut entries = self.entries.write();
        let mut changes = self.changes.write();

        let kinds = match build(&entries) {
            Ok(kinds) => kinds,
            Err(e) => {
                warn!("Not recording change: {}", e);
                return (Err(e), false);
            }
        };
        if kinds.is_empty() {
            return (Ok(()), false);
        }

        if let Err(e) = changes.begin_change_set() {
            self.release_captured(&kinds);
            return (Err(Self::recover(&mut changes, e)), false);
        }

        let mut result = Ok(());
        let mut pending = kinds.into_iter();
        while let Some(kind) = pending.next() {
            let change = match changes.next_id() {
                Ok(id) => Change::new(id, kind),
                Err(e) => {
                    self.release_captured(std::slice::from_ref(&kind));
                    result = Err(e);
                    break;
                }
            };
            if let Err(e) = change.apply_to(&mut entries) {
                warn!("Change {} does not fit the live tree: {}", change.id, e);
                self.release_captured(std::slice::from_ref(&change.kind));
                result = Err(e);
                break;
            }
            changes.add_change(change.clone());
            added.push(change);
        }
        self.release_captured(&pending.collect::<Vec<_>>());

        let finished = match changes.end_change_set(None) {
            Ok(finished) => finished,
            Err(e) => return (Err(Self::recover(&mut changes, e)), false),
        };
        let result = match result {
            Err(e) if e.is_corruption() => Err(Self::recover(&mut changes, e)),
            other => other,
        };
        if finished {
            self.checkpoint(&entries);
        }
        (result, finished)
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Put a label named by the user
    #[instrument(skip(self))]
    pub fn put_user_label(&self, name: &str, project_id: Option<&str>) -> Result<Label> {
        let timestamp = (self.clock)();
        self.put_label(ChangeKind::PutUserLabel {
            name: name.to_string(),
            project_id: project_id.map(str::to_string),
            timestamp,
        })
    }

    /// Put a label on behalf of the host, shown in `color` (RGB)
    #[instrument(skip(self))]
    pub fn put_system_label(&self, name: &str, project_id: Option<&str>, color: u32) -> Result<Label> {
        let timestamp = (self.clock)();
        self.put_label(ChangeKind::PutSystemLabel {
            name: name.to_string(),
            project_id: project_id.map(str::to_string),
            color,
            timestamp,
        })
    }

    fn put_label(&self, kind: ChangeKind) -> Result<Label> {
        let outcome = {
            let mut changes = self.changes.write();
            match add_label(&mut changes, kind) {
                Err(e) if e.is_corruption() => Err(Self::recover(&mut changes, e)),
                other => other,
            }
        };
        let (change, finished) = self.reported(outcome)?;

        info!("Put label '{}'", change.label_name().unwrap_or_default());
        self.listeners.change_added(&change);
        if finished {
            self.listeners.change_set_finished();
        }
        Ok(Label {
            change_id: change.id,
            name: change.label_name().unwrap_or_default().to_string(),
            entries: Arc::clone(&self.entries),
            changes: Arc::clone(&self.changes),
            contents: Arc::clone(&self.contents),
        })
    }

    // ------------------------------------------------------------------
    // Change sets
    // ------------------------------------------------------------------

    /// Open a change set; nested calls join the outermost one
    pub fn begin_change_set(&self) -> Result<()> {
        let result = {
            let mut changes = self.changes.write();
            match changes.begin_change_set() {
                Err(e) if e.is_corruption() => Err(Self::recover(&mut changes, e)),
                other => other,
            }
        };
        self.reported(result)
    }

    /// Close a change set
    ///
    /// Returns `true` when the outermost set was closed with changes in it.
    ///
    /// # Panics
    ///
    /// Panics when no change set is open.
    pub fn end_change_set(&self, name: Option<String>) -> Result<bool> {
        let result = {
            let mut changes = self.changes.write();
            match changes.end_change_set(name) {
                Err(e) if e.is_corruption() => Err(Self::recover(&mut changes, e)),
                other => other,
            }
        };
        let finished = self.reported(result)?;
        if finished {
            self.checkpoint(&self.entries.read());
            self.listeners.change_set_finished();
        }
        Ok(finished)
    }

    /// Close the open change set, if any, and open a new one
    ///
    /// Returns whether an open set with changes was split off and finished.
    pub fn force_begin_change_set(&self) -> Result<bool> {
        let result = {
            let mut changes = self.changes.write();
            match changes.force_begin_change_set() {
                Err(e) if e.is_corruption() => Err(Self::recover(&mut changes, e)),
                other => other,
            }
        };
        let finished = self.reported(result)?;
        if finished {
            self.checkpoint(&self.entries.read());
            self.listeners.change_set_finished();
        }
        Ok(finished)
    }

    /// Open a change set that is closed, with `name`, when the scope is
    /// dropped
    pub fn change_set_scope(&self, name: Option<String>) -> Result<ChangeSetScope<'_>> {
        self.begin_change_set()?;
        Ok(ChangeSetScope {
            history: self,
            name,
            finished: false,
        })
    }

    /// Register a listener; it stays registered while the returned
    /// registration is alive
    pub fn add_listener(&self, listener: Arc<dyn HistoryListener>) -> ListenerRegistration {
        self.listeners.add(listener)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The most recent named change sets, newest first
    ///
    /// Sets that only changed file contents or only put labels are skipped.
    #[instrument(skip(self))]
    pub fn recent_changes(&self) -> Result<Vec<RecentChange>> {
        let result = {
            let changes = self.changes.read();
            let mut recent = Vec::new();
            let mut result = Ok(());
            for set in changes.iterate() {
                let set = match set {
                    Ok(set) => set,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                };
                if set.is_content_change_only() || set.is_label_only() {
                    continue;
                }
                let Some(name) = set.name.clone() else {
                    continue;
                };
                recent.push(RecentChange {
                    change_set_id: set.id,
                    name,
                    timestamp: set.timestamp,
                    before: RevisionPoint::Before(set.id),
                    after: RevisionPoint::After(set.id),
                });
                if recent.len() == RECENT_CHANGES_LIMIT {
                    break;
                }
            }
            result.map(|()| recent)
        };
        self.checked(result)
    }

    /// Every change set, newest first, including the open one
    pub fn change_sets(&self) -> Result<Vec<ChangeSet>> {
        let result = {
            let changes = self.changes.read();
            changes.iterate().collect::<Result<Vec<_>>>()
        };
        self.checked(result)
    }

    /// History of `path`, newest first
    ///
    /// The path is followed back through renames and moves. Labels are
    /// included when they belong to `project_id`. `pattern` is a glob over
    /// file names; when given, only change sets touching a matching name are
    /// kept.
    #[instrument(skip(self))]
    pub fn revisions_for(&self, path: &str, project_id: Option<&str>, pattern: Option<&str>) -> Result<Vec<Revision>> {
        let start = Instant::now();
        let matcher = pattern
            .map(|p| {
                GlobBuilder::new(p)
                    .case_insensitive(!self.config.case_sensitive)
                    .build()
                    .map(|g| g.compile_matcher())
            })
            .transpose()?;

        let result = {
            let entries = self.entries.read();
            let changes = self.changes.read();
            revert::collect_revisions(&changes, &entries, path, project_id, matcher.as_ref())
        };
        let revisions = self.checked(result)?;
        debug!(
            "Collected {} revisions of {} in {}",
            revisions.len(),
            path,
            humantime::format_duration(start.elapsed())
        );
        Ok(revisions)
    }

    /// The whole tree at a revision point
    pub fn tree_at(&self, point: RevisionPoint) -> Result<RootEntry> {
        let result = {
            let entries = self.entries.read();
            let changes = self.changes.read();
            revert::revert_to_point(&changes, &entries, point, None)
        };
        Ok(self.checked(result)?.tree)
    }

    /// Bytes of the file now at `path` as of a revision point
    ///
    /// Returns `None` when the file did not exist then, was a directory, or
    /// its content is unavailable.
    pub fn content_at(&self, path: &str, point: RevisionPoint) -> Result<Option<Vec<u8>>> {
        let result = {
            let entries = self.entries.read();
            let changes = self.changes.read();
            revert::revert_to_point(&changes, &entries, point, Some(path))
        };
        let reverted = self.checked(result)?;
        Ok(file_bytes(&reverted, self.contents.as_ref()))
    }

    /// Current content of a file
    ///
    /// Asks the resource provider first and falls back to the live tree.
    pub fn current_content(&self, path: &str) -> Option<Content> {
        let path = paths::normalize(path);
        if let Some(provider) = &self.provider {
            match provider.content(&path) {
                Ok(bytes) => return Some(ContentFactory::transient(bytes)),
                Err(e) => debug!("Provider has no content for {}: {}", path, e),
            }
        }
        let entries = self.entries.read();
        entries.find(&path)?.as_file().map(|f| f.content.clone())
    }

    /// Read a content's bytes, `None` when unavailable
    pub fn content_bytes(&self, content: &Content) -> Option<Vec<u8>> {
        content.bytes_if_available(self.contents.as_ref())
    }

    /// Copy of the live entry at `path`
    pub fn entry(&self, path: &str) -> Option<Entry> {
        self.entries.read().find(&paths::normalize(path)).cloned()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop history older than `period` of activity
    ///
    /// Gaps between change sets longer than `interval` count as one
    /// millisecond of activity. Returns the number of removed change sets.
    #[instrument(skip(self))]
    pub fn purge(&self, period: Duration, interval: Duration) -> Result<usize> {
        let policy = PurgePolicy::new(period, interval);
        let result = {
            let mut changes = self.changes.write();
            changes.purge(&policy)
        };
        let removed = self.checked(result)?;

        let mut released = 0;
        for set in &removed {
            for content in set.contents_to_purge() {
                match content.release(self.contents.as_ref()) {
                    Ok(()) => released += 1,
                    Err(e) => warn!("Failed to release content of change set {}: {}", set.id, e),
                }
            }
        }
        info!(
            "Purged {} change sets and {} contents (period {}, interval {})",
            removed.len(),
            released,
            humantime::format_duration(period),
            humantime::format_duration(interval)
        );
        Ok(removed.len())
    }

    /// Persist the log, contents, live tree and metadata
    #[instrument(skip(self))]
    pub fn flush(&self) -> Result<()> {
        let result = self.changes.write().flush();
        self.checked(result)?;
        self.contents.flush()?;
        self.save_state()
    }

    /// Close any open change set and persist everything
    ///
    /// Called on drop if not called before.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing local history");
        let result = self.changes.write().close();
        self.checked(result)?;
        self.contents.flush()?;
        self.save_state()
    }

    /// Current statistics
    pub fn stats(&self) -> HistoryStats {
        let tree_entries = self.entries.read().root().count();
        let changes = self.changes.read();
        HistoryStats {
            change_sets: changes.storage().record_count(),
            last_change_id: changes.storage().last_assigned_id(),
            tree_entries,
            content: self.contents.stats(),
            storage_unavailable: changes.is_inert(),
        }
    }

    /// Keep fresh content handles above every handle the tree or the log
    /// refers to, even when the handle table was not saved
    fn reserve_referenced_contents(&self) -> Result<()> {
        let entries = self.entries.read();
        let changes = self.changes.read();

        let mut highest = entries.root().contents().iter().filter_map(Content::stored_id).max();
        for set in changes.iterate() {
            let set = match set {
                Ok(set) => set,
                Err(e) => {
                    warn!("Stopped scanning the change log for content handles: {}", e);
                    break;
                }
            };
            let in_set = set
                .changes
                .iter()
                .flat_map(Change::referenced_contents)
                .filter_map(|content| content.stored_id())
                .max();
            highest = highest.max(in_set);
        }

        if let Some(id) = highest {
            self.contents.reserve_past(id)?;
        }
        Ok(())
    }

    fn save_state(&self) -> Result<()> {
        let Some(root) = &self.storage_path else {
            return Ok(());
        };
        self.save_tree(root, &self.entries.read())?;

        if let Some(metadata) = &self.metadata {
            let mut metadata = metadata.write();
            metadata.last_accessed = Utc::now();
            utils::atomic_write(&root.join(METADATA_FILE), &serde_json::to_vec_pretty(&*metadata)?)?;
        }
        Ok(())
    }

    fn save_tree(&self, root: &Path, tree: &RootEntry) -> Result<()> {
        let bytes = codec::encode_entry(tree.root())?;
        utils::atomic_write(&root.join(TREE_FILE), &bytes)?;
        debug!("Saved live tree ({} bytes)", bytes.len());
        Ok(())
    }

    /// Bring the handle table and the live tree in line with a change set
    /// that just reached the log
    fn checkpoint(&self, tree: &RootEntry) {
        let Some(root) = &self.storage_path else {
            return;
        };
        if let Err(e) = self.contents.flush().and_then(|()| self.save_tree(root, tree)) {
            warn!("Failed to save state after change set: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Rebuild the log if `result` failed with corruption
    ///
    /// Must be called with no lock held.
    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        let result = match result {
            Err(e) if e.is_corruption() => {
                let mut changes = self.changes.write();
                Err(Self::recover(&mut changes, e))
            }
            other => other,
        };
        self.reported(result)
    }

    /// Rebuild the log after `cause` and return the error for the caller
    ///
    /// The host is not told yet; pass the result through
    /// [`reported`](Self::reported) once the lock is released.
    fn recover(changes: &mut ChangeList, cause: ChronikError) -> ChronikError {
        match changes.recover(&cause) {
            Ok(()) => ChronikError::HistoryReset(cause.to_string()),
            Err(e) => e,
        }
    }

    /// Tell the host about a rebuild carried by `result`
    ///
    /// Must be called with no lock held: the notifier may query the history.
    fn reported<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e @ (ChronikError::HistoryReset(_) | ChronikError::StorageUnavailable)) = &result {
            if let Some(notify) = &self.on_reset {
                notify(&e.user_message());
            }
        }
        result
    }
}

impl Drop for LocalHistory {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close local history: {}", e);
        }
    }
}

fn add_label(changes: &mut ChangeList, kind: ChangeKind) -> Result<(Change, bool)> {
    let mut guard = changes.change_set_guard(None)?;
    let change = Change::new(guard.list().next_id()?, kind);
    guard.add_change(change.clone());
    let finished = guard.finish()?;
    Ok((change, finished))
}

fn file_bytes(reverted: &revert::Reverted, store: &dyn ContentStore) -> Option<Vec<u8>> {
    let path = reverted.path.as_deref()?;
    let file = reverted.tree.find(path)?.as_file()?;
    file.content.bytes_if_available(store)
}

/// Handle to a label, answering questions about the moment it was put
pub struct Label {
    change_id: ChangeId,
    name: String,
    entries: Arc<RwLock<RootEntry>>,
    changes: Arc<RwLock<ChangeList>>,
    contents: Arc<dyn ContentStore>,
}

impl std::fmt::Debug for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Label")
            .field("change_id", &self.change_id)
            .field("name", &self.name)
            .finish()
    }
}

impl Label {
    /// Id of the label change
    pub fn change_id(&self) -> ChangeId {
        self.change_id
    }

    /// Label text
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes the file now at `path` had when the label was put
    pub fn content(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let reverted = self.revert(Some(path))?;
        Ok(file_bytes(&reverted, self.contents.as_ref()))
    }

    /// The whole tree as it was when the label was put
    pub fn tree(&self) -> Result<RootEntry> {
        Ok(self.revert(None)?.tree)
    }

    fn revert(&self, tracked: Option<&str>) -> Result<revert::Reverted> {
        let entries = self.entries.read();
        let changes = self.changes.read();
        revert::revert_to(&changes, &entries, RevertTarget::Change(self.change_id), false, tracked)
    }
}

/// Open change set closed when dropped
#[must_use = "the change set is closed when the scope is dropped"]
pub struct ChangeSetScope<'a> {
    history: &'a LocalHistory,
    name: Option<String>,
    finished: bool,
}

impl ChangeSetScope<'_> {
    /// Close the set now and report whether a set was finished
    pub fn finish(mut self) -> Result<bool> {
        self.finished = true;
        self.history.end_change_set(self.name.take())
    }
}

impl Drop for ChangeSetScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.history.end_change_set(self.name.take()) {
                warn!("Failed to close change set on scope exit: {}", e);
            }
        }
    }
}

/// Builder for [`LocalHistory`]
///
/// # Examples
///
/// ```rust
/// use chronik::{LocalHistoryBuilder, MemoryResourceProvider};
/// use std::sync::Arc;
///
/// let provider = Arc::new(MemoryResourceProvider::new());
/// provider.set_file("/a.txt", "hello", 10, false);
///
/// let history = LocalHistoryBuilder::new()
///     .provider(provider)
///     .clock(|| 42)
///     .in_memory();
/// history.record_create("/a.txt").unwrap();
/// assert!(history.entry("/a.txt").is_some());
/// ```
pub struct LocalHistoryBuilder {
    config: HistoryConfig,
    clock: Clock,
    provider: Option<Arc<dyn ResourceProvider>>,
    on_reset: Option<ResetNotifier>,
}

impl std::fmt::Debug for LocalHistoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHistoryBuilder")
            .field("config", &self.config)
            .field("provider", &self.provider.is_some())
            .field("on_reset", &self.on_reset.is_some())
            .finish()
    }
}

impl Default for LocalHistoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHistoryBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self {
            config: HistoryConfig::default(),
            clock: system_clock(),
            provider: None,
            on_reset: None,
        }
    }

    /// Use a whole configuration
    pub fn config(mut self, config: HistoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether names differing only in case are distinct
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.config.case_sensitive = case_sensitive;
        self
    }

    /// Largest content captured; larger contents are recorded as unavailable
    pub fn max_content_size(mut self, size: usize) -> Self {
        self.config.max_content_size = size;
        self
    }

    /// Compression for stored contents
    pub fn compression_strategy(mut self, strategy: crate::compression::CompressionStrategy) -> Self {
        self.config.compression_strategy = strategy;
        self
    }

    /// Identity of the tracked filesystem
    ///
    /// A change log written for another identity is discarded on open.
    pub fn fs_identity(mut self, identity: u64) -> Self {
        self.config.fs_identity = identity;
        self
    }

    /// Timestamp source for change sets and labels
    pub fn clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Source of current resource state
    pub fn provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Called once each time the change log is rebuilt after corruption
    pub fn on_reset(mut self, notify: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_reset = Some(Arc::new(notify));
        self
    }

    /// Open or create an on-disk history at `storage_path`
    #[instrument(skip(self, storage_path))]
    pub fn open(self, storage_path: impl Into<PathBuf>) -> Result<LocalHistory> {
        let root = storage_path.into();
        info!("Opening local history at {:?}", root);
        fs::create_dir_all(&root)?;

        let metadata = Self::load_metadata(&root, &self.config)?;
        utils::atomic_write(&root.join(METADATA_FILE), &serde_json::to_vec_pretty(&metadata)?)?;

        let log = FileChangeLogStorage::open(root.join(CHANGES_DIR), self.config.fs_identity)?;
        let contents = FileContentStore::open(root.join(CONTENTS_DIR), self.config.compression_strategy)?;
        let rules = Paths::new(self.config.case_sensitive);
        let tree = Self::load_tree(&root.join(TREE_FILE), rules);

        info!(
            "Opened local history: {} change sets, {} tree entries",
            log.record_count(),
            tree.root().count()
        );
        let history = self.assemble(
            Some(root),
            Some(metadata),
            tree,
            Box::new(log),
            Arc::new(contents),
        );
        history.reserve_referenced_contents()?;
        Ok(history)
    }

    /// Create a history that keeps everything in memory
    pub fn in_memory(self) -> LocalHistory {
        let tree = RootEntry::new(Paths::new(self.config.case_sensitive));
        self.assemble(
            None,
            None,
            tree,
            Box::new(MemoryLogStorage::new()),
            Arc::new(MemoryContentStore::new()),
        )
    }

    fn assemble(
        self,
        storage_path: Option<PathBuf>,
        metadata: Option<StorageMetadata>,
        tree: RootEntry,
        log: Box<dyn ChangeLogStorage>,
        contents: Arc<dyn ContentStore>,
    ) -> LocalHistory {
        LocalHistory {
            storage_path,
            factory: ContentFactory::new(self.config.max_content_size),
            config: self.config,
            metadata: metadata.map(|m| Arc::new(RwLock::new(m))),
            entries: Arc::new(RwLock::new(tree)),
            changes: Arc::new(RwLock::new(ChangeList::new(log, Arc::clone(&self.clock)))),
            contents,
            provider: self.provider,
            listeners: Listeners::default(),
            on_reset: self.on_reset,
            clock: self.clock,
            closed: AtomicBool::new(false),
        }
    }

    fn load_metadata(root: &Path, config: &HistoryConfig) -> Result<StorageMetadata> {
        let path = root.join(METADATA_FILE);
        let now = Utc::now();
        let existing = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StorageMetadata>(&bytes) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    warn!("Ignoring unreadable {}: {}", METADATA_FILE, e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(match existing {
            Some(mut metadata) => {
                if metadata.config != *config {
                    debug!("Configuration changed since last open: {:?}", metadata.config);
                }
                metadata.format_version = FORMAT_VERSION;
                metadata.version = env!("CARGO_PKG_VERSION").to_string();
                metadata.last_accessed = now;
                metadata.config = config.clone();
                metadata
            }
            None => StorageMetadata {
                format_version: FORMAT_VERSION,
                version: env!("CARGO_PKG_VERSION").to_string(),
                created_at: now,
                last_accessed: now,
                config: config.clone(),
            },
        })
    }

    fn load_tree(path: &Path, rules: Paths) -> RootEntry {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return RootEntry::new(rules),
            Err(e) => {
                warn!("Could not read live tree, starting empty: {}", e);
                return RootEntry::new(rules);
            }
        };
        match codec::decode_entry(&bytes).and_then(|root| RootEntry::from_root(root, rules)) {
            Ok(tree) => tree,
            Err(e) => {
                warn!("Live tree does not decode, starting empty: {}", e);
                RootEntry::new(rules)
            }
        }
    }
}
