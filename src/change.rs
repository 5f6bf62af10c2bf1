//! Change record model
//!
//! A [`Change`] is one immutable fact about the tree. Structural changes know
//! how to apply themselves to the live tree, how to revert themselves on a
//! scratch copy, and how a tracked path looked before they happened. Labels
//! are markers in the log and never touch the tree.
//!
//! Changes are grouped into [`ChangeSet`]s; one change set is one record in
//! the change log.

use crate::content::Content;
use crate::entry::{Entry, RootEntry};
use crate::error::Result;
use crate::paths::{self, Paths};

/// Unique id of a change or change set, allocated from the log's counter
pub type ChangeId = u64;

/// One recorded mutation or label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Unique id
    pub id: ChangeId,
    /// What happened
    pub kind: ChangeKind,
}

/// The nine kinds of changes
///
/// Paths are the resource's path *after* the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// A file appeared
    CreateFile {
        /// File path
        path: String,
        /// Initial content
        content: Content,
        /// Initial timestamp
        timestamp: u64,
        /// Initial read-only flag
        read_only: bool,
    },
    /// A directory appeared
    CreateDirectory {
        /// Directory path
        path: String,
    },
    /// File bytes were replaced
    ContentChange {
        /// File path
        path: String,
        /// Content before the change
        old_content: Content,
        /// Timestamp before the change
        old_timestamp: u64,
        /// Content after the change
        new_content: Content,
        /// Timestamp after the change
        new_timestamp: u64,
    },
    /// Last path component changed
    Rename {
        /// Path after the rename
        path: String,
        /// Name before the rename
        old_name: String,
    },
    /// Entry moved to another directory
    Move {
        /// Path after the move
        path: String,
        /// Parent directory before the move
        old_parent_path: String,
    },
    /// Read-only flag flipped
    ReadOnlyStatusChange {
        /// File path
        path: String,
        /// Flag before the change
        old_read_only: bool,
    },
    /// Entry removed; the whole subtree is kept for reverting
    Delete {
        /// Path of the removed entry
        path: String,
        /// Snapshot of the removed subtree
        deleted: Entry,
    },
    /// Label put by the user
    PutUserLabel {
        /// Label text
        name: String,
        /// Project the label belongs to; `None` for all projects
        project_id: Option<String>,
        /// When the label was put
        timestamp: u64,
    },
    /// Label put by the host
    PutSystemLabel {
        /// Label text
        name: String,
        /// Project the label belongs to; `None` for all projects
        project_id: Option<String>,
        /// Display color as RGB
        color: u32,
        /// When the label was put
        timestamp: u64,
    },
}

impl Change {
    /// Create a change
    pub fn new(id: ChangeId, kind: ChangeKind) -> Self {
        Self { id, kind }
    }

    /// Wire tag of this change's variant
    pub fn tag(&self) -> u32 {
        match &self.kind {
            ChangeKind::CreateFile { .. } => 1,
            ChangeKind::CreateDirectory { .. } => 2,
            ChangeKind::ContentChange { .. } => 3,
            ChangeKind::Rename { .. } => 4,
            ChangeKind::Move { .. } => 5,
            ChangeKind::ReadOnlyStatusChange { .. } => 6,
            ChangeKind::Delete { .. } => 7,
            ChangeKind::PutUserLabel { .. } => 8,
            ChangeKind::PutSystemLabel { .. } => 9,
        }
    }

    /// Path of the affected resource, `None` for labels
    pub fn path(&self) -> Option<&str> {
        match &self.kind {
            ChangeKind::CreateFile { path, .. }
            | ChangeKind::CreateDirectory { path }
            | ChangeKind::ContentChange { path, .. }
            | ChangeKind::Rename { path, .. }
            | ChangeKind::Move { path, .. }
            | ChangeKind::ReadOnlyStatusChange { path, .. }
            | ChangeKind::Delete { path, .. } => Some(path),
            ChangeKind::PutUserLabel { .. } | ChangeKind::PutSystemLabel { .. } => None,
        }
    }

    /// Check whether this change is a label
    pub fn is_label(&self) -> bool {
        self.path().is_none()
    }

    /// Label name, `None` for structural changes
    pub fn label_name(&self) -> Option<&str> {
        match &self.kind {
            ChangeKind::PutUserLabel { name, .. } | ChangeKind::PutSystemLabel { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Path the resource had before this change
    fn old_path(&self) -> Option<String> {
        match &self.kind {
            ChangeKind::Rename { path, old_name } => Some(paths::renamed(path, old_name)),
            ChangeKind::Move { path, old_parent_path } => Some(paths::append(old_parent_path, paths::name(path))),
            _ => None,
        }
    }

    /// Apply this change to the live tree
    pub fn apply_to(&self, tree: &mut RootEntry) -> Result<()> {
        match &self.kind {
            ChangeKind::CreateFile { path, content, timestamp, read_only } => {
                tree.add_at(path, Entry::file("", content.clone(), *timestamp, *read_only))
            }
            ChangeKind::CreateDirectory { path } => tree.add_at(path, Entry::directory("")),
            ChangeKind::ContentChange { path, new_content, new_timestamp, .. } => {
                tree.change_content(path, new_content.clone(), *new_timestamp)
            }
            ChangeKind::Rename { path, .. } => {
                let from = self.old_path().unwrap_or_else(|| path.clone());
                tree.rename(&from, paths::name(path))
            }
            ChangeKind::Move { path, .. } => {
                let from = self.old_path().unwrap_or_else(|| path.clone());
                let to = paths::parent(path).unwrap_or_else(|| paths::ROOT.to_string());
                tree.move_entry(&from, &to)
            }
            ChangeKind::ReadOnlyStatusChange { path, old_read_only } => tree.set_read_only(path, !old_read_only),
            ChangeKind::Delete { path, .. } => tree.remove(path).map(|_| ()),
            ChangeKind::PutUserLabel { .. } | ChangeKind::PutSystemLabel { .. } => Ok(()),
        }
    }

    /// Undo this change on a tree
    pub fn revert_on(&self, tree: &mut RootEntry) -> Result<()> {
        match &self.kind {
            ChangeKind::CreateFile { path, .. } | ChangeKind::CreateDirectory { path } => {
                tree.remove(path).map(|_| ())
            }
            ChangeKind::ContentChange { path, old_content, old_timestamp, .. } => {
                tree.change_content(path, old_content.clone(), *old_timestamp)
            }
            ChangeKind::Rename { path, old_name } => tree.rename(path, old_name),
            ChangeKind::Move { path, old_parent_path } => tree.move_entry(path, old_parent_path),
            ChangeKind::ReadOnlyStatusChange { path, old_read_only } => tree.set_read_only(path, *old_read_only),
            ChangeKind::Delete { path, deleted } => tree.add_at(path, deleted.clone()),
            ChangeKind::PutUserLabel { .. } | ChangeKind::PutSystemLabel { .. } => Ok(()),
        }
    }

    /// Path `path` had before this change
    ///
    /// Renames and moves rewrite the path itself and every path below it;
    /// everything else leaves it alone.
    pub fn revert_path(&self, path: &str, rules: &Paths) -> String {
        match (self.path(), self.old_path()) {
            (Some(new_path), Some(old_path)) => rules
                .rebase(path, new_path, &old_path)
                .unwrap_or_else(|| path.to_string()),
            _ => path.to_string(),
        }
    }

    /// Check whether this change touched `path`, an ancestor, or a descendant
    pub fn affects_path(&self, path: &str, rules: &Paths) -> bool {
        let Some(own) = self.path() else {
            return false;
        };
        let touches = |p: &str| rules.is_ancestor(p, path, false) || rules.is_ancestor(path, p, true);
        touches(own) || self.old_path().is_some_and(|old| touches(&old))
    }

    /// Check whether this change is relevant to a project
    ///
    /// Only labels carry a project; a label without one belongs to every
    /// project, and a query without one sees every label.
    pub fn affects_project(&self, project_id: Option<&str>) -> bool {
        match &self.kind {
            ChangeKind::PutUserLabel { project_id: own, .. } | ChangeKind::PutSystemLabel { project_id: own, .. } => {
                match (own.as_deref(), project_id) {
                    (None, _) | (_, None) => true,
                    (Some(a), Some(b)) => a == b,
                }
            }
            _ => false,
        }
    }

    /// Check whether this change created the entry at `path`
    pub fn is_creation_of(&self, path: &str, rules: &Paths) -> bool {
        match &self.kind {
            ChangeKind::CreateFile { path: own, .. } | ChangeKind::CreateDirectory { path: own } => {
                rules.equals(own, path)
            }
            _ => false,
        }
    }

    /// Check whether this change deleted the entry at `path`, directly or
    /// together with one of its ancestors
    pub fn is_deletion_of(&self, path: &str, rules: &Paths) -> bool {
        match &self.kind {
            ChangeKind::Delete { path: own, .. } => rules.is_ancestor(own, path, false),
            _ => false,
        }
    }

    /// Every content this change refers to
    pub fn referenced_contents(&self) -> Vec<Content> {
        match &self.kind {
            ChangeKind::CreateFile { content, .. } => vec![content.clone()],
            ChangeKind::ContentChange { old_content, new_content, .. } => {
                vec![old_content.clone(), new_content.clone()]
            }
            ChangeKind::Delete { deleted, .. } => deleted.contents(),
            _ => Vec::new(),
        }
    }

    /// Contents only this change references, released when it is purged
    pub fn contents_to_purge(&self) -> Vec<Content> {
        match &self.kind {
            ChangeKind::ContentChange { old_content, .. } => vec![old_content.clone()],
            ChangeKind::Delete { deleted, .. } => deleted.contents(),
            _ => Vec::new(),
        }
    }
}

/// Group of changes persisted as one log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Unique id
    pub id: ChangeId,
    /// When the set was opened, in milliseconds
    pub timestamp: u64,
    /// Optional name given when the set was closed
    pub name: Option<String>,
    /// Closed sets are locked
    pub locked: bool,
    /// Changes in the order they happened
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Open a new empty set
    pub fn new(id: ChangeId, timestamp: u64) -> Self {
        Self {
            id,
            timestamp,
            name: None,
            locked: false,
            changes: Vec::new(),
        }
    }

    /// Append a change to an open set
    pub fn add(&mut self, change: Change) {
        assert!(!self.locked, "change set {} is locked", self.id);
        self.changes.push(change);
    }

    /// Close the set
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Check whether the set has no changes
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Check whether the set only holds labels
    pub fn is_label_only(&self) -> bool {
        !self.is_empty() && self.changes.iter().all(Change::is_label)
    }

    /// Check whether the set only holds content changes
    pub fn is_content_change_only(&self) -> bool {
        !self.is_empty()
            && self
                .changes
                .iter()
                .all(|c| matches!(c.kind, ChangeKind::ContentChange { .. }))
    }

    /// Check whether any change touched `path`
    pub fn affects_path(&self, path: &str, rules: &Paths) -> bool {
        self.changes.iter().any(|c| c.affects_path(path, rules))
    }

    /// Check whether any change is relevant to a project
    pub fn affects_project(&self, project_id: Option<&str>) -> bool {
        self.changes.iter().any(|c| c.affects_project(project_id))
    }

    /// Contents to release when this set is purged
    pub fn contents_to_purge(&self) -> Vec<Content> {
        self.changes.iter().flat_map(Change::contents_to_purge).collect()
    }

    /// Apply every change forward, in order
    pub fn apply_to(&self, tree: &mut RootEntry) -> Result<()> {
        for change in &self.changes {
            change.apply_to(tree)?;
        }
        Ok(())
    }

    /// Revert every change, newest first
    pub fn revert_on(&self, tree: &mut RootEntry) -> Result<()> {
        for change in self.changes.iter().rev() {
            change.revert_on(tree)?;
        }
        Ok(())
    }
}
