//! Versioned resource tree
//!
//! The tree mirrors the tracked resources: directories hold child entries
//! ordered by name, files hold a [`Content`] reference together with the
//! read-only flag and last-modified timestamp. [`RootEntry`] owns the root
//! directory and resolves slash-delimited paths against it using the
//! configured case sensitivity.
//!
//! The same type serves as the live tree and as the scratch copy the replay
//! engine reverts changes onto; cloning it copies the structure only, never
//! the stored bytes.

use crate::content::Content;
use crate::error::{ChronikError, Result};
use crate::paths::{self, Paths};
use tracing::trace;

/// A node in the versioned resource tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Regular file
    File(FileEntry),
    /// Directory with ordered children
    Directory(DirectoryEntry),
}

/// File node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Last path component
    pub name: String,
    /// Bytes of the file
    pub content: Content,
    /// Last-modified timestamp in milliseconds
    pub timestamp: u64,
    /// Read-only flag
    pub read_only: bool,
}

/// Directory node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryEntry {
    /// Last path component (empty for the root)
    pub name: String,
    /// Children sorted by name
    pub children: Vec<Entry>,
}

impl Entry {
    /// Create a file entry
    pub fn file(name: impl Into<String>, content: Content, timestamp: u64, read_only: bool) -> Self {
        Entry::File(FileEntry {
            name: name.into(),
            content,
            timestamp,
            read_only,
        })
    }

    /// Create an empty directory entry
    pub fn directory(name: impl Into<String>) -> Self {
        Entry::Directory(DirectoryEntry {
            name: name.into(),
            children: Vec::new(),
        })
    }

    /// Name of this entry
    pub fn name(&self) -> &str {
        match self {
            Entry::File(f) => &f.name,
            Entry::Directory(d) => &d.name,
        }
    }

    fn set_name(&mut self, name: String) {
        match self {
            Entry::File(f) => f.name = name,
            Entry::Directory(d) => d.name = name,
        }
    }

    /// Check whether this entry is a directory
    pub fn is_directory(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }

    /// File view of this entry
    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            Entry::File(f) => Some(f),
            Entry::Directory(_) => None,
        }
    }

    /// Directory view of this entry
    pub fn as_directory(&self) -> Option<&DirectoryEntry> {
        match self {
            Entry::Directory(d) => Some(d),
            Entry::File(_) => None,
        }
    }

    /// Children of a directory; empty for files
    pub fn children(&self) -> &[Entry] {
        match self {
            Entry::Directory(d) => &d.children,
            Entry::File(_) => &[],
        }
    }

    /// Contents of every file in this subtree, depth first
    pub fn contents(&self) -> Vec<Content> {
        let mut result = Vec::new();
        self.collect_contents(&mut result);
        result
    }

    fn collect_contents(&self, out: &mut Vec<Content>) {
        match self {
            Entry::File(f) => out.push(f.content.clone()),
            Entry::Directory(d) => {
                for child in &d.children {
                    child.collect_contents(out);
                }
            }
        }
    }

    /// Number of entries in this subtree including itself
    pub fn count(&self) -> usize {
        1 + self.children().iter().map(Entry::count).sum::<usize>()
    }
}

impl DirectoryEntry {
    /// Find a direct child by name
    pub fn child(&self, name: &str, rules: &Paths) -> Option<&Entry> {
        self.children.iter().find(|c| rules.names_equal(c.name(), name))
    }

    fn child_mut(&mut self, name: &str, rules: &Paths) -> Option<&mut Entry> {
        self.children.iter_mut().find(|c| rules.names_equal(c.name(), name))
    }

    fn child_index(&self, name: &str, rules: &Paths) -> Option<usize> {
        self.children.iter().position(|c| rules.names_equal(c.name(), name))
    }

    fn insert(&mut self, entry: Entry, rules: &Paths) -> Result<()> {
        if self.child(entry.name(), rules).is_some() {
            return Err(ChronikError::EntryAlreadyExists(entry.name().to_string()));
        }
        let at = self
            .children
            .partition_point(|c| c.name() < entry.name());
        self.children.insert(at, entry);
        Ok(())
    }

    fn take(&mut self, name: &str, rules: &Paths) -> Option<Entry> {
        self.child_index(name, rules).map(|i| self.children.remove(i))
    }
}

/// Root of the versioned tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    root: Entry,
    rules: Paths,
}

impl Default for RootEntry {
    fn default() -> Self {
        Self::new(Paths::default())
    }
}

impl RootEntry {
    /// Create an empty tree
    pub fn new(rules: Paths) -> Self {
        Self {
            root: Entry::directory(""),
            rules,
        }
    }

    /// Rebuild a tree around a decoded root directory
    pub fn from_root(root: Entry, rules: Paths) -> Result<Self> {
        if !root.is_directory() {
            return Err(ChronikError::InvalidPath("root must be a directory".to_string()));
        }
        Ok(Self { root, rules })
    }

    /// Path rules of this tree
    pub fn paths(&self) -> &Paths {
        &self.rules
    }

    /// Root directory entry
    pub fn root(&self) -> &Entry {
        &self.root
    }

    /// Resolve a path
    pub fn find(&self, path: &str) -> Option<&Entry> {
        let mut current = &self.root;
        for component in paths::split(path) {
            current = match current {
                Entry::Directory(d) => d.child(component, &self.rules)?,
                Entry::File(_) => return None,
            };
        }
        Some(current)
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Entry> {
        let rules = self.rules;
        let mut current = &mut self.root;
        for component in paths::split(path) {
            current = match current {
                Entry::Directory(d) => d.child_mut(component, &rules)?,
                Entry::File(_) => return None,
            };
        }
        Some(current)
    }

    fn find_file_mut(&mut self, path: &str) -> Result<&mut FileEntry> {
        match self.find_mut(path) {
            Some(Entry::File(f)) => Ok(f),
            Some(Entry::Directory(_)) => Err(ChronikError::InvalidPath(format!("{} is a directory", path))),
            None => Err(ChronikError::EntryNotFound(path.to_string())),
        }
    }

    fn find_directory_mut(&mut self, path: &str) -> Result<&mut DirectoryEntry> {
        match self.find_mut(path) {
            Some(Entry::Directory(d)) => Ok(d),
            Some(Entry::File(_)) => Err(ChronikError::InvalidPath(format!("{} is a file", path))),
            None => Err(ChronikError::EntryNotFound(path.to_string())),
        }
    }

    /// Check whether a path resolves
    pub fn has(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// Insert `entry` as a child of the directory at `parent`
    pub fn add(&mut self, parent: &str, entry: Entry) -> Result<()> {
        trace!("Adding {} under {}", entry.name(), parent);
        let rules = self.rules;
        self.find_directory_mut(parent)?.insert(entry, &rules)
    }

    /// Insert `entry` at `path`, renaming it to the path's last component
    pub fn add_at(&mut self, path: &str, mut entry: Entry) -> Result<()> {
        let parent = paths::parent(path).ok_or_else(|| ChronikError::InvalidPath(path.to_string()))?;
        entry.set_name(paths::name(path).to_string());
        self.add(&parent, entry)
    }

    /// Detach and return the entry at `path`
    pub fn remove(&mut self, path: &str) -> Result<Entry> {
        let parent = paths::parent(path)
            .ok_or_else(|| ChronikError::InvalidPath("cannot remove the root".to_string()))?;
        let rules = self.rules;
        self.find_directory_mut(&parent)?
            .take(paths::name(path), &rules)
            .ok_or_else(|| ChronikError::EntryNotFound(path.to_string()))
    }

    /// Give the entry at `path` a new last component
    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<()> {
        let target = paths::renamed(path, new_name);
        if !self.rules.equals(&target, path) && self.has(&target) {
            return Err(ChronikError::EntryAlreadyExists(target));
        }
        let mut entry = self.remove(path)?;
        entry.set_name(new_name.to_string());
        let parent = paths::parent(path).unwrap_or_else(|| paths::ROOT.to_string());
        self.add(&parent, entry)
    }

    /// Move the entry at `path` into the directory `new_parent`
    pub fn move_entry(&mut self, path: &str, new_parent: &str) -> Result<()> {
        if self.rules.is_ancestor(path, new_parent, false) {
            return Err(ChronikError::InvalidPath(format!(
                "cannot move {} into itself ({})",
                path, new_parent
            )));
        }
        let target = paths::append(new_parent, paths::name(path));
        if self.has(&target) {
            return Err(ChronikError::EntryAlreadyExists(target));
        }
        match self.find(new_parent) {
            Some(e) if e.is_directory() => {}
            Some(_) => return Err(ChronikError::InvalidPath(format!("{} is a file", new_parent))),
            None => return Err(ChronikError::EntryNotFound(new_parent.to_string())),
        }
        let entry = self.remove(path)?;
        self.add(new_parent, entry)
    }

    /// Replace a file's content and timestamp
    pub fn change_content(&mut self, path: &str, content: Content, timestamp: u64) -> Result<()> {
        let file = self.find_file_mut(path)?;
        file.content = content;
        file.timestamp = timestamp;
        Ok(())
    }

    /// Set a file's read-only flag
    pub fn set_read_only(&mut self, path: &str, read_only: bool) -> Result<()> {
        self.find_file_mut(path)?.read_only = read_only;
        Ok(())
    }

    /// Absolute paths of every file in the tree, sorted
    pub fn file_paths(&self) -> Vec<String> {
        fn walk(entry: &Entry, prefix: &str, out: &mut Vec<String>) {
            for child in entry.children() {
                let path = paths::append(prefix, child.name());
                match child {
                    Entry::File(_) => out.push(path),
                    Entry::Directory(_) => walk(child, &path, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, paths::ROOT, &mut out);
        out
    }
}
