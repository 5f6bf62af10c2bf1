//! Access to the current state of tracked resources
//!
//! The history never scans a filesystem on its own. Whenever it needs the
//! current bytes, timestamp or listing of a resource it asks the host through
//! a [`ResourceProvider`].

use crate::error::{ChronikError, Result};
use crate::paths;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Host collaborator supplying the current state of resources
pub trait ResourceProvider: Send + Sync {
    /// Current bytes of a file
    fn content(&self, path: &str) -> Result<Vec<u8>>;

    /// Last-modified timestamp in milliseconds
    fn timestamp(&self, path: &str) -> Result<u64>;

    /// Whether the file is read-only
    fn is_read_only(&self, path: &str) -> Result<bool>;

    /// Whether the resource is a directory
    fn is_directory(&self, path: &str) -> Result<bool>;

    /// Names of a directory's children, sorted
    fn list(&self, path: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
enum MemoryResource {
    File {
        content: Vec<u8>,
        timestamp: u64,
        read_only: bool,
    },
    Directory,
}

/// Resource provider backed by a map, for tests and embedders
#[derive(Debug, Default)]
pub struct MemoryResourceProvider {
    resources: RwLock<BTreeMap<String, MemoryResource>>,
}

impl MemoryResourceProvider {
    /// Create a provider holding only the root directory
    pub fn new() -> Self {
        let provider = Self::default();
        provider
            .resources
            .write()
            .insert(paths::ROOT.to_string(), MemoryResource::Directory);
        provider
    }

    /// Create or replace a file, creating missing parent directories
    pub fn set_file(&self, path: &str, content: impl Into<Vec<u8>>, timestamp: u64, read_only: bool) {
        let path = paths::normalize(path);
        self.ensure_parents(&path);
        self.resources.write().insert(
            path,
            MemoryResource::File {
                content: content.into(),
                timestamp,
                read_only,
            },
        );
    }

    /// Create a directory and its missing parents
    pub fn set_directory(&self, path: &str) {
        let path = paths::normalize(path);
        self.ensure_parents(&path);
        self.resources.write().insert(path, MemoryResource::Directory);
    }

    /// Remove a resource and everything below it
    pub fn remove(&self, path: &str) {
        let path = paths::normalize(path);
        let rules = paths::Paths::default();
        self.resources
            .write()
            .retain(|p, _| !rules.is_ancestor(&path, p, false));
    }

    fn ensure_parents(&self, path: &str) {
        let mut resources = self.resources.write();
        let mut parent = paths::parent(path);
        while let Some(dir) = parent {
            resources.entry(dir.clone()).or_insert(MemoryResource::Directory);
            parent = paths::parent(&dir);
        }
    }

    fn get(&self, path: &str) -> Result<MemoryResource> {
        self.resources
            .read()
            .get(&paths::normalize(path))
            .cloned()
            .ok_or_else(|| ChronikError::EntryNotFound(path.to_string()))
    }

    fn file(&self, path: &str) -> Result<(Vec<u8>, u64, bool)> {
        match self.get(path)? {
            MemoryResource::File { content, timestamp, read_only } => Ok((content, timestamp, read_only)),
            MemoryResource::Directory => Err(ChronikError::InvalidPath(format!("{} is a directory", path))),
        }
    }
}

impl ResourceProvider for MemoryResourceProvider {
    fn content(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.file(path)?.0)
    }

    fn timestamp(&self, path: &str) -> Result<u64> {
        match self.get(path)? {
            MemoryResource::File { timestamp, .. } => Ok(timestamp),
            MemoryResource::Directory => Ok(0),
        }
    }

    fn is_read_only(&self, path: &str) -> Result<bool> {
        Ok(self.file(path)?.2)
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(matches!(self.get(path)?, MemoryResource::Directory))
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let dir = paths::normalize(path);
        if !self.is_directory(&dir)? {
            return Err(ChronikError::InvalidPath(format!("{} is a file", dir)));
        }
        let resources = self.resources.read();
        Ok(resources
            .keys()
            .filter(|p| paths::parent(p).as_deref() == Some(dir.as_str()))
            .map(|p| paths::name(p).to_string())
            .collect())
    }
}

/// Resource provider reading a directory on disk
///
/// History path `/a/b.txt` maps to `<root>/a/b.txt`.
#[derive(Debug, Clone)]
pub struct FsResourceProvider {
    root: PathBuf,
}

impl FsResourceProvider {
    /// Serve resources below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory resources are read from
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        paths::split(path).fold(self.root.clone(), |acc, c| acc.join(c))
    }

    fn metadata(&self, path: &str) -> Result<fs::Metadata> {
        fs::metadata(self.resolve(path)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ChronikError::EntryNotFound(path.to_string()),
            _ => ChronikError::Io(e),
        })
    }
}

impl ResourceProvider for FsResourceProvider {
    fn content(&self, path: &str) -> Result<Vec<u8>> {
        if self.metadata(path)?.is_dir() {
            return Err(ChronikError::InvalidPath(format!("{} is a directory", path)));
        }
        Ok(fs::read(self.resolve(path))?)
    }

    fn timestamp(&self, path: &str) -> Result<u64> {
        let modified = self.metadata(path)?.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0))
    }

    fn is_read_only(&self, path: &str) -> Result<bool> {
        Ok(self.metadata(path)?.permissions().readonly())
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(self.metadata(path)?.is_dir())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.resolve(path);
        let mut names = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}
