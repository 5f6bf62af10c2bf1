//! Content-addressable blob storage for captured file contents
//!
//! Every stored byte payload is reached through a numeric handle
//! ([`ContentId`]). Handles are cheap to copy into changes and tree entries;
//! the bytes are only read when a revision's content is requested.
//!
//! ## Layout of [`FileContentStore`]
//!
//! ```text
//! contents/
//! ├── handles.bin            # handle -> object hash table (bincode)
//! ├── next_id                # reserved handle high-water mark
//! └── objects/               # content-addressable objects (sharded)
//!     └── <prefix>/          # first 2 chars of the SHA-256 hash
//!         └── <suffix>       # remaining hash chars, LZ4 framed
//! ```
//!
//! Identical payloads share one object; the object keeps a reference count of
//! the handles pointing at it and is deleted when the last handle is
//! released. A released handle is forgotten, so it can never resolve to bytes
//! again even if the same payload is stored later under a new handle.
//!
//! Handles are handed out from blocks whose upper bound is written to disk
//! before the first handle of the block is returned. A store that was never
//! flushed therefore still reopens above every handle it gave away.
//!
//! ## Thread Safety
//!
//! Both implementations take `&self` everywhere and synchronize internally:
//! `DashMap` for the handle and reference tables, a `Mutex` around the
//! compression engine.

use crate::codec;
use crate::collections::GxBuildHasher;
use crate::compression::{CompressionEngine, CompressionStrategy};
use crate::error::Result;
use crate::utils;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Handle of a stored payload
pub type ContentId = u64;

/// Blob storage contract used by contents, purge and the facade
pub trait ContentStore: Send + Sync + std::fmt::Debug {
    /// Store a payload and return a fresh handle for it
    fn store(&self, bytes: &[u8]) -> Result<ContentId>;

    /// Read a payload; `None` if the handle is unknown or released
    fn bytes(&self, id: ContentId) -> Result<Option<Vec<u8>>>;

    /// Whether the handle still resolves to bytes
    fn is_available(&self, id: ContentId) -> bool;

    /// Forget a handle; releasing twice is harmless
    fn release(&self, id: ContentId) -> Result<()>;

    /// Persist pending bookkeeping
    fn flush(&self) -> Result<()>;

    /// Counters for diagnostics
    fn stats(&self) -> ContentStoreStats;

    /// Make sure handles handed out from now on are greater than `id`
    fn reserve_past(&self, id: ContentId) -> Result<()>;
}

/// Content store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentStoreStats {
    /// Live handles
    pub handles: usize,
    /// Distinct stored payloads
    pub objects: usize,
    /// Handles released since the store was opened
    pub released: u64,
}

/// Handles reserved per write of the high-water mark
const ID_BLOCK: u64 = 256;

const NEXT_ID_FILE: &str = "next_id";

/// Persisted handle table
#[derive(Debug, Default, Serialize, Deserialize)]
struct HandleTable {
    next_id: u64,
    handles: Vec<(ContentId, String)>,
}

/// On-disk content store with deduplication and compression
pub struct FileContentStore {
    root: PathBuf,
    compression: Mutex<CompressionEngine>,
    /// Handle -> object hash
    handles: DashMap<ContentId, String, GxBuildHasher>,
    /// Object hash -> number of live handles
    ref_counts: DashMap<String, usize, GxBuildHasher>,
    next_id: AtomicU64,
    /// Handles below this mark are reserved on disk
    reserved: Mutex<u64>,
    released: AtomicU64,
    dirty: AtomicBool,
}

impl std::fmt::Debug for FileContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContentStore")
            .field("root", &self.root)
            .field("handles", &self.handles.len())
            .field("objects", &self.ref_counts.len())
            .finish()
    }
}

impl FileContentStore {
    /// Open the store at `root`, creating it if needed
    ///
    /// An unreadable handle table is discarded: the payloads it pointed at
    /// become unavailable, which readers already tolerate.
    pub fn open(root: PathBuf, strategy: CompressionStrategy) -> Result<Self> {
        fs::create_dir_all(root.join("objects"))?;

        let table_path = root.join("handles.bin");
        let table = match fs::read(&table_path) {
            Ok(bytes) => {
                match bincode::serde::decode_from_slice::<HandleTable, _>(
                    &bytes,
                    bincode::config::standard().with_limit::<{ codec::DECODE_LIMIT }>(),
                ) {
                    Ok((table, _)) => table,
                    Err(e) => {
                        warn!("Discarding unreadable content handle table: {}", e);
                        HandleTable::default()
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => HandleTable::default(),
            Err(e) => return Err(e.into()),
        };

        let handles = DashMap::with_capacity_and_hasher(table.handles.len(), GxBuildHasher::default());
        let ref_counts = DashMap::with_hasher(GxBuildHasher::default());
        let mut next_id = table.next_id.max(Self::load_reserved(&root)?).max(1);
        for (id, hash) in table.handles {
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                warn!("Dropping content handle {} with malformed hash", id);
                continue;
            }
            *ref_counts.entry(hash.clone()).or_insert(0) += 1;
            next_id = next_id.max(id.saturating_add(1));
            handles.insert(id, hash);
        }

        info!("Opened content store at {:?} ({} handles)", root, handles.len());

        Ok(Self {
            root,
            compression: Mutex::new(CompressionEngine::new(strategy)),
            handles,
            ref_counts,
            next_id: AtomicU64::new(next_id),
            reserved: Mutex::new(next_id),
            released: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    fn load_reserved(root: &Path) -> Result<u64> {
        match fs::read(root.join(NEXT_ID_FILE)) {
            Ok(bytes) => match <[u8; 8]>::try_from(bytes.as_slice()) {
                Ok(mark) => Ok(u64::from_be_bytes(mark)),
                Err(_) => {
                    warn!("Ignoring malformed handle high-water mark ({} bytes)", bytes.len());
                    Ok(0)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new high-water mark if `id` is not reserved yet
    fn reserve(&self, id: ContentId) -> Result<()> {
        let mut reserved = self.reserved.lock();
        if id < *reserved {
            return Ok(());
        }
        let mark = id.saturating_add(ID_BLOCK);
        utils::atomic_write(&self.root.join(NEXT_ID_FILE), &mark.to_be_bytes())?;
        trace!("Reserved content handles up to {}", mark);
        *reserved = mark;
        Ok(())
    }

    /// Storage root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get path for an object (with sharding)
    fn object_path(&self, hash: &str) -> PathBuf {
        let (prefix, suffix) = hash.split_at(2);
        self.root.join("objects").join(prefix).join(suffix)
    }

    fn add_reference(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let mut count = self.ref_counts.entry(hash.to_string()).or_insert(0);
        if *count == 0 {
            let object_path = self.object_path(hash);
            if !object_path.exists() {
                let framed = self.compression.lock().compress(bytes)?;
                if let Some(dir) = object_path.parent() {
                    fs::create_dir_all(dir)?;
                }
                utils::atomic_write(&object_path, &framed)?;
                trace!("Stored object {} ({} bytes)", &hash[..8], framed.len());
            }
        } else {
            debug!("Object {} already exists, incrementing ref count", &hash[..8]);
        }
        *count += 1;
        Ok(())
    }

    fn drop_reference(&self, hash: &str) -> Result<()> {
        // The entry guard is held until the object is gone, so a concurrent
        // add_reference either sees the count before the drop or no entry
        let Entry::Occupied(mut count) = self.ref_counts.entry(hash.to_string()) else {
            return Ok(());
        };
        let remaining = count.get().saturating_sub(1);
        *count.get_mut() = remaining;
        if remaining > 0 {
            return Ok(());
        }

        match fs::remove_file(self.object_path(hash)) {
            Ok(()) => trace!("Deleted object {}", &hash[..8]),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                *count.get_mut() += 1;
                return Err(e.into());
            }
        }
        count.remove();
        Ok(())
    }
}

impl ContentStore for FileContentStore {
    fn store(&self, bytes: &[u8]) -> Result<ContentId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.reserve(id)?;

        let hash = utils::hash_data(bytes);
        self.add_reference(&hash, bytes)?;
        self.handles.insert(id, hash);
        self.dirty.store(true, Ordering::Release);
        Ok(id)
    }

    fn bytes(&self, id: ContentId) -> Result<Option<Vec<u8>>> {
        let hash = match self.handles.get(&id) {
            Some(hash) => hash.clone(),
            None => return Ok(None),
        };

        let framed = match fs::read(self.object_path(&hash)) {
            Ok(framed) => framed,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Object {} for content {} is missing", &hash[..8], id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let content = self.compression.lock().decompress(&framed)?;
        Ok(Some(content))
    }

    fn is_available(&self, id: ContentId) -> bool {
        self.handles.contains_key(&id)
    }

    fn release(&self, id: ContentId) -> Result<()> {
        if let Some((_, hash)) = self.handles.remove(&id) {
            self.released.fetch_add(1, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Release);
            self.drop_reference(&hash)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let table = HandleTable {
            next_id: self.next_id.load(Ordering::SeqCst),
            handles: self
                .handles
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        };
        let bytes = bincode::serde::encode_to_vec(&table, bincode::config::standard())?;
        if let Err(e) = utils::atomic_write(&self.root.join("handles.bin"), &bytes) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        debug!(
            "Persisted {} content handles ({})",
            table.handles.len(),
            utils::format_bytes(bytes.len() as u64)
        );
        Ok(())
    }

    fn stats(&self) -> ContentStoreStats {
        ContentStoreStats {
            handles: self.handles.len(),
            objects: self.ref_counts.len(),
            released: self.released.load(Ordering::Relaxed),
        }
    }
    fn reserve_past(&self, id: ContentId) -> Result<()> {
        let wanted = id.saturating_add(1);
        if self.next_id.fetch_max(wanted, Ordering::SeqCst) < wanted {
            debug!("Raised next content handle to {}", wanted);
            self.reserve(wanted)?;
        }
        Ok(())
    }
}

impl Drop for FileContentStore {
    fn drop(&mut self) {
        if let Err(e) = ContentStore::flush(self) {
            warn!("Failed to flush content store on drop: {}", e);
        }
    }
}

/// In-memory content store for tests and embedders without disk
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<ContentId, Arc<[u8]>>>,
    next_id: AtomicU64,
    released: AtomicU64,
}

impl MemoryContentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }
}

impl ContentStore for MemoryContentStore {
    fn store(&self, bytes: &[u8]) -> Result<ContentId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.blobs.lock().insert(id, Arc::from(bytes));
        Ok(id)
    }

    fn bytes(&self, id: ContentId) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(&id).map(|b| b.to_vec()))
    }

    fn is_available(&self, id: ContentId) -> bool {
        self.blobs.lock().contains_key(&id)
    }

    fn release(&self, id: ContentId) -> Result<()> {
        if self.blobs.lock().remove(&id).is_some() {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn reserve_past(&self, id: ContentId) -> Result<()> {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
        Ok(())
    }

    fn stats(&self) -> ContentStoreStats {
        let blobs = self.blobs.lock();
        ContentStoreStats {
            handles: blobs.len(),
            objects: blobs.len(),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FileContentStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileContentStore::open(
            temp_dir.path().join("contents"),
            CompressionStrategy::Fast,
        )
        .unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_store_and_read() {
        let (store, _temp_dir) = create_test_store();

        let id = store.store(b"Hello, World!").unwrap();
        assert!(store.is_available(id));
        assert_eq!(store.bytes(id).unwrap(), Some(b"Hello, World!".to_vec()));

        let big = "line\n".repeat(5000).into_bytes();
        let big_id = store.store(&big).unwrap();
        assert_eq!(store.bytes(big_id).unwrap(), Some(big));
    }

    #[test]
    fn test_deduplication_and_release() {
        let (store, _temp_dir) = create_test_store();

        let a = store.store(b"shared").unwrap();
        let b = store.store(b"shared").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.stats().objects, 1);
        assert_eq!(store.stats().handles, 2);

        store.release(a).unwrap();
        assert!(!store.is_available(a));
        assert_eq!(store.bytes(a).unwrap(), None);
        assert_eq!(store.bytes(b).unwrap(), Some(b"shared".to_vec()));

        store.release(b).unwrap();
        assert_eq!(store.stats().objects, 0);

        let hash = utils::hash_data(b"shared");
        assert!(!store.object_path(&hash).exists());

        // Released handles stay dead even when the payload comes back
        let c = store.store(b"shared").unwrap();
        assert_eq!(store.bytes(a).unwrap(), None);
        assert_eq!(store.bytes(c).unwrap(), Some(b"shared".to_vec()));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (store, _temp_dir) = create_test_store();
        let id = store.store(b"once").unwrap();
        store.release(id).unwrap();
        store.release(id).unwrap();
        assert_eq!(store.stats().released, 1);
    }

    #[test]
    fn test_handles_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("contents");

        let (kept, dropped) = {
            let store = FileContentStore::open(root.clone(), CompressionStrategy::Fast).unwrap();
            let kept = store.store(b"kept").unwrap();
            let dropped = store.store(b"dropped").unwrap();
            store.release(dropped).unwrap();
            store.flush().unwrap();
            (kept, dropped)
        };

        let store = FileContentStore::open(root, CompressionStrategy::Fast).unwrap();
        assert_eq!(store.bytes(kept).unwrap(), Some(b"kept".to_vec()));
        assert!(!store.is_available(dropped));

        let fresh = store.store(b"fresh").unwrap();
        assert!(fresh > kept && fresh > dropped);
    }

    #[test]
    fn test_unflushed_store_reopens_above_given_handles() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("contents");

        let given = {
            let store = FileContentStore::open(root.clone(), CompressionStrategy::Fast).unwrap();
            let given: Vec<_> = (0..3).map(|i| store.store(&[i]).unwrap()).collect();
            std::mem::forget(store);
            given
        };

        let store = FileContentStore::open(root.clone(), CompressionStrategy::Fast).unwrap();
        let fresh = store.store(b"after crash").unwrap();
        assert!(given.iter().all(|id| fresh > *id));

        store.reserve_past(fresh + 1000).unwrap();
        let raised = store.store(b"raised").unwrap();
        assert!(raised > fresh + 1000);
        drop(store);

        std::mem::forget(FileContentStore::open(root.clone(), CompressionStrategy::Fast).unwrap());
        let store = FileContentStore::open(root, CompressionStrategy::Fast).unwrap();
        assert!(store.store(b"again").unwrap() > raised);
    }

    #[test]
    fn test_concurrent_store_and_release_of_same_bytes() {
        let (store, _temp_dir) = create_test_store();
        let store = Arc::new(store);

        for _ in 0..2000 {
            let a = store.store(b"shared").unwrap();
            let storer = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.store(b"shared").unwrap())
            };
            store.release(a).unwrap();
            let b = storer.join().unwrap();

            assert_eq!(store.bytes(b).unwrap(), Some(b"shared".to_vec()));
            store.release(b).unwrap();
        }
        assert_eq!(store.stats().handles, 0);
        assert_eq!(store.stats().objects, 0);
    }

    #[test]
    fn test_missing_object_reads_as_unavailable() {
        let (store, _temp_dir) = create_test_store();
        let id = store.store(b"vanishing").unwrap();
        fs::remove_file(store.object_path(&utils::hash_data(b"vanishing"))).unwrap();
        assert_eq!(store.bytes(id).unwrap(), None);
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryContentStore::new();
        let id = store.store(b"mem").unwrap();
        assert!(id > 0);
        assert_eq!(store.bytes(id).unwrap(), Some(b"mem".to_vec()));
        store.release(id).unwrap();
        store.release(id).unwrap();
        assert_eq!(store.bytes(id).unwrap(), None);
        assert_eq!(store.stats().released, 1);
    }
}
