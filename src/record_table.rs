//! On-disk change log: a linked record table
//!
//! ## Layout
//!
//! ```text
//! changes/
//! ├── records.idx    # 32-byte header followed by 32-byte record slots
//! └── records.dat    # record payloads, appended
//! ```
//!
//! Header (big-endian): `magic[4] format_version:u32 fs_identity:u64
//! last_assigned_id:u64 first_record:u32 last_record:u32`.
//!
//! Slot for record id `n` lives at `32 + (n - 1) * 32`: `prev:u32 next:u32
//! timestamp:u64 data_offset:u64 data_len:u32 flags:u32`. A slot with the
//! `used` flag cleared is free and is reused by the next append.
//!
//! Appends write the payload, the new slot, the old tail's `next` link and
//! finally the header, so the header never points at a record that is not
//! completely on disk. Deleted payloads stay in `records.dat` as garbage
//! until more than half of the file is garbage, at which point live payloads
//! are copied into a fresh file.

use crate::codec::CONFIG;
use crate::error::{ChronikError, Result};
use crate::log_storage::{ChangeLogStorage, RecordId, NO_RECORD};
use crate::utils;
use bincode::{Decode, Encode};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Version of the record table format
pub const FORMAT_VERSION: u32 = 1;

const MAGIC: [u8; 4] = *b"CHRL";
const INDEX_FILE: &str = "records.idx";
const DATA_FILE: &str = "records.dat";
const HEADER_SIZE: u64 = 32;
const SLOT_SIZE: u64 = 32;
const SLOT_USED: u32 = 1;
const COMPACTION_MIN_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
struct Header {
    magic: [u8; 4],
    format_version: u32,
    fs_identity: u64,
    last_assigned_id: u64,
    first_record: u32,
    last_record: u32,
}

impl Header {
    fn new(fs_identity: u64) -> Self {
        Self {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            fs_identity,
            last_assigned_id: 0,
            first_record: NO_RECORD,
            last_record: NO_RECORD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
struct Slot {
    prev: u32,
    next: u32,
    timestamp: u64,
    data_offset: u64,
    data_len: u32,
    flags: u32,
}

impl Slot {
    fn is_used(&self) -> bool {
        self.flags & SLOT_USED != 0
    }
}

/// Change log stored in a record table on disk
pub struct FileChangeLogStorage {
    dir: PathBuf,
    fs_identity: u64,
    header: Header,
    slots: Vec<Slot>,
    free: Vec<RecordId>,
    index: File,
    data: Mutex<File>,
    data_len: u64,
    garbage: u64,
}

impl std::fmt::Debug for FileChangeLogStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeLogStorage")
            .field("dir", &self.dir)
            .field("header", &self.header)
            .field("slots", &self.slots.len())
            .field("free", &self.free.len())
            .field("data_len", &self.data_len)
            .field("garbage", &self.garbage)
            .finish()
    }
}

impl FileChangeLogStorage {
    /// Open the log in `dir`, creating it if needed
    ///
    /// A log written with another format version or for another filesystem
    /// identity, or one whose index cannot be read, is deleted and recreated.
    pub fn open(dir: PathBuf, fs_identity: u64) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        match Self::load(&dir, fs_identity) {
            Ok(Some(storage)) => {
                info!(
                    "Opened change log at {:?} ({} records, last id {})",
                    dir,
                    storage.record_count(),
                    storage.header.last_assigned_id
                );
                Ok(storage)
            }
            Ok(None) => {
                debug!("Creating change log at {:?}", dir);
                Self::create(dir, fs_identity)
            }
            Err(e) => {
                warn!("Change log at {:?} is unusable, rebuilding: {}", dir, e);
                Self::recreate(dir, fs_identity)
            }
        }
    }

    /// Directory holding the log files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Size of the payload file including garbage
    pub fn data_size(&self) -> u64 {
        self.data_len
    }

    fn load(dir: &Path, fs_identity: u64) -> Result<Option<Self>> {
        let index_path = dir.join(INDEX_FILE);
        let bytes = match fs::read(&index_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if (bytes.len() as u64) < HEADER_SIZE || (bytes.len() as u64 - HEADER_SIZE) % SLOT_SIZE != 0 {
            return Err(ChronikError::corruption(format!(
                "index size {} is not a whole number of slots",
                bytes.len()
            )));
        }

        let (header, _): (Header, usize) = bincode::decode_from_slice(&bytes[..HEADER_SIZE as usize], CONFIG)?;
        if header.magic != MAGIC {
            return Err(ChronikError::HeaderMismatch {
                expected: format!("{:02x?}", MAGIC),
                actual: format!("{:02x?}", header.magic),
            });
        }
        if header.format_version != FORMAT_VERSION {
            return Err(ChronikError::HeaderMismatch {
                expected: format!("format version {}", FORMAT_VERSION),
                actual: format!("format version {}", header.format_version),
            });
        }
        if header.fs_identity != fs_identity {
            return Err(ChronikError::HeaderMismatch {
                expected: format!("fs identity {}", fs_identity),
                actual: format!("fs identity {}", header.fs_identity),
            });
        }

        let data_path = dir.join(DATA_FILE);
        let data = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&data_path)?;
        let data_len = data.metadata()?.len();

        let mut slots = Vec::with_capacity((bytes.len() - HEADER_SIZE as usize) / SLOT_SIZE as usize);
        for chunk in bytes[HEADER_SIZE as usize..].chunks_exact(SLOT_SIZE as usize) {
            let (slot, _): (Slot, usize) = bincode::decode_from_slice(chunk, CONFIG)?;
            slots.push(slot);
        }

        let mut free = Vec::new();
        let mut live_bytes = 0u64;
        for (i, slot) in slots.iter().enumerate() {
            let id = i as RecordId + 1;
            if !slot.is_used() {
                free.push(id);
                continue;
            }
            let end = slot.data_offset.checked_add(slot.data_len as u64);
            if end.map_or(true, |end| end > data_len) {
                return Err(ChronikError::corruption(format!(
                    "record {} at offset {} ({} bytes) lies past data size {}",
                    id, slot.data_offset, slot.data_len, data_len
                )));
            }
            live_bytes += slot.data_len as u64;
        }
        free.reverse();

        for (what, id) in [("first", header.first_record), ("last", header.last_record)] {
            if id != NO_RECORD && slots.get(id as usize - 1).map_or(true, |s| !s.is_used()) {
                return Err(ChronikError::corruption(format!("{} record {} is not a used slot", what, id)));
            }
        }
        if (header.first_record == NO_RECORD) != (header.last_record == NO_RECORD) {
            return Err(ChronikError::corruption("header has only one end of the record chain"));
        }

        let index = OpenOptions::new().read(true).write(true).open(&index_path)?;
        Ok(Some(Self {
            dir: dir.to_path_buf(),
            fs_identity,
            header,
            slots,
            free,
            index,
            data: Mutex::new(data),
            data_len,
            garbage: data_len.saturating_sub(live_bytes),
        }))
    }

    fn create(dir: PathBuf, fs_identity: u64) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(INDEX_FILE))?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(DATA_FILE))?;

        let mut storage = Self {
            dir,
            fs_identity,
            header: Header::new(fs_identity),
            slots: Vec::new(),
            free: Vec::new(),
            index,
            data: Mutex::new(data),
            data_len: 0,
            garbage: 0,
        };
        storage.write_header()?;
        storage.index.sync_all()?;
        Ok(storage)
    }

    fn recreate(dir: PathBuf, fs_identity: u64) -> Result<Self> {
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::create(dir, fs_identity)
    }

    fn write_header(&mut self) -> Result<()> {
        let bytes = bincode::encode_to_vec(self.header, CONFIG)?;
        self.index.seek(SeekFrom::Start(0))?;
        self.index.write_all(&bytes)?;
        Ok(())
    }

    fn write_slot(&mut self, id: RecordId) -> Result<()> {
        let slot = *self.slot_any(id)?;
        let bytes = bincode::encode_to_vec(slot, CONFIG)?;
        self.index
            .seek(SeekFrom::Start(HEADER_SIZE + (id as u64 - 1) * SLOT_SIZE))?;
        self.index.write_all(&bytes)?;
        Ok(())
    }

    fn slot_any(&self, id: RecordId) -> Result<&Slot> {
        if id == NO_RECORD {
            return Err(ChronikError::RecordNotFound(id));
        }
        self.slots
            .get(id as usize - 1)
            .ok_or(ChronikError::RecordNotFound(id))
    }

    fn slot(&self, id: RecordId) -> Result<&Slot> {
        let slot = self.slot_any(id)?;
        if !slot.is_used() {
            return Err(ChronikError::RecordNotFound(id));
        }
        Ok(slot)
    }

    fn slot_mut(&mut self, id: RecordId) -> Result<&mut Slot> {
        self.slot(id)?;
        Ok(&mut self.slots[id as usize - 1])
    }

    fn allocate_slot(&mut self) -> Result<RecordId> {
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        self.slots.push(Slot::default());
        RecordId::try_from(self.slots.len()).map_err(|_| ChronikError::storage("record table is full"))
    }

    fn free_slot(&mut self, id: RecordId) -> Result<RecordId> {
        let slot = *self.slot(id)?;
        self.garbage += slot.data_len as u64;
        self.slots[id as usize - 1] = Slot::default();
        self.write_slot(id)?;
        self.free.push(id);
        Ok(slot.next)
    }

    fn read_payload(&self, slot: &Slot) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; slot.data_len as usize];
        let mut data = self.data.lock();
        data.seek(SeekFrom::Start(slot.data_offset))?;
        data.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.data_len < COMPACTION_MIN_BYTES || self.garbage * 2 <= self.data_len {
            return Ok(());
        }
        self.compact()
    }

    /// Copy live payloads into a fresh data file
    fn compact(&mut self) -> Result<()> {
        let before = self.data_len;
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let mut offset = 0u64;
        let mut moved = Vec::new();

        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.is_used() {
                continue;
            }
            let payload = self.read_payload(slot)?;
            temp.write_all(&payload)?;
            moved.push((i as RecordId + 1, offset));
            offset += payload.len() as u64;
        }
        temp.as_file().sync_all()?;
        let file = temp.persist(self.dir.join(DATA_FILE)).map_err(|e| e.error)?;

        for (id, new_offset) in moved {
            self.slots[id as usize - 1].data_offset = new_offset;
            self.write_slot(id)?;
        }
        self.index.sync_data()?;

        *self.data.lock() = file;
        self.data_len = offset;
        self.garbage = 0;
        info!(
            "Compacted change log data: {} -> {}",
            utils::format_bytes(before),
            utils::format_bytes(offset)
        );
        Ok(())
    }
}

fn link(id: RecordId) -> Option<RecordId> {
    (id != NO_RECORD).then_some(id)
}

impl ChangeLogStorage for FileChangeLogStorage {
    fn next_id(&mut self) -> Result<u64> {
        self.header.last_assigned_id = self
            .header
            .last_assigned_id
            .checked_add(1)
            .ok_or_else(|| ChronikError::corruption("change id counter overflowed"))?;
        self.write_header()?;
        Ok(self.header.last_assigned_id)
    }

    fn last_assigned_id(&self) -> u64 {
        self.header.last_assigned_id
    }

    fn create_record(&mut self, timestamp: u64, payload: &[u8]) -> Result<RecordId> {
        let data_len = u32::try_from(payload.len())
            .map_err(|_| ChronikError::storage(format!("record payload of {} bytes is too large", payload.len())))?;

        let offset = self.data_len;
        {
            let mut data = self.data.lock();
            data.seek(SeekFrom::Start(offset))?;
            data.write_all(payload)?;
        }
        self.data_len += payload.len() as u64;

        let id = self.allocate_slot()?;
        let tail = self.header.last_record;
        self.slots[id as usize - 1] = Slot {
            prev: tail,
            next: NO_RECORD,
            timestamp,
            data_offset: offset,
            data_len,
            flags: SLOT_USED,
        };
        self.write_slot(id)?;

        if tail != NO_RECORD {
            self.slot_mut(tail)?.next = id;
            self.write_slot(tail)?;
        }

        self.header.last_record = id;
        if self.header.first_record == NO_RECORD {
            self.header.first_record = id;
        }
        self.write_header()?;

        trace!("Created record {} at offset {} ({} bytes)", id, offset, data_len);
        Ok(id)
    }

    fn read_record(&self, id: RecordId) -> Result<Vec<u8>> {
        let slot = self.slot(id)?;
        let end = slot.data_offset.checked_add(slot.data_len as u64);
        if end.map_or(true, |end| end > self.data_len) {
            return Err(ChronikError::corruption(format!(
                "record {} at offset {} ({} bytes) lies past data size {}",
                id, slot.data_offset, slot.data_len, self.data_len
            )));
        }
        self.read_payload(slot)
    }

    fn record_timestamp(&self, id: RecordId) -> Result<u64> {
        Ok(self.slot(id)?.timestamp)
    }

    fn record_location(&self, id: RecordId) -> Option<(u64, u32)> {
        self.slot_any(id).ok().map(|slot| (slot.data_offset, slot.data_len))
    }

    fn previous_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        Ok(link(self.slot(id)?.prev))
    }

    fn next_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        Ok(link(self.slot(id)?.next))
    }

    fn first_record(&self) -> Option<RecordId> {
        link(self.header.first_record)
    }

    fn last_record(&self) -> Option<RecordId> {
        link(self.header.last_record)
    }

    fn record_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_used()).count()
    }

    fn delete_records_up_to(&mut self, id: RecordId) -> Result<()> {
        self.slot(id)?;

        let mut current = self.header.first_record;
        let mut steps = 0usize;
        let new_first = loop {
            if steps > self.slots.len() {
                return Err(ChronikError::CyclicRecordChain(current));
            }
            steps += 1;

            let next = self.free_slot(current)?;
            if current == id {
                break next;
            }
            if next == NO_RECORD {
                return Err(ChronikError::RecordNotFound(id));
            }
            current = next;
        };

        self.header.first_record = new_first;
        if new_first == NO_RECORD {
            self.header.last_record = NO_RECORD;
        } else {
            self.slot_mut(new_first)?.prev = NO_RECORD;
            self.write_slot(new_first)?;
        }
        self.write_header()?;
        debug!("Deleted records up to {} ({} remaining)", id, self.record_count());

        self.maybe_compact()
    }

    fn flush(&mut self) -> Result<()> {
        self.index.sync_data()?;
        self.data.lock().sync_data()?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let last_assigned_id = self.header.last_assigned_id;
        let mut fresh = Self::recreate(self.dir.clone(), self.fs_identity)?;
        fresh.header.last_assigned_id = last_assigned_id;
        fresh.write_header()?;
        *self = fresh;
        info!("Recreated change log at {:?}", self.dir);
        Ok(())
    }
}

impl Drop for FileChangeLogStorage {
    fn drop(&mut self) {
        if let Err(e) = ChangeLogStorage::flush(self) {
            warn!("Failed to flush change log on drop: {}", e);
        }
    }
}
