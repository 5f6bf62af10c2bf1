//! Change log storage contract and the in-memory implementation
//!
//! A change log is a doubly linked list of records. Each record carries a
//! creation timestamp and an opaque payload (an encoded change set). Record
//! ids are small integers into a slot arena; `0` is never a valid id.
//!
//! [`MemoryLogStorage`] keeps everything in a vector and behaves exactly like
//! the on-disk [`FileChangeLogStorage`](crate::record_table::FileChangeLogStorage),
//! which makes the layers above it testable without touching the disk.

use crate::error::{ChronikError, Result};
use tracing::trace;

/// Id of a record in the log; `0` means "no record"
pub type RecordId = u32;

/// Sentinel for "no record"
pub const NO_RECORD: RecordId = 0;

/// Storage backend for the change log
pub trait ChangeLogStorage: Send + Sync + std::fmt::Debug {
    /// Allocate the next change id; ids are monotonic and survive restarts
    fn next_id(&mut self) -> Result<u64>;

    /// Last id handed out by [`next_id`](Self::next_id)
    fn last_assigned_id(&self) -> u64;

    /// Append a record at the tail and return its id
    fn create_record(&mut self, timestamp: u64, payload: &[u8]) -> Result<RecordId>;

    /// Payload of a record
    fn read_record(&self, id: RecordId) -> Result<Vec<u8>>;

    /// Creation timestamp of a record
    fn record_timestamp(&self, id: RecordId) -> Result<u64>;

    /// Record before `id`, `None` at the head
    fn previous_record(&self, id: RecordId) -> Result<Option<RecordId>>;

    /// Record after `id`, `None` at the tail
    fn next_record(&self, id: RecordId) -> Result<Option<RecordId>>;

    /// Oldest record
    fn first_record(&self) -> Option<RecordId>;

    /// Newest record
    fn last_record(&self) -> Option<RecordId>;

    /// Number of live records
    fn record_count(&self) -> usize;

    /// Where a record's payload lives, as `(offset, length)`
    ///
    /// Only used to describe damaged records; storages without a data file
    /// report `None`.
    fn record_location(&self, _id: RecordId) -> Option<(u64, u32)> {
        None
    }

    /// Delete every record from the head up to and including `id`
    fn delete_records_up_to(&mut self, id: RecordId) -> Result<()>;

    /// Persist pending writes
    fn flush(&mut self) -> Result<()>;

    /// Throw away all records and start over
    fn reset(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    prev: RecordId,
    next: RecordId,
    timestamp: u64,
    payload: Vec<u8>,
}

/// Change log kept in a growable vector
#[derive(Debug, Default)]
pub struct MemoryLogStorage {
    /// Slot `i` holds record id `i + 1`; deleted records leave `None`
    records: Vec<Option<MemoryRecord>>,
    free: Vec<RecordId>,
    first: RecordId,
    last: RecordId,
    last_assigned_id: u64,
}

impl MemoryLogStorage {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log whose next id follows `last_assigned_id`
    pub fn starting_after(last_assigned_id: u64) -> Self {
        Self {
            last_assigned_id,
            ..Self::default()
        }
    }

    fn record(&self, id: RecordId) -> Result<&MemoryRecord> {
        if id == NO_RECORD {
            return Err(ChronikError::RecordNotFound(id));
        }
        self.records
            .get(id as usize - 1)
            .and_then(Option::as_ref)
            .ok_or(ChronikError::RecordNotFound(id))
    }

    fn record_mut(&mut self, id: RecordId) -> Result<&mut MemoryRecord> {
        if id == NO_RECORD {
            return Err(ChronikError::RecordNotFound(id));
        }
        self.records
            .get_mut(id as usize - 1)
            .and_then(Option::as_mut)
            .ok_or(ChronikError::RecordNotFound(id))
    }

    /// Point a record's `prev` link somewhere else
    #[cfg(test)]
    pub(crate) fn set_prev(&mut self, id: RecordId, prev: RecordId) {
        if let Ok(record) = self.record_mut(id) {
            record.prev = prev;
        }
    }
}

fn link(id: RecordId) -> Option<RecordId> {
    (id != NO_RECORD).then_some(id)
}

impl ChangeLogStorage for MemoryLogStorage {
    fn next_id(&mut self) -> Result<u64> {
        self.last_assigned_id += 1;
        Ok(self.last_assigned_id)
    }

    fn last_assigned_id(&self) -> u64 {
        self.last_assigned_id
    }

    fn create_record(&mut self, timestamp: u64, payload: &[u8]) -> Result<RecordId> {
        let record = MemoryRecord {
            prev: self.last,
            next: NO_RECORD,
            timestamp,
            payload: payload.to_vec(),
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.records[id as usize - 1] = Some(record);
                id
            }
            None => {
                self.records.push(Some(record));
                RecordId::try_from(self.records.len())
                    .map_err(|_| ChronikError::storage("record table is full"))?
            }
        };

        if self.last != NO_RECORD {
            let tail = self.last;
            self.record_mut(tail)?.next = id;
        }
        if self.first == NO_RECORD {
            self.first = id;
        }
        self.last = id;
        trace!("Created in-memory record {}", id);
        Ok(id)
    }

    fn read_record(&self, id: RecordId) -> Result<Vec<u8>> {
        Ok(self.record(id)?.payload.clone())
    }

    fn record_timestamp(&self, id: RecordId) -> Result<u64> {
        Ok(self.record(id)?.timestamp)
    }

    fn previous_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        Ok(link(self.record(id)?.prev))
    }

    fn next_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        Ok(link(self.record(id)?.next))
    }

    fn first_record(&self) -> Option<RecordId> {
        link(self.first)
    }

    fn last_record(&self) -> Option<RecordId> {
        link(self.last)
    }

    fn record_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    fn delete_records_up_to(&mut self, id: RecordId) -> Result<()> {
        self.record(id)?;

        let mut current = self.first;
        let mut steps = 0;
        loop {
            if steps > self.records.len() {
                return Err(ChronikError::CyclicRecordChain(current));
            }
            steps += 1;

            let next = self.record(current)?.next;
            self.records[current as usize - 1] = None;
            self.free.push(current);
            if current == id {
                self.first = next;
                break;
            }
            if next == NO_RECORD {
                return Err(ChronikError::RecordNotFound(id));
            }
            current = next;
        }

        if self.first == NO_RECORD {
            self.last = NO_RECORD;
        } else {
            let head = self.first;
            self.record_mut(head)?.prev = NO_RECORD;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let last_assigned_id = self.last_assigned_id;
        *self = Self::default();
        self.last_assigned_id = last_assigned_id;
        Ok(())
    }
}
