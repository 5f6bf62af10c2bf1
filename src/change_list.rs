//! Transaction and traversal layer over the change log
//!
//! [`ChangeList`] groups changes into change sets and hands closed sets to the
//! log storage. Grouping is driven by a depth counter: only the outermost
//! `begin`/`end` pair opens and closes a set, so compound host operations
//! coalesce into one record.
//!
//! Reading goes newest first: the set currently being built (if it has any
//! changes) and then the persisted records through their `prev` links. Every
//! record id seen during one traversal is remembered, so a damaged chain that
//! loops back on itself is reported as corruption instead of spinning.

use crate::change::{Change, ChangeId, ChangeSet};
use crate::codec;
use crate::collections::{HashSetExt, RecordIdSet};
use crate::error::{ChronikError, Result};
use crate::log_storage::{ChangeLogStorage, MemoryLogStorage, RecordId};
use crate::purge::PurgePolicy;
use crate::types::Clock;
use tracing::{debug, error, info, trace, warn};

/// Whether a traversal continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitControl {
    /// Keep going
    Continue,
    /// End the traversal now
    Stop,
}

/// Callbacks for [`ChangeList::accept`]
///
/// Change sets arrive newest first and, inside a set, changes arrive newest
/// first too.
pub trait ChangeSetVisitor {
    /// A change set is about to be visited
    fn begin(&mut self, _set: &ChangeSet) -> VisitControl {
        VisitControl::Continue
    }

    /// Visit one change
    fn visit(&mut self, change: &Change) -> VisitControl;

    /// All changes of the set were visited
    fn end(&mut self, _set: &ChangeSet) -> VisitControl {
        VisitControl::Continue
    }
}

/// Sequencing layer between the facade and the log storage
pub struct ChangeList {
    storage: Box<dyn ChangeLogStorage>,
    depth: usize,
    current: Option<ChangeSet>,
    clock: Clock,
    inert: bool,
}

impl std::fmt::Debug for ChangeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeList")
            .field("storage", &self.storage)
            .field("depth", &self.depth)
            .field("current", &self.current.as_ref().map(|s| s.id))
            .field("inert", &self.inert)
            .finish()
    }
}

impl ChangeList {
    /// Create a change list over a log storage
    pub fn new(storage: Box<dyn ChangeLogStorage>, clock: Clock) -> Self {
        Self {
            storage,
            depth: 0,
            current: None,
            clock,
            inert: false,
        }
    }

    /// Underlying log storage
    pub fn storage(&self) -> &dyn ChangeLogStorage {
        self.storage.as_ref()
    }

    /// Current nesting depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether the log stopped accepting writes after a failed rebuild
    pub fn is_inert(&self) -> bool {
        self.inert
    }

    /// Set being built, if any
    pub fn current_change_set(&self) -> Option<&ChangeSet> {
        self.current.as_ref()
    }

    /// Allocate a change id
    pub fn next_id(&mut self) -> Result<ChangeId> {
        self.storage.next_id()
    }

    /// Enter a change set, opening a new one at the outermost level
    pub fn begin_change_set(&mut self) -> Result<()> {
        if self.depth == 0 {
            let id = self.storage.next_id()?;
            let timestamp = (self.clock)();
            trace!("Opened change set {} at {}", id, timestamp);
            self.current = Some(ChangeSet::new(id, timestamp));
        }
        self.depth += 1;
        Ok(())
    }

    /// Add a change to the open set
    ///
    /// # Panics
    ///
    /// Panics when no change set is open.
    pub fn add_change(&mut self, change: Change) {
        assert!(self.depth > 0, "change {} added outside of a change set", change.id);
        let change_id = change.id;
        let set = self.current.get_or_insert_with(|| {
            // A failed split leaves the levels open without a set
            let id = self.storage.next_id().unwrap_or_else(|e| {
                warn!("Could not allocate a change set id, using change id {}: {}", change_id, e);
                change_id
            });
            debug!("Reopened change set {} after a failed split", id);
            ChangeSet::new(id, (self.clock)())
        });
        set.add(change);
    }

    /// Leave a change set
    ///
    /// Returns `true` when this closed the outermost level and a non-empty set
    /// was finished. `name`, when given at the outermost level, names the set.
    ///
    /// # Panics
    ///
    /// Panics when no change set is open.
    pub fn end_change_set(&mut self, name: Option<String>) -> Result<bool> {
        assert!(self.depth > 0, "end_change_set without a matching begin");
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(false);
        }
        self.close_current(name)
    }

    /// Close the open set (if any) and open a new one
    ///
    /// Returns whether the open set was split off and finished, which only
    /// happens when it had changes. On error no level is added and the levels
    /// that were open stay open; the next change reopens a set for them.
    pub fn force_begin_change_set(&mut self) -> Result<bool> {
        let finished = if self.depth > 0 { self.close_current(None)? } else { false };
        let id = self.storage.next_id()?;
        self.current = Some(ChangeSet::new(id, (self.clock)()));
        self.depth += 1;
        if finished {
            debug!("Split open change set, continuing in {}", id);
        }
        Ok(finished)
    }

    /// Open a change set that is closed when the guard goes away
    pub fn change_set_guard(&mut self, name: Option<String>) -> Result<ChangeSetGuard<'_>> {
        self.begin_change_set()?;
        Ok(ChangeSetGuard {
            list: self,
            name,
            finished: false,
        })
    }

    fn close_current(&mut self, name: Option<String>) -> Result<bool> {
        let Some(mut set) = self.current.take() else {
            return Ok(false);
        };
        if set.is_empty() {
            trace!("Discarding empty change set {}", set.id);
            return Ok(false);
        }
        if name.is_some() {
            set.name = name;
        }
        set.lock();

        if self.inert {
            debug!("Dropping change set {}: history storage is unavailable", set.id);
            return Ok(true);
        }

        let payload = codec::encode_change_set(&set)?;
        let record = self.storage.create_record(set.timestamp, &payload)?;
        debug!(
            "Persisted change set {} as record {} ({} changes, {} bytes)",
            set.id,
            record,
            set.changes.len(),
            payload.len()
        );
        Ok(true)
    }

    /// Change sets newest first
    pub fn iterate(&self) -> ChangeSetIter<'_> {
        ChangeSetIter {
            storage: self.storage.as_ref(),
            current: self.current.as_ref().filter(|s| !s.is_empty()),
            walk: RecordWalk::backward(self.storage.as_ref(), if self.inert { None } else { self.storage.last_record() }),
            last_good: None,
        }
    }

    /// Drive a visitor over the history, newest first
    pub fn accept(&self, visitor: &mut dyn ChangeSetVisitor) -> Result<()> {
        for set in self.iterate() {
            let set = set?;
            if visitor.begin(&set) == VisitControl::Stop {
                return Ok(());
            }
            for change in set.changes.iter().rev() {
                if visitor.visit(change) == VisitControl::Stop {
                    return Ok(());
                }
            }
            if visitor.end(&set) == VisitControl::Stop {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Remove change sets that fell out of the retention window
    ///
    /// Returns the removed sets oldest first so their contents can be
    /// released in the same order.
    pub fn purge(&mut self, policy: &PurgePolicy) -> Result<Vec<ChangeSet>> {
        if self.inert {
            return Ok(Vec::new());
        }

        let storage = self.storage.as_ref();
        let timestamps = RecordWalk::backward(storage, storage.last_record())
            .map(|id| id.and_then(|id| Ok((id, storage.record_timestamp(id)?))));
        let Some(boundary) = policy.find_boundary(timestamps)? else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        for id in RecordWalk::forward(storage, storage.first_record()) {
            let id = id?;
            removed.push(codec::decode_change_set(&storage.read_record(id)?)?);
            if id == boundary {
                break;
            }
        }

        self.storage.delete_records_up_to(boundary)?;
        info!("Purged {} change sets up to record {}", removed.len(), boundary);
        Ok(removed)
    }

    /// Rebuild the log storage after corruption
    ///
    /// If rebuilding fails too, the list turns inert: appends are dropped and
    /// traversals only see the set being built.
    pub fn recover(&mut self, cause: &ChronikError) -> Result<()> {
        error!("Change log is corrupted, rebuilding: {}", cause);
        match self.storage.reset() {
            Ok(()) => {
                warn!("Change log was rebuilt; older history is gone");
                Ok(())
            }
            Err(e) => {
                error!("Change log rebuild failed, history disabled: {}", e);
                let fallback = MemoryLogStorage::starting_after(self.storage.last_assigned_id());
                self.storage = Box::new(fallback);
                self.inert = true;
                Err(ChronikError::StorageUnavailable)
            }
        }
    }

    /// Persist pending writes
    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()
    }

    /// Close any open change set and flush
    pub fn close(&mut self) -> Result<()> {
        if self.depth > 0 {
            warn!("Closing change list with {} open change set level(s)", self.depth);
            self.depth = 0;
            self.close_current(None)?;
        }
        self.flush()
    }
}

/// Closes its change set when dropped
pub struct ChangeSetGuard<'a> {
    list: &'a mut ChangeList,
    name: Option<String>,
    finished: bool,
}

impl ChangeSetGuard<'_> {
    /// Add a change to the guarded set
    pub fn add_change(&mut self, change: Change) {
        self.list.add_change(change);
    }

    /// Change list the guard belongs to
    pub fn list(&mut self) -> &mut ChangeList {
        self.list
    }

    /// Close the set now and report whether a set was finished
    pub fn finish(mut self) -> Result<bool> {
        self.finished = true;
        let name = self.name.take();
        self.list.end_change_set(name)
    }
}

impl Drop for ChangeSetGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.list.end_change_set(self.name.take()) {
                warn!("Failed to close change set on scope exit: {}", e);
            }
        }
    }
}

/// Walks record ids along `prev` or `next` links, failing on a repeated id
struct RecordWalk<'a> {
    storage: &'a dyn ChangeLogStorage,
    next: Option<RecordId>,
    backward: bool,
    visited: RecordIdSet,
    failed: bool,
}

impl<'a> RecordWalk<'a> {
    fn backward(storage: &'a dyn ChangeLogStorage, start: Option<RecordId>) -> Self {
        Self::new(storage, start, true)
    }

    fn forward(storage: &'a dyn ChangeLogStorage, start: Option<RecordId>) -> Self {
        Self::new(storage, start, false)
    }

    fn new(storage: &'a dyn ChangeLogStorage, start: Option<RecordId>, backward: bool) -> Self {
        Self {
            storage,
            next: start,
            backward,
            visited: RecordIdSet::new(),
            failed: false,
        }
    }
}

impl Iterator for RecordWalk<'_> {
    type Item = Result<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let id = self.next?;
        if !self.visited.insert(id) {
            self.failed = true;
            return Some(Err(ChronikError::CyclicRecordChain(id)));
        }
        let link = if self.backward {
            self.storage.previous_record(id)
        } else {
            self.storage.next_record(id)
        };
        match link {
            Ok(next) => {
                self.next = next;
                Some(Ok(id))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy newest-first sequence of change sets
pub struct ChangeSetIter<'a> {
    storage: &'a dyn ChangeLogStorage,
    current: Option<&'a ChangeSet>,
    walk: RecordWalk<'a>,
    last_good: Option<RecordId>,
}

impl ChangeSetIter<'_> {
    /// Record id with its data offset and size, for corruption reports
    fn describe(&self, id: Option<RecordId>) -> String {
        match id {
            None => "none".to_string(),
            Some(id) => match self.storage.record_location(id) {
                Some((offset, len)) => format!("{} (offset {}, {} bytes)", id, offset, len),
                None => id.to_string(),
            },
        }
    }
}

impl Iterator for ChangeSetIter<'_> {
    type Item = Result<ChangeSet>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(current) = self.current.take() {
            return Some(Ok(current.clone()));
        }

        let mut failing = None;
        let result = self.walk.next()?.and_then(|id| {
            failing = Some(id);
            let payload = self.storage.read_record(id)?;
            codec::decode_change_set(&payload).map(|set| (id, set))
        });
        let result = match result {
            Ok((id, set)) => {
                self.last_good = Some(id);
                Ok(set)
            }
            Err(e) => {
                self.walk.failed = true;
                error!(
                    "Change log traversal failed at record {} after last good record {}: {}",
                    self.describe(failing),
                    self.describe(self.last_good),
                    e
                );
                Err(e)
            }
        };
        Some(result)
    }
}
