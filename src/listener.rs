//! Change notifications
//!
//! Listeners are kept in a copy-on-write list: registering or removing one
//! swaps in a new list, and notification works on a snapshot, so a listener
//! may register or drop registrations while being notified.

use crate::change::Change;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Receives notifications about recorded changes
///
/// Both callbacks run synchronously on the recording thread after the
/// history's locks were released.
pub trait HistoryListener: Send + Sync {
    /// A change was added to the open change set
    fn change_added(&self, _change: &Change) {}

    /// The outermost change set was closed and persisted
    fn change_set_finished(&self) {}
}

type ListenerList = Arc<Vec<(u64, Arc<dyn HistoryListener>)>>;

#[derive(Default)]
struct Registry {
    list: Mutex<ListenerList>,
    next_key: AtomicU64,
}

/// Listener list owned by a history
#[derive(Default, Clone)]
pub(crate) struct Listeners {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} listeners>", self.registry.list.lock().len())
    }
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn HistoryListener>) -> ListenerRegistration {
        let key = self.registry.next_key.fetch_add(1, Ordering::Relaxed);
        let mut list = self.registry.list.lock();
        let mut updated = Vec::with_capacity(list.len() + 1);
        updated.extend(list.iter().cloned());
        updated.push((key, listener));
        *list = Arc::new(updated);
        ListenerRegistration {
            registry: Arc::downgrade(&self.registry),
            key,
        }
    }

    fn snapshot(&self) -> ListenerList {
        self.registry.list.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.list.lock().len()
    }

    pub(crate) fn change_added(&self, change: &Change) {
        for (_, listener) in self.snapshot().iter() {
            listener.change_added(change);
        }
    }

    pub(crate) fn change_set_finished(&self) {
        let listeners = self.snapshot();
        trace!("Notifying {} listeners of a finished change set", listeners.len());
        for (_, listener) in listeners.iter() {
            listener.change_set_finished();
        }
    }
}

/// Keeps a listener registered; dropping it unregisters the listener
#[must_use = "the listener is removed when the registration is dropped"]
pub struct ListenerRegistration {
    registry: Weak<Registry>,
    key: u64,
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration").field("key", &self.key).finish()
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut list = registry.list.lock();
        let updated: Vec<_> = list.iter().filter(|(k, _)| *k != self.key).cloned().collect();
        *list = Arc::new(updated);
    }
}
