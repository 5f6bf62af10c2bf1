//! Replay engine: materializing past trees and collecting revisions
//!
//! Past states are produced by copying the live tree and reverting changes
//! onto the copy, newest first, until the requested point. A path of interest
//! can be tracked along the way; renames and moves rewrite it so it always
//! names the same resource in the tree being reverted.
//!
//! Changes that no longer fit the tree (the log is only a cache over a
//! filesystem the host owns) are logged and skipped.

use crate::change::{Change, ChangeId, ChangeSet};
use crate::change_list::{ChangeList, ChangeSetVisitor, VisitControl};
use crate::entry::RootEntry;
use crate::error::{ChronikError, Result};
use crate::paths::{self, Paths};
use crate::types::{Revision, RevisionPoint};
use globset::GlobMatcher;
use tracing::{debug, warn};

/// Where a revert stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertTarget {
    /// A whole change set
    ChangeSet(ChangeId),
    /// A single change
    Change(ChangeId),
}

/// Result of reverting the live tree to a past point
#[derive(Debug, Clone)]
pub struct Reverted {
    /// Tree as of the target point
    pub tree: RootEntry,
    /// The tracked path as of the target point
    pub path: Option<String>,
}

struct Reverter<'a> {
    tree: RootEntry,
    rules: &'a Paths,
    target: RevertTarget,
    inclusive: bool,
    path: Option<String>,
    found: bool,
}

impl Reverter<'_> {
    fn revert(&mut self, change: &Change) {
        match change.revert_on(&mut self.tree) {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => debug!("Skipping revert of change {}: {}", change.id, e),
            Err(e) => warn!("Revert of change {} failed, skipping it: {}", change.id, e),
        }
        if let Some(path) = &self.path {
            self.path = Some(change.revert_path(path, self.rules));
        }
    }
}

impl ChangeSetVisitor for Reverter<'_> {
    fn begin(&mut self, set: &ChangeSet) -> VisitControl {
        if !self.inclusive && self.target == RevertTarget::ChangeSet(set.id) {
            self.found = true;
            return VisitControl::Stop;
        }
        VisitControl::Continue
    }

    fn visit(&mut self, change: &Change) -> VisitControl {
        if self.target == RevertTarget::Change(change.id) {
            self.found = true;
            if self.inclusive {
                self.revert(change);
            }
            return VisitControl::Stop;
        }
        self.revert(change);
        VisitControl::Continue
    }

    fn end(&mut self, set: &ChangeSet) -> VisitControl {
        if self.target == RevertTarget::ChangeSet(set.id) {
            self.found = true;
            return VisitControl::Stop;
        }
        VisitControl::Continue
    }
}

/// Revert a copy of `live` back to `target`
///
/// With `inclusive` the target itself is reverted too, producing the state
/// just before it; otherwise the state just after it. `tracked` is a path in
/// the live tree to follow back in time.
pub fn revert_to(
    list: &ChangeList,
    live: &RootEntry,
    target: RevertTarget,
    inclusive: bool,
    tracked: Option<&str>,
) -> Result<Reverted> {
    let rules = *live.paths();
    let mut reverter = Reverter {
        tree: live.clone(),
        rules: &rules,
        target,
        inclusive,
        path: tracked.map(paths::normalize),
        found: false,
    };
    list.accept(&mut reverter)?;

    if !reverter.found {
        let id = match target {
            RevertTarget::ChangeSet(id) | RevertTarget::Change(id) => id,
        };
        return Err(ChronikError::RevisionNotFound(id));
    }
    debug!("Reverted tree to {:?} (inclusive: {})", target, inclusive);
    Ok(Reverted {
        tree: reverter.tree,
        path: reverter.path,
    })
}

/// Tree and tracked path at a revision point
pub fn revert_to_point(
    list: &ChangeList,
    live: &RootEntry,
    point: RevisionPoint,
    tracked: Option<&str>,
) -> Result<Reverted> {
    match point {
        RevisionPoint::Current => Ok(Reverted {
            tree: live.clone(),
            path: tracked.map(paths::normalize),
        }),
        RevisionPoint::Before(id) => revert_to(list, live, RevertTarget::ChangeSet(id), true, tracked),
        RevisionPoint::After(id) => revert_to(list, live, RevertTarget::ChangeSet(id), false, tracked),
    }
}

/// Collects the change sets that make up a resource's history
struct RevisionsCollector<'a> {
    rules: &'a Paths,
    path: String,
    project_id: Option<&'a str>,
    matcher: Option<&'a GlobMatcher>,
    exists: bool,
    relevant: bool,
    labels: Vec<String>,
    path_after: String,
    revisions: Vec<Revision>,
}

impl RevisionsCollector<'_> {
    fn matches_pattern(&self, set: &ChangeSet) -> bool {
        let Some(matcher) = self.matcher else {
            return true;
        };
        if set.is_label_only() {
            return true;
        }
        matcher.is_match(paths::name(&self.path_after))
            || set
                .changes
                .iter()
                .filter_map(Change::path)
                .any(|p| matcher.is_match(paths::name(p)))
    }
}

impl ChangeSetVisitor for RevisionsCollector<'_> {
    fn begin(&mut self, _set: &ChangeSet) -> VisitControl {
        self.relevant = false;
        self.labels.clear();
        self.path_after = self.path.clone();
        VisitControl::Continue
    }

    fn visit(&mut self, change: &Change) -> VisitControl {
        if let Some(label) = change.label_name() {
            if change.affects_project(self.project_id) {
                self.relevant = true;
                self.labels.push(label.to_string());
            }
            return VisitControl::Continue;
        }

        if !self.exists {
            // The resource did not exist after this point; only its deletion
            // brings it back into view
            if change.is_deletion_of(&self.path, self.rules) {
                self.exists = true;
                self.relevant = true;
            }
            return VisitControl::Continue;
        }

        if change.affects_path(&self.path, self.rules) {
            self.relevant = true;
        }
        if change.is_creation_of(&self.path, self.rules) {
            self.exists = false;
        }
        self.path = change.revert_path(&self.path, self.rules);
        VisitControl::Continue
    }

    fn end(&mut self, set: &ChangeSet) -> VisitControl {
        if self.relevant && self.matches_pattern(set) {
            self.revisions.push(Revision {
                change_set_id: set.id,
                timestamp: set.timestamp,
                name: set.name.clone(),
                labels: std::mem::take(&mut self.labels),
                path: self.path_after.clone(),
                before: RevisionPoint::Before(set.id),
                after: RevisionPoint::After(set.id),
            });
        }
        VisitControl::Continue
    }
}

/// History of `path`, newest first
///
/// `path` is followed back through renames and moves. Labels are included
/// when they belong to `project_id`; `matcher` keeps only change sets touching
/// a matching file name.
pub fn collect_revisions(
    list: &ChangeList,
    live: &RootEntry,
    path: &str,
    project_id: Option<&str>,
    matcher: Option<&GlobMatcher>,
) -> Result<Vec<Revision>> {
    let rules = *live.paths();
    let path = paths::normalize(path);
    let mut collector = RevisionsCollector {
        rules: &rules,
        exists: live.has(&path),
        path_after: path.clone(),
        path,
        project_id,
        matcher,
        relevant: false,
        labels: Vec::new(),
        revisions: Vec::new(),
    };
    list.accept(&mut collector)?;
    Ok(collector.revisions)
}
