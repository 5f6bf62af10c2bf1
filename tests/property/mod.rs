//! Property-based testing for Chronik
//!
//! Uses proptest to drive random sequences of host operations over a small
//! pool of paths and checks the replay invariants of the recorded history.

use ::chronik::*;
use proptest::prelude::*;
use tracing::info;

const PATHS: &[&str] = &["/a", "/b", "/x", "/f.txt", "/a/x", "/a/f.txt", "/b/y", "/a/x/y"];
const NAMES: &[&str] = &["x", "y", "f.txt", "g.rs"];
const PARENTS: &[&str] = &["/", "/a", "/b", "/a/x"];

/// A host operation reported to the history
#[derive(Debug, Clone)]
pub enum HostOperation {
    CreateDirectory { path: &'static str },
    CreateFile { path: &'static str, content: Vec<u8>, read_only: bool },
    ChangeContent { path: &'static str, content: Vec<u8> },
    Rename { path: &'static str, name: &'static str },
    Move { path: &'static str, parent: &'static str },
    SetReadOnly { path: &'static str, read_only: bool },
    Delete { path: &'static str },
    Label { name: String },
    /// Run the operations as one change set
    Group { name: Option<String>, operations: Vec<HostOperation> },
}

fn path_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(PATHS)
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Generate a single, ungrouped operation
fn simple_operation_strategy() -> impl Strategy<Value = HostOperation> {
    prop_oneof![
        path_strategy().prop_map(|path| HostOperation::CreateDirectory { path }),
        (path_strategy(), content_strategy(), any::<bool>())
            .prop_map(|(path, content, read_only)| HostOperation::CreateFile { path, content, read_only }),
        (path_strategy(), content_strategy()).prop_map(|(path, content)| HostOperation::ChangeContent { path, content }),
        (path_strategy(), prop::sample::select(NAMES)).prop_map(|(path, name)| HostOperation::Rename { path, name }),
        (path_strategy(), prop::sample::select(PARENTS)).prop_map(|(path, parent)| HostOperation::Move { path, parent }),
        (path_strategy(), any::<bool>()).prop_map(|(path, read_only)| HostOperation::SetReadOnly { path, read_only }),
        path_strategy().prop_map(|path| HostOperation::Delete { path }),
        "[a-z]{1,8}".prop_map(|name| HostOperation::Label { name }),
    ]
}

/// Generate an operation, possibly a group of simple ones
fn operation_strategy() -> impl Strategy<Value = HostOperation> {
    prop_oneof![
        4 => simple_operation_strategy(),
        1 => (
            prop::option::of("[A-Z][a-z]{2,8}"),
            prop::collection::vec(simple_operation_strategy(), 1..5)
        )
            .prop_map(|(name, operations)| HostOperation::Group { name, operations }),
    ]
}

/// Report an operation; invalid ones are rejected and record nothing
fn perform(history: &LocalHistory, operation: &HostOperation, step: u64) {
    let _ = match operation {
        HostOperation::CreateDirectory { path } => history.record_create_directory(path),
        HostOperation::CreateFile { path, content, read_only } => {
            history.record_create_file(path, content, step, *read_only)
        }
        HostOperation::ChangeContent { path, content } => history.record_content_change(path, content, step),
        HostOperation::Rename { path, name } => history.record_rename(path, name),
        HostOperation::Move { path, parent } => history.record_move(path, parent),
        HostOperation::SetReadOnly { path, read_only } => history.record_read_only_change(path, *read_only),
        HostOperation::Delete { path } => history.record_delete(path),
        HostOperation::Label { name } => history.put_user_label(name, None).map(|_| ()),
        HostOperation::Group { name, operations } => {
            let scope = history.change_set_scope(name.clone()).unwrap();
            for operation in operations {
                perform(history, operation, step);
            }
            scope.finish().map(|_| ())
        }
    };
}

fn build_history(operations: &[HostOperation]) -> LocalHistory {
    let history = LocalHistory::in_memory();
    for (step, operation) in operations.iter().enumerate() {
        perform(&history, operation, step as u64);
    }
    history
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_forward_replay_matches_live_tree(
        operations in prop::collection::vec(operation_strategy(), 1..30)
    ) {
        let history = build_history(&operations);
        let sets = history.change_sets().unwrap();
        info!("{} operations produced {} change sets", operations.len(), sets.len());

        let mut replayed = RootEntry::new(history.paths());
        for set in sets.iter().rev() {
            set.apply_to(&mut replayed).unwrap();
        }
        prop_assert_eq!(replayed, history.tree_at(RevisionPoint::Current).unwrap());
    }

    #[test]
    fn prop_each_set_bridges_before_and_after(
        operations in prop::collection::vec(operation_strategy(), 1..20)
    ) {
        let history = build_history(&operations);

        for set in history.change_sets().unwrap() {
            let mut tree = history.tree_at(RevisionPoint::Before(set.id)).unwrap();
            set.apply_to(&mut tree).unwrap();
            prop_assert_eq!(&tree, &history.tree_at(RevisionPoint::After(set.id)).unwrap());

            set.revert_on(&mut tree).unwrap();
            prop_assert_eq!(&tree, &history.tree_at(RevisionPoint::Before(set.id)).unwrap());
        }
    }

    #[test]
    fn prop_change_sets_survive_encoding(
        operations in prop::collection::vec(operation_strategy(), 1..20)
    ) {
        let history = build_history(&operations);

        for set in history.change_sets().unwrap() {
            let encoded = codec::encode_change_set(&set).unwrap();
            prop_assert_eq!(codec::decode_change_set(&encoded).unwrap(), set);
        }
        let live = history.tree_at(RevisionPoint::Current).unwrap();
        let encoded = codec::encode_entry(live.root()).unwrap();
        prop_assert_eq!(&codec::decode_entry(&encoded).unwrap(), live.root());
    }

    #[test]
    fn prop_revisions_are_newest_first(
        operations in prop::collection::vec(operation_strategy(), 1..30),
        path in path_strategy()
    ) {
        let history = build_history(&operations);
        let revisions = history.revisions_for(path, None, None).unwrap();

        for pair in revisions.windows(2) {
            prop_assert!(pair[0].change_set_id > pair[1].change_set_id);
        }
        for revision in &revisions {
            prop_assert_eq!(revision.before, RevisionPoint::Before(revision.change_set_id));
            prop_assert_eq!(revision.after, RevisionPoint::After(revision.change_set_id));
        }
    }

    #[test]
    fn prop_current_content_matches_live_tree(
        operations in prop::collection::vec(operation_strategy(), 1..30)
    ) {
        let history = build_history(&operations);
        let live = history.tree_at(RevisionPoint::Current).unwrap();

        for path in live.file_paths() {
            let file = live.find(&path).and_then(Entry::as_file).unwrap();
            prop_assert_eq!(
                history.content_at(&path, RevisionPoint::Current).unwrap(),
                history.content_bytes(&file.content)
            );
        }
    }
}

#[cfg(test)]
mod invariant_tests {
    use super::*;

    #[test]
    fn test_rejected_operations_leave_no_trace() {
        let history = LocalHistory::in_memory();
        let rejected = [
            HostOperation::ChangeContent { path: "/f.txt", content: b"x".to_vec() },
            HostOperation::Delete { path: "/a" },
            HostOperation::CreateFile { path: "/a/x/y", content: Vec::new(), read_only: false },
            HostOperation::Move { path: "/b", parent: "/a" },
        ];
        for operation in &rejected {
            perform(&history, operation, 0);
        }
        assert!(history.change_sets().unwrap().is_empty());
        assert_eq!(history.stats().content.handles, 0);
    }

    #[test]
    fn test_group_with_rejected_member_keeps_the_rest() {
        let history = LocalHistory::in_memory();
        let group = HostOperation::Group {
            name: Some("Mixed".to_string()),
            operations: vec![
                HostOperation::CreateDirectory { path: "/a" },
                HostOperation::Delete { path: "/b" },
                HostOperation::CreateFile { path: "/a/f.txt", content: b"ok".to_vec(), read_only: false },
            ],
        };
        perform(&history, &group, 0);

        let sets = history.change_sets().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].name.as_deref(), Some("Mixed"));
        assert_eq!(sets[0].changes.len(), 2);
    }
}
