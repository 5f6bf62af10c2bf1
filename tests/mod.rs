//! Main test module for Chronik
//!
//! This module includes all test suites:
//! - Integration tests for realistic host scenarios
//! - Chaos tests for corruption and concurrent access
//! - Property-based tests for replay invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::chronik::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_empty_history() {
        let history = LocalHistory::in_memory();
        assert!(history.change_sets().unwrap().is_empty());
        assert!(history.recent_changes().unwrap().is_empty());
        assert!(history.revisions_for("/nothing", None, None).unwrap().is_empty());
        assert_eq!(history.stats().tree_entries, 1);
        assert!(history.entry("/").unwrap().is_directory());
    }

    #[test]
    fn test_unknown_revision() {
        let history = LocalHistory::in_memory();
        history.record_create_directory("/d").unwrap();
        assert!(matches!(
            history.tree_at(RevisionPoint::Before(999)),
            Err(ChronikError::RevisionNotFound(999))
        ));
    }

    #[test]
    fn test_oversized_content_is_unavailable() {
        let history = LocalHistoryBuilder::new().max_content_size(8).in_memory();
        history.record_create_file("/small", b"tiny", 0, false).unwrap();
        history.record_create_file("/large", b"far more than eight bytes", 0, false).unwrap();

        let large = history.current_content("/large").unwrap();
        assert_eq!(large, Content::Unavailable);
        assert_eq!(history.content_bytes(&large), None);

        let set = history.change_sets().unwrap()[0].id;
        assert_eq!(history.content_at("/large", RevisionPoint::After(set)).unwrap(), None);
        assert_eq!(
            history.content_at("/small", RevisionPoint::After(set)).unwrap(),
            Some(b"tiny".to_vec())
        );
    }

    #[test]
    fn test_case_insensitive_paths() {
        let history = LocalHistoryBuilder::new().case_sensitive(false).in_memory();
        history.record_create_directory("/Docs").unwrap();
        history.record_create_file("/docs/Readme.MD", b"hi", 0, false).unwrap();
        assert!(history.entry("/DOCS/readme.md").is_some());
        assert!(matches!(
            history.record_create_directory("/DOCS"),
            Err(ChronikError::EntryAlreadyExists(_))
        ));
        assert_eq!(history.revisions_for("/docs/readme.md", None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_unicode_names() {
        let history = LocalHistory::in_memory();
        let names = ["файл.txt", "文件.txt", "ファイル.txt", "🚀🌟💾.txt"];
        for name in &names {
            history
                .record_create_file(&format!("/{}", name), name.as_bytes(), 0, false)
                .unwrap();
        }
        for name in &names {
            let content = history.current_content(&format!("/{}", name)).unwrap();
            assert_eq!(history.content_bytes(&content), Some(name.as_bytes().to_vec()));
        }
    }

    #[test]
    fn test_move_into_own_subtree_is_rejected() {
        let history = LocalHistory::in_memory();
        history.record_create_directory("/a").unwrap();
        history.record_create_directory("/a/b").unwrap();
        assert!(history.record_move("/a", "/a/b").is_err());
        assert_eq!(history.change_sets().unwrap().len(), 2);
    }

    #[test]
    fn test_fs_identity_change_discards_log() {
        let storage_dir = TempDir::new().unwrap();
        {
            let history = LocalHistoryBuilder::new().fs_identity(1).open(storage_dir.path()).unwrap();
            history.record_create_directory("/kept").unwrap();
            history.close().unwrap();
        }
        let history = LocalHistoryBuilder::new().fs_identity(2).open(storage_dir.path()).unwrap();
        assert!(history.change_sets().unwrap().is_empty());
        assert!(history.entry("/kept").is_some());
    }

    #[test]
    fn test_nested_scopes_produce_one_set() {
        let history = LocalHistory::in_memory();
        {
            let _outer = history.change_set_scope(Some("outer".to_string())).unwrap();
            {
                let _inner = history.change_set_scope(Some("inner".to_string())).unwrap();
                history.record_create_directory("/x").unwrap();
            }
            history.record_create_directory("/y").unwrap();
        }
        let sets = history.change_sets().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].name.as_deref(), Some("outer"));
        assert_eq!(sets[0].changes.len(), 2);
    }

    #[test]
    fn test_listener_registered_from_listener() {
        struct Registering {
            history: Arc<LocalHistory>,
            registrations: parking_lot::Mutex<Vec<ListenerRegistration>>,
        }

        struct Quiet;
        impl HistoryListener for Quiet {}

        impl HistoryListener for Registering {
            fn change_set_finished(&self) {
                let registration = self.history.add_listener(Arc::new(Quiet));
                self.registrations.lock().push(registration);
            }
        }

        let history = Arc::new(LocalHistory::in_memory());
        let listener = Arc::new(Registering {
            history: Arc::clone(&history),
            registrations: parking_lot::Mutex::new(Vec::new()),
        });
        let _registration = history.add_listener(listener.clone());
        history.record_create_directory("/a").unwrap();
        history.record_create_directory("/b").unwrap();
        assert_eq!(listener.registrations.lock().len(), 2);
    }
}
