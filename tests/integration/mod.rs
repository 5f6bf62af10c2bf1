//! Integration tests for Chronik
//!
//! Drives a history the way a host would: a real working directory on disk,
//! a provider reading from it, and an on-disk store next to it.

use ::chronik::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// Route library logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Expected file contents after one change set
type Snapshot = BTreeMap<String, Vec<u8>>;

/// Test harness pairing a working directory with its history
pub struct HistoryTestHarness {
    pub work_dir: TempDir,
    pub storage_dir: TempDir,
    pub history: LocalHistory,
    pub file_generator: FileGenerator,
    /// Files the host currently has, by history path
    pub files: Snapshot,
    /// Expected files after each recorded change set
    pub snapshots: Vec<(ChangeId, Snapshot)>,
}

impl HistoryTestHarness {
    /// Create a new test harness
    pub fn new() -> Self {
        init_tracing();
        let work_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let history = Self::open_history(&work_dir, &storage_dir).unwrap();

        Self {
            work_dir,
            storage_dir,
            history,
            file_generator: FileGenerator::new(42),
            files: Snapshot::new(),
            snapshots: Vec::new(),
        }
    }

    fn open_history(work_dir: &TempDir, storage_dir: &TempDir) -> Result<LocalHistory> {
        LocalHistoryBuilder::new()
            .compression_strategy(CompressionStrategy::Fast)
            .provider(Arc::new(FsResourceProvider::new(work_dir.path())))
            .open(storage_dir.path())
    }

    /// Close the history and open it again over the same storage
    pub fn reopen(&mut self) -> Result<()> {
        self.history.close()?;
        self.history = Self::open_history(&self.work_dir, &self.storage_dir)?;
        Ok(())
    }

    fn disk_path(&self, path: &str) -> PathBuf {
        self.work_dir.path().join(path.trim_start_matches('/'))
    }

    fn snapshot(&mut self) {
        let newest = self.history.change_sets().unwrap()[0].id;
        self.snapshots.push((newest, self.files.clone()));
    }

    /// Generate a project on disk and record it in one go
    pub fn generate_project(&mut self, config: ProjectConfig) -> anyhow::Result<()> {
        for depth in 1..=config.max_depth {
            for dir_idx in 0..config.dirs_per_level {
                let mut dir = String::from("/proj");
                for level in 0..depth {
                    dir.push_str(&format!("/dir_{}_{}", level, dir_idx));
                }
                fs::create_dir_all(self.disk_path(&dir))?;

                for file_idx in 0..config.files_per_dir {
                    let path = format!("{}/file_{}.txt", dir, file_idx);
                    let content = self.file_generator.generate_file_content(config.file_size_range.clone());
                    fs::write(self.disk_path(&path), &content)?;
                    self.files.insert(path, content);
                }
            }
        }

        self.history.record_create("/proj")?;
        self.snapshot();
        Ok(())
    }

    /// Apply random mutations on disk, recording each one
    pub fn mutate_files(&mut self, config: MutationConfig) -> anyhow::Result<usize> {
        let mut applied = 0;
        for mutation_idx in 0..config.num_mutations {
            let paths: Vec<String> = self.files.keys().cloned().collect();
            if paths.is_empty() {
                break;
            }

            match self.file_generator.rng.random_range(0..3) {
                0 => {
                    let path = paths[self.file_generator.rng.random_range(0..paths.len())].clone();
                    let content = self.file_generator.generate_file_content(config.file_size_range.clone());
                    fs::write(self.disk_path(&path), &content)?;
                    self.history.record_content_change(&path, &content, mutation_idx as u64)?;
                    self.files.insert(path, content);
                }
                1 => {
                    let path = paths[self.file_generator.rng.random_range(0..paths.len())].clone();
                    fs::remove_file(self.disk_path(&path))?;
                    self.history.record_delete(&path)?;
                    self.files.remove(&path);
                }
                _ => {
                    let path = format!("/proj/mutated_file_{}.txt", mutation_idx);
                    let content = self.file_generator.generate_file_content(config.file_size_range.clone());
                    fs::write(self.disk_path(&path), &content)?;
                    self.history.record_create(&path)?;
                    self.files.insert(path, content);
                }
            }
            self.snapshot();
            applied += 1;
        }
        Ok(applied)
    }

    /// Check that every snapshot can be reconstructed from the history
    pub fn verify_snapshots(&self) -> anyhow::Result<()> {
        for (id, expected) in &self.snapshots {
            let tree = self.history.tree_at(RevisionPoint::After(*id))?;
            let mut actual = Snapshot::new();
            for path in tree.file_paths() {
                let file = tree.find(&path).and_then(Entry::as_file).unwrap();
                let bytes = self.history.content_bytes(&file.content).unwrap();
                actual.insert(path, bytes);
            }
            anyhow::ensure!(&actual == expected, "state after change set {} differs", id);
        }
        Ok(())
    }
}

/// Project layout generated by the harness
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub max_depth: usize,
    pub dirs_per_level: usize,
    pub files_per_dir: usize,
    pub file_size_range: std::ops::Range<usize>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            dirs_per_level: 2,
            files_per_dir: 3,
            file_size_range: 10..2000,
        }
    }
}

/// Mutation settings
#[derive(Debug, Clone)]
pub struct MutationConfig {
    pub num_mutations: usize,
    pub file_size_range: std::ops::Range<usize>,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            num_mutations: 30,
            file_size_range: 0..4000,
        }
    }
}

/// Deterministic content generator
pub struct FileGenerator {
    pub rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Text-like content, compressible like source files are
    pub fn generate_file_content(&mut self, size_range: std::ops::Range<usize>) -> Vec<u8> {
        let size = if size_range.is_empty() {
            size_range.start
        } else {
            self.rng.random_range(size_range)
        };
        const WORDS: &[&str] = &["fn", "let", "mut", "self", "match", "impl", "struct", "=>", "{", "}", ";\n"];
        let mut content = Vec::with_capacity(size + 8);
        while content.len() < size {
            content.extend_from_slice(WORDS[self.rng.random_range(0..WORDS.len())].as_bytes());
            content.push(b' ');
        }
        content.truncate(size);
        content
    }
}

#[test]
fn test_project_history_reconstruction() {
    let mut harness = HistoryTestHarness::new();
    harness.generate_project(ProjectConfig::default()).unwrap();
    let applied = harness.mutate_files(MutationConfig::default()).unwrap();
    info!("Applied {} mutations", applied);

    assert_eq!(harness.snapshots.len(), applied + 1);
    harness.verify_snapshots().unwrap();
}

#[test]
fn test_project_history_survives_reopen() {
    let mut harness = HistoryTestHarness::new();
    harness.generate_project(ProjectConfig::default()).unwrap();
    harness
        .mutate_files(MutationConfig {
            num_mutations: 15,
            ..Default::default()
        })
        .unwrap();

    let live_before = harness.history.tree_at(RevisionPoint::Current).unwrap();
    harness.reopen().unwrap();
    assert_eq!(harness.history.tree_at(RevisionPoint::Current).unwrap(), live_before);
    harness.verify_snapshots().unwrap();

    // Recording continues where the previous session stopped
    let last = harness.history.stats().last_change_id;
    harness.history.put_user_label("after reopen", None).unwrap();
    assert!(harness.history.stats().last_change_id > last);
}

#[test]
fn test_revisions_follow_file_across_operations() {
    let mut harness = HistoryTestHarness::new();
    fs::create_dir_all(harness.disk_path("/proj/src")).unwrap();
    fs::write(harness.disk_path("/proj/src/lib.rs"), b"pub mod a;").unwrap();
    harness.history.record_create("/proj").unwrap();

    harness.history.record_content_change("/proj/src/lib.rs", b"pub mod b;", 1).unwrap();
    harness.history.record_create_directory("/proj/core").unwrap();
    harness.history.record_move("/proj/src/lib.rs", "/proj/core").unwrap();
    harness.history.record_rename("/proj/core/lib.rs", "mod.rs").unwrap();
    harness.history.record_create_file("/proj/unrelated.txt", b"", 2, false).unwrap();

    let revisions = harness.history.revisions_for("/proj/core/mod.rs", None, None).unwrap();
    let paths: Vec<_> = revisions.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["/proj/core/mod.rs", "/proj/core/lib.rs", "/proj/src/lib.rs", "/proj/src/lib.rs"]
    );

    let oldest = revisions.last().unwrap();
    assert_eq!(
        harness.history.content_at("/proj/core/mod.rs", oldest.after).unwrap(),
        Some(b"pub mod a;".to_vec())
    );
    assert_eq!(harness.history.content_at("/proj/core/mod.rs", oldest.before).unwrap(), None);
}

#[test]
fn test_concurrent_recording() {
    let history = Arc::new(LocalHistory::in_memory());
    let finished = Arc::new(AtomicUsize::new(0));

    struct Counter(Arc<AtomicUsize>);
    impl HistoryListener for Counter {
        fn change_set_finished(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    let _registration = history.add_listener(Arc::new(Counter(finished.clone())));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let history = Arc::clone(&history);
            std::thread::spawn(move || {
                let dir = format!("/t{}", t);
                history.record_create_directory(&dir).unwrap();
                for i in 0..10 {
                    let path = format!("{}/f{}", dir, i);
                    history.record_create_file(&path, path.as_bytes(), i, false).unwrap();
                    history.record_content_change(&path, format!("{}!", path).as_bytes(), i + 1).unwrap();
                }
                history.record_rename(&dir, &format!("done{}", t)).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let sets = history.change_sets().unwrap();
    assert_eq!(sets.len(), 4 * 22);
    assert_eq!(finished.load(Ordering::SeqCst), sets.len());

    let mut replayed = RootEntry::new(history.paths());
    for set in sets.iter().rev() {
        set.apply_to(&mut replayed).unwrap();
    }
    assert_eq!(replayed, history.tree_at(RevisionPoint::Current).unwrap());
    assert_eq!(
        history.content_at("/done3/f9", RevisionPoint::Current).unwrap(),
        Some(b"/t3/f9!".to_vec())
    );
}

#[test]
fn test_purge_by_activity_time() {
    let now = Arc::new(AtomicU64::new(0));
    let clock = Arc::clone(&now);
    let history = LocalHistoryBuilder::new()
        .clock(move || clock.load(Ordering::SeqCst))
        .in_memory();

    for (i, at) in [0u64, 1, 2, 100_000].into_iter().enumerate() {
        now.store(at, Ordering::SeqCst);
        let content = format!("v{}", i);
        if i == 0 {
            history.record_create_file("/f", content.as_bytes(), at, false).unwrap();
        } else {
            history.record_content_change("/f", content.as_bytes(), at).unwrap();
        }
    }
    assert_eq!(history.stats().content.handles, 4);

    // The 100 s gap counts as 1 ms of activity
    let removed = history
        .purge(std::time::Duration::from_millis(2), std::time::Duration::from_millis(500))
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(history.change_sets().unwrap().len(), 2);

    // Only the content replaced by a purged change is released
    assert_eq!(history.stats().content.handles, 3);
    assert_eq!(history.revisions_for("/f", None, None).unwrap().len(), 2);
    assert_eq!(history.content_at("/f", RevisionPoint::Current).unwrap(), Some(b"v3".to_vec()));
}

#[test]
fn test_persisted_history_with_compression() {
    let storage_dir = TempDir::new().unwrap();
    let big: Vec<u8> = b"line of text\n".repeat(10_000);
    {
        let history = LocalHistoryBuilder::new()
            .compression_strategy(CompressionStrategy::Adaptive { min_size: 64 })
            .open(storage_dir.path())
            .unwrap();
        history.record_create_file("/big.txt", &big, 1, false).unwrap();
        history.record_content_change("/big.txt", b"short", 2).unwrap();
        history.close().unwrap();
    }

    let history = LocalHistory::open(storage_dir.path()).unwrap();
    let sets = history.change_sets().unwrap();
    assert_eq!(sets.len(), 2);
    assert_eq!(
        history.content_at("/big.txt", RevisionPoint::After(sets[1].id)).unwrap(),
        Some(big)
    );
    assert_eq!(history.content_at("/big.txt", RevisionPoint::Current).unwrap(), Some(b"short".to_vec()));
}
