//! Chaos testing for Chronik
//!
//! Damages the on-disk store at random and hammers a shared history from
//! several threads. Nothing may panic; a damaged change log must surface as
//! a history reset and leave the history usable.

use ::chronik::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, warn};

/// Paths recorded by [`populate`]
const TRACKED: &[&str] = &["/src", "/src/main.rs", "/src/lib.rs", "/docs/guide.md", "/docs", "/README.md"];

/// Random damage to storage files
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// XOR `count` random bytes of `path` with random non-zero masks
    pub fn flip_bytes(&mut self, path: &Path, count: usize) -> anyhow::Result<usize> {
        let mut bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(0);
        }
        for _ in 0..count {
            let at = self.rng.random_range(0..bytes.len());
            bytes[at] ^= self.rng.random_range(1..=255u8);
        }
        fs::write(path, bytes)?;
        Ok(count)
    }

    /// Cut `path` at a random length
    pub fn truncate(&mut self, path: &Path) -> anyhow::Result<u64> {
        let len = fs::metadata(path)?.len();
        let keep = if len == 0 { 0 } else { self.rng.random_range(0..len) };
        fs::OpenOptions::new().write(true).open(path)?.set_len(keep)?;
        Ok(keep)
    }

    /// Pick one of `paths`
    pub fn pick<'a>(&mut self, paths: &'a [PathBuf]) -> &'a Path {
        &paths[self.rng.random_range(0..paths.len())]
    }
}

/// Record a small project history into `storage` and close it
fn populate(storage: &Path) -> anyhow::Result<()> {
    let history = LocalHistory::open(storage)?;
    {
        let _scope = history.change_set_scope(Some("Create project".to_string()))?;
        history.record_create_directory("/src")?;
        history.record_create_file("/src/main.rs", b"fn main() {}", 1, false)?;
        history.record_create_file("/README.md", &b"# Project\n".repeat(200), 1, false)?;
    }
    history.record_content_change("/src/main.rs", b"fn main() { lib::run() }", 2)?;
    history.record_create_file("/src/lib.rs", b"pub fn run() {}", 3, false)?;
    history.put_user_label("before docs", None)?;
    history.record_create_directory("/docs")?;
    history.record_create_file("/docs/guide.md", b"Read me first", 4, true)?;
    history.record_content_change("/README.md", b"# Project\nSee docs/", 5)?;
    history.record_rename("/docs/guide.md", "intro.md")?;
    history.record_rename("/docs/intro.md", "guide.md")?;
    history.put_system_label("build", Some("p"), 0x00ff00)?;
    history.close()?;
    Ok(())
}

fn is_reset(error: &ChronikError) -> bool {
    matches!(error, ChronikError::HistoryReset(_) | ChronikError::StorageUnavailable)
}

/// Tally of query outcomes against a damaged store
#[derive(Debug, Default)]
struct Outcome {
    ok: usize,
    resets: usize,
}

impl Outcome {
    fn observe<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.ok += 1;
                Some(value)
            }
            Err(e) if is_reset(&e) => {
                warn!("Query reset the history: {}", e);
                self.resets += 1;
                None
            }
            Err(e) => panic!("unexpected error from damaged store: {e}"),
        }
    }
}

/// Run every kind of query against `history`
fn query_everything(history: &LocalHistory, outcome: &mut Outcome) {
    if let Some(sets) = outcome.observe(history.change_sets()) {
        for set in &sets {
            outcome.observe(history.tree_at(RevisionPoint::Before(set.id)));
        }
    }
    for path in TRACKED {
        outcome.observe(history.revisions_for(path, None, None));
        outcome.observe(history.content_at(path, RevisionPoint::Current));
    }
    outcome.observe(history.recent_changes());
}

#[test]
fn test_change_log_corruption_resets_history() {
    for seed in 0..24u64 {
        let storage = TempDir::new().unwrap();
        populate(storage.path()).unwrap();

        let mut chaos = ChaosEngine::new(seed);
        let changes = storage.path().join("changes");
        let targets = vec![changes.join("records.idx"), changes.join("records.dat")];
        let target = chaos.pick(&targets).to_path_buf();
        if seed % 5 == 4 {
            chaos.truncate(&target).unwrap();
        } else {
            let flips = 1 + seed as usize % 8;
            chaos.flip_bytes(&target, flips).unwrap();
        }

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let history = LocalHistoryBuilder::new()
            .on_reset(move |message| {
                assert!(!message.is_empty());
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .open(storage.path())
            .unwrap();

        let mut outcome = Outcome::default();
        query_everything(&history, &mut outcome);

        // Recording may be the first operation to trip over the damage
        outcome.observe(history.record_create_directory("/after_damage"));
        history.record_create_directory("/after_recovery").unwrap();
        query_everything(&history, &mut outcome);

        info!("Seed {}: {:?}", seed, outcome);
        assert_eq!(notified.load(Ordering::SeqCst), outcome.resets, "seed {}", seed);
        assert!(history.entry("/after_recovery").is_some());
        if !history.stats().storage_unavailable {
            let newest = &history.change_sets().unwrap()[0];
            assert_eq!(newest.changes[0].path(), Some("/after_recovery"));
        }
    }
}

#[test]
fn test_damaged_tree_and_contents_never_panic() {
    for seed in 0..16u64 {
        let storage = TempDir::new().unwrap();
        populate(storage.path()).unwrap();

        let mut chaos = ChaosEngine::new(1000 + seed);
        let mut targets = vec![storage.path().join("tree.bin"), storage.path().join("contents").join("handles.bin")];
        for entry in walkdir::WalkDir::new(storage.path().join("contents").join("objects")) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                targets.push(entry.into_path());
            }
        }
        for _ in 0..3 {
            let target = chaos.pick(&targets).to_path_buf();
            chaos.flip_bytes(&target, 4).unwrap();
        }

        let history = LocalHistory::open(storage.path()).unwrap();
        assert!(history.entry("/").unwrap().is_directory());

        let mut outcome = Outcome::default();
        query_everything(&history, &mut outcome);
        assert_eq!(outcome.resets, 0, "seed {}", seed);

        let live = history.tree_at(RevisionPoint::Current).unwrap();
        for path in live.file_paths() {
            // Damaged payloads read as unavailable, never as an error
            history.content_at(&path, RevisionPoint::Current).unwrap();
        }
    }
}

#[test]
fn test_missing_storage_files() {
    let names = ["tree.bin", "metadata.json", "changes/records.idx", "changes/records.dat", "contents/handles.bin"];
    for name in names {
        let storage = TempDir::new().unwrap();
        populate(storage.path()).unwrap();
        fs::remove_file(storage.path().join(name)).unwrap();

        let history = LocalHistory::open(storage.path()).unwrap();
        let mut outcome = Outcome::default();
        query_everything(&history, &mut outcome);
        history.record_create_directory("/fresh").unwrap();
        info!("Without {}: {:?}", name, outcome);
    }
}

#[test]
fn test_concurrent_chaos() {
    let history = Arc::new(LocalHistory::in_memory());
    let pool: Vec<String> = (0..6).map(|i| format!("/n{}", i)).collect();
    let pool = Arc::new(pool);

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let history = Arc::clone(&history);
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                for step in 0..150u64 {
                    let path = &pool[rng.random_range(0..pool.len())];
                    let child = format!("{}/c{}", path, rng.random_range(0..3));
                    // Conflicting operations from other threads are rejected
                    let _ = match rng.random_range(0..7) {
                        0 => history.record_create_directory(path),
                        1 => history.record_create_file(&child, format!("{}:{}", t, step).as_bytes(), step, false),
                        2 => history.record_content_change(&child, &step.to_be_bytes(), step),
                        3 => history.record_delete(path),
                        4 => history.record_rename(&child, "renamed"),
                        5 => history.record_read_only_change(&child, rng.random()),
                        _ => history.put_user_label(&format!("t{}s{}", t, step), None).map(|_| ()),
                    };
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|r| {
            let history = Arc::clone(&history);
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let path = &pool[(r + i) % pool.len()];
                    history.revisions_for(path, None, None).unwrap();
                    history.recent_changes().unwrap();
                    let sets = history.change_sets().unwrap();
                    if let Some(oldest) = sets.last() {
                        history.tree_at(RevisionPoint::After(oldest.id)).unwrap();
                    }
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    let mut replayed = RootEntry::new(history.paths());
    for set in history.change_sets().unwrap().iter().rev() {
        set.apply_to(&mut replayed).unwrap();
    }
    assert_eq!(replayed, history.tree_at(RevisionPoint::Current).unwrap());
}
