//! Incremental collection cache
//!
//! Maps each test file to the mtime it had when last parsed and the items
//! found in it. Fresh parser output is merged against the stored record so
//! unchanged files are served from cache and changed or deleted files are
//! replaced or dropped.
//!
//! # Persistence
//!
//! The cache is a single JSON document:
//!
//! ```json
//! {"version": "1.0", "entries": {"/repo/test_a.py": {"mtime": 1700000000.5, "items": [...]}}}
//! ```
//!
//! A version mismatch or unreadable document loads as an empty cache. Write
//! failures are logged and ignored: the cache only ever saves work, so a
//! failed write degrades to "always miss" rather than failing collection.
//!
//! # Thread Safety
//!
//! One `parking_lot::Mutex` guards both the entry map and the stats counters,
//! so concurrent `put`/`merge` callers never lose or tear an entry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CACHE_VERSION;
use crate::fs_utils::atomic_write;
use crate::schema::{CollectedData, DiscoveredFile, FreshMetadata, TestItem};

/// File name of the persisted cache inside the cache directory
pub const CACHE_FILE_NAME: &str = "cache.json";

/// Default mtime tolerance in seconds
pub const DEFAULT_MTIME_TOLERANCE: f64 = 0.01;

/// Effectiveness counters for the current process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub files_parsed: usize,
    pub files_from_cache: usize,
}

impl CacheStats {
    /// hits / (hits + misses), or 0.0 before any lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files from cache, {} parsed ({:.1}% hit rate)",
            self.files_from_cache,
            self.files_parsed,
            self.hit_rate() * 100.0
        )
    }
}

/// Stored record for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub mtime: f64,
    pub items: Vec<TestItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    version: String,
    #[serde(default)]
    generated_at: Option<String>,
    #[serde(default)]
    entries: HashMap<String, CacheEntry>,
}

/// What `load` found on disk. Callers decide how loudly to report it.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// No cache file yet
    Missing,
    /// Entries restored from disk
    Loaded { entries: usize },
    /// Written by an incompatible version; treated as empty
    VersionMismatch { found: String },
    /// Unreadable or unparsable; treated as empty
    Corrupt { reason: String },
}

/// Result of merging fresh parser output
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Items per file, cached where fresh and newly parsed otherwise
    pub merged: CollectedData,
    /// Any entry added, overwritten or removed
    pub changed: bool,
    /// Counters for this merge alone
    pub stats: CacheStats,
    /// Files dropped because the parser no longer reports them
    pub removed: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
    /// RFC 3339 time of the last write (or of the loaded document)
    generated_at: Option<String>,
}

/// Persistent, mtime-validated cache of collected tests
#[derive(Debug)]
pub struct CollectionCache {
    cache_dir: PathBuf,
    cache_file: PathBuf,
    mtime_tolerance: f64,
    state: Mutex<CacheState>,
}

impl CollectionCache {
    /// Create an empty cache rooted at `cache_dir` (nothing is read yet)
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            cache_file: cache_dir.join(CACHE_FILE_NAME),
            cache_dir,
            mtime_tolerance: DEFAULT_MTIME_TOLERANCE,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Override the mtime tolerance
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.mtime_tolerance = tolerance.max(0.0);
        self
    }

    /// Create a cache and immediately load whatever is persisted
    pub fn open(cache_dir: impl Into<PathBuf>, tolerance: f64) -> (Self, LoadOutcome) {
        let cache = Self::new(cache_dir).with_tolerance(tolerance);
        let outcome = cache.load();
        (cache, outcome)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    fn is_fresh(&self, entry: &CacheEntry, mtime: f64) -> bool {
        (entry.mtime - mtime).abs() <= self.mtime_tolerance
    }

    /// Look up a file; a hit requires the stored mtime to match within tolerance
    pub fn get(&self, file_path: &str, current_mtime: f64) -> Option<Vec<TestItem>> {
        let mut state = self.state.lock();
        let items = state
            .entries
            .get(file_path)
            .filter(|entry| self.is_fresh(entry, current_mtime))
            .map(|entry| entry.items.clone());

        match items {
            Some(items) => {
                state.stats.cache_hits += 1;
                state.stats.files_from_cache += 1;
                Some(items)
            }
            None => {
                state.stats.cache_misses += 1;
                None
            }
        }
    }

    /// Store freshly parsed items for a file, replacing any previous entry
    pub fn put(&self, file_path: &str, mtime: f64, items: Vec<TestItem>) {
        let mut state = self.state.lock();
        state
            .entries
            .insert(file_path.to_string(), CacheEntry { mtime, items });
        state.stats.files_parsed += 1;
    }

    /// Drop a file's entry; returns whether one existed
    pub fn remove(&self, file_path: &str) -> bool {
        self.state.lock().entries.remove(file_path).is_some()
    }

    /// Stored entry without touching the stats
    pub fn peek(&self, file_path: &str) -> Option<CacheEntry> {
        self.state.lock().entries.get(file_path).cloned()
    }

    /// Files in `listing` whose stored entry is missing or stale.
    ///
    /// Does not count as a lookup; used to decide what to parse before a merge.
    pub fn stale_files(&self, listing: &[DiscoveredFile]) -> Vec<PathBuf> {
        let state = self.state.lock();
        listing
            .iter()
            .filter(|file| {
                let key = file.path.to_string_lossy();
                !state
                    .entries
                    .get(key.as_ref())
                    .is_some_and(|entry| self.is_fresh(entry, file.mtime))
            })
            .map(|file| file.path.clone())
            .collect()
    }

    /// Merge a full parser report into the cache.
    ///
    /// Fresh entries keep their cached items (hit); stale or unknown files
    /// adopt the reported items (miss + parse). Stored files absent from the
    /// report are deleted.
    pub fn merge(&self, fresh: FreshMetadata) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut state = self.state.lock();

        for (path, metadata) in fresh.iter() {
            let cached = state
                .entries
                .get(path)
                .filter(|entry| self.is_fresh(entry, metadata.mtime))
                .map(|entry| entry.items.clone());

            match cached {
                Some(items) => {
                    outcome.stats.cache_hits += 1;
                    outcome.stats.files_from_cache += 1;
                    outcome.merged.insert(path.clone(), items);
                }
                None => {
                    outcome.stats.cache_misses += 1;
                    outcome.stats.files_parsed += 1;
                    state.entries.insert(
                        path.clone(),
                        CacheEntry {
                            mtime: metadata.mtime,
                            items: metadata.items.clone(),
                        },
                    );
                    outcome.merged.insert(path.clone(), metadata.items.clone());
                    outcome.changed = true;
                }
            }
        }

        let before = state.entries.len();
        state.entries.retain(|path, _| fresh.contains_key(path));
        outcome.removed = before - state.entries.len();
        if outcome.removed > 0 {
            outcome.changed = true;
        }

        state.stats.cache_hits += outcome.stats.cache_hits;
        state.stats.cache_misses += outcome.stats.cache_misses;
        state.stats.files_parsed += outcome.stats.files_parsed;
        state.stats.files_from_cache += outcome.stats.files_from_cache;

        outcome
    }

    /// Write the cache to disk. Failures are logged and reported as `false`.
    pub fn persist(&self) -> bool {
        let mut state = self.state.lock();
        let generated_at = chrono::Utc::now().to_rfc3339();
        match self.write_document(&state.entries, &generated_at) {
            Ok(()) => {
                state.generated_at = Some(generated_at);
                tracing::debug!(
                    "Persisted {} cache entries to {}",
                    state.entries.len(),
                    self.cache_file.display()
                );
                true
            }
            Err(e) => {
                tracing::warn!("Failed to write cache {}: {}", self.cache_file.display(), e);
                false
            }
        }
    }

    fn write_document(
        &self,
        entries: &HashMap<String, CacheEntry>,
        generated_at: &str,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let document = serde_json::json!({
            "version": CACHE_VERSION,
            "generated_at": generated_at,
            "entries": entries,
        });
        let bytes = serde_json::to_vec(&document)?;
        atomic_write(&self.cache_file, &bytes)
    }

    /// Replace in-memory entries with the persisted record.
    ///
    /// Anything other than a valid, same-version document leaves the cache empty.
    pub fn load(&self) -> LoadOutcome {
        let (entries, generated_at, outcome) = match std::fs::read(&self.cache_file) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (HashMap::new(), None, LoadOutcome::Missing)
            }
            Err(e) => (
                HashMap::new(),
                None,
                LoadOutcome::Corrupt {
                    reason: e.to_string(),
                },
            ),
            Ok(bytes) => match serde_json::from_slice::<CacheDocument>(&bytes) {
                Err(e) => (
                    HashMap::new(),
                    None,
                    LoadOutcome::Corrupt {
                        reason: e.to_string(),
                    },
                ),
                Ok(doc) if doc.version != CACHE_VERSION => (
                    HashMap::new(),
                    None,
                    LoadOutcome::VersionMismatch { found: doc.version },
                ),
                Ok(doc) => {
                    let count = doc.entries.len();
                    (doc.entries, doc.generated_at, LoadOutcome::Loaded { entries: count })
                }
            },
        };

        let mut state = self.state.lock();
        state.entries = entries;
        state.generated_at = generated_at;
        outcome
    }

    /// Empty memory and stats, and delete the persisted record if present
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.stats = CacheStats::default();
        state.generated_at = None;
        match std::fs::remove_file(&self.cache_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.cache_file.display(), e),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// When the on-disk record was last written, if known
    pub fn generated_at(&self) -> Option<String> {
        self.state.lock().generated_at.clone()
    }

    /// Number of files with a stored entry
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Items across all stored files
    pub fn total_items(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .map(|entry| entry.items.len())
            .sum()
    }
}
