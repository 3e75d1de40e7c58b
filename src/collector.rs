//! Cache-aware collection
//!
//! Discovery is cheap (a directory walk plus one `stat` per file), parsing
//! is not. [`collect_incremental`] only parses files whose cached mtime is
//! stale, then runs the full report through [`CollectionCache::merge`] so
//! hit/miss accounting and deleted-file cleanup stay in one place.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::cache::{CacheStats, CollectionCache};
use crate::error::Result;
use crate::parsing::{parse_files, TestSource};
use crate::schema::{file_mtime, CollectedData, FileMetadata, FreshMetadata};

/// Result of one incremental collection pass
#[derive(Debug, Clone, Default)]
pub struct CollectOutcome {
    /// Items per file
    pub items: CollectedData,
    /// Whether the cache was modified and should be persisted
    pub changed: bool,
    /// Per-file failures; those files are left out of `items`
    pub errors: BTreeMap<String, String>,
    /// Cache counters for this pass
    pub stats: CacheStats,
}

/// Result of a forced re-parse
#[derive(Debug, Clone, Default)]
pub struct ReloadOutcome {
    pub reloaded: usize,
    pub errors: BTreeMap<String, String>,
}

/// Collect every test under `root`, re-parsing only what changed.
pub fn collect_incremental(
    source: &dyn TestSource,
    cache: &CollectionCache,
    root: &Path,
) -> Result<CollectOutcome> {
    let discovered = source.discover(root)?;
    let stale = cache.stale_files(&discovered);
    tracing::debug!(
        "{} of {} files need parsing under {}",
        stale.len(),
        discovered.len(),
        root.display()
    );

    let stale_set: HashSet<&PathBuf> = stale.iter().collect();
    let mut parsed: BTreeMap<PathBuf, _> = parse_files(source, &stale).into_iter().collect();

    let mut fresh = FreshMetadata::new();
    let mut errors = BTreeMap::new();

    for file in &discovered {
        let key = file.path.to_string_lossy().into_owned();

        if stale_set.contains(&file.path) {
            match parsed.remove(&file.path) {
                Some(Ok(items)) => {
                    fresh.insert(key, FileMetadata { mtime: file.mtime, items });
                }
                Some(Err(e)) => {
                    tracing::debug!("Failed to parse {}: {}", key, e);
                    errors.insert(key, e.to_string());
                }
                None => {}
            }
        } else if let Some(entry) = cache.peek(&key) {
            fresh.insert(
                key,
                FileMetadata {
                    mtime: file.mtime,
                    items: entry.items,
                },
            );
        }
    }

    let merge = cache.merge(fresh);
    Ok(CollectOutcome {
        items: merge.merged,
        changed: merge.changed,
        errors,
        stats: merge.stats,
    })
}

/// Re-parse the given files regardless of their cached mtime.
pub fn reload_files(
    source: &dyn TestSource,
    cache: &CollectionCache,
    paths: &[PathBuf],
) -> ReloadOutcome {
    let mut outcome = ReloadOutcome::default();

    // Stat before reading: an edit racing the parse leaves a newer mtime on
    // disk than the one stored, so the next collect re-parses it.
    let mut mtimes = BTreeMap::new();
    let mut readable = Vec::with_capacity(paths.len());
    for path in paths {
        let key = path.to_string_lossy().into_owned();
        match file_mtime(path) {
            Ok(mtime) => {
                mtimes.insert(path.clone(), mtime);
                readable.push(path.clone());
            }
            Err(e) => {
                cache.remove(&key);
                outcome.errors.insert(key, e.to_string());
            }
        }
    }

    for (path, result) in parse_files(source, &readable) {
        let key = path.to_string_lossy().into_owned();
        match (result, mtimes.get(&path)) {
            (Ok(items), Some(&mtime)) => {
                cache.put(&key, mtime, items);
                outcome.reloaded += 1;
            }
            (Err(e), _) => {
                cache.remove(&key);
                outcome.errors.insert(key, e.to_string());
            }
            (Ok(_), None) => {}
        }
    }

    outcome
}
