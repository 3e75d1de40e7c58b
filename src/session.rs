//! Per-invocation collection session
//!
//! A session is resolved once per run: ask the project's daemon when one is
//! reachable, otherwise collect in-process against the on-disk cache. The
//! result answers "which files are worth visiting" for the rest of the run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::cache::{CacheStats, CollectionCache, LoadOutcome};
use crate::client::DaemonClient;
use crate::collector::collect_incremental;
use crate::config::Config;
use crate::error::Result;
use crate::filter::{filter_collected_data, FilterSpec, TestFilter};
use crate::lifecycle::socket_path;
use crate::parsing::PythonTestSource;
use crate::paths::{cache_dir_for, canonical_root};
use crate::schema::{CollectedData, TestItem};

/// Where a session's results came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Daemon,
    InProcess,
}

/// Whether a session may use the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Daemon when reachable, in-process otherwise
    Auto,
    /// Never talk to a daemon
    InProcess,
}

#[derive(Debug, Clone)]
pub struct CollectionSession {
    root: PathBuf,
    items: CollectedData,
    errors: BTreeMap<String, String>,
    cache_stats: CacheStats,
    source: SessionSource,
}

impl CollectionSession {
    /// Collect (and filter) every test under `root`.
    ///
    /// An invalid filter expression fails before any collection work.
    pub fn resolve(root: &Path, filters: &FilterSpec, config: &Config, mode: SessionMode) -> Result<Self> {
        let root = canonical_root(root);
        let filter = TestFilter::from_spec(filters)?;

        if mode == SessionMode::Auto {
            if let Some(session) = Self::from_daemon(&root, filters, config) {
                return Ok(session);
            }
        }
        Self::in_process(root, &filter, config)
    }

    fn from_daemon(root: &Path, filters: &FilterSpec, config: &Config) -> Option<Self> {
        let socket = socket_path(root);
        if !socket.exists() {
            return None;
        }
        let client = DaemonClient::with_config(&socket, config.client.clone()).ok()?;
        if !client.is_daemon_running() {
            tracing::debug!("Daemon at {} not answering", socket.display());
            return None;
        }

        match client.collect(root, filters) {
            Ok(response) => {
                tracing::debug!(
                    "Daemon returned {} files in {:.3}s",
                    response.files,
                    response.collection_time
                );
                Some(Self {
                    root: root.to_path_buf(),
                    items: response.items,
                    errors: response.errors,
                    cache_stats: response.cache_stats,
                    source: SessionSource::Daemon,
                })
            }
            Err(e) => {
                tracing::warn!("Daemon collect failed, collecting in-process: {}", e);
                None
            }
        }
    }

    fn in_process(root: PathBuf, filter: &TestFilter, config: &Config) -> Result<Self> {
        let (cache, loaded) = CollectionCache::open(
            cache_dir_for(&root, &config.cache),
            config.cache.mtime_tolerance_secs,
        );
        match loaded {
            LoadOutcome::VersionMismatch { found } => {
                tracing::warn!("Ignoring cache written by version {}", found)
            }
            LoadOutcome::Corrupt { reason } => tracing::warn!("Ignoring unreadable cache: {}", reason),
            LoadOutcome::Loaded { .. } | LoadOutcome::Missing => {}
        }

        let source = PythonTestSource::new()?;
        let outcome = collect_incremental(&source, &cache, &root)?;
        if outcome.changed {
            cache.persist();
        }

        let items = if filter.is_empty() {
            outcome.items
        } else {
            filter_collected_data(&outcome.items, filter)
        };

        Ok(Self {
            root,
            items,
            errors: outcome.errors,
            cache_stats: outcome.stats,
            source: SessionSource::InProcess,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> SessionSource {
        self.source
    }

    /// Matching items per file
    pub fn items(&self) -> &CollectedData {
        &self.items
    }

    /// Every matching item, in file order
    pub fn all_items(&self) -> impl Iterator<Item = &TestItem> {
        self.items.values().flatten()
    }

    pub fn item_count(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats
    }

    /// Files holding at least one matching item (or any file when unfiltered)
    pub fn files_to_visit(&self) -> BTreeSet<String> {
        self.items.keys().cloned().collect()
    }

    pub fn should_visit(&self, path: &Path) -> bool {
        let key = canonical_root(path);
        self.items.contains_key(key.to_string_lossy().as_ref())
    }
}
