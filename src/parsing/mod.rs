//! Test discovery and parsing.
//!
//! The daemon and the in-process collector only ever talk to a
//! [`TestSource`]: something that can list candidate test files with their
//! mtimes and turn one file into [`TestItem`]s. [`PythonTestSource`] is the
//! default implementation, walking the tree with `ignore` and parsing with
//! tree-sitter-python.
//!
//! # Example
//!
//! ```ignore
//! use fastcollect::parsing::{PythonTestSource, TestSource};
//! use std::path::Path;
//!
//! let source = PythonTestSource::new()?;
//! for file in source.discover(Path::new("."))? {
//!     let items = source.parse(&file.path)?;
//!     println!("{}: {} tests", file.path.display(), items.len());
//! }
//! ```

mod python;

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;

use crate::error::{FastCollectError, Result};
use crate::schema::{file_mtime, DiscoveredFile, TestItem};

pub use python::extract_tests;

/// File names collected as test modules
pub const TEST_FILE_PATTERNS: &[&str] = &["test_*.py", "*_test.py"];

/// Directory names never descended into
pub const IGNORED_DIR_PATTERNS: &[&str] = &[
    ".git",
    "__pycache__",
    ".tox",
    ".venv",
    "venv",
    ".eggs",
    "*.egg-info",
];

/// A source of test metadata for a project tree
pub trait TestSource: Send + Sync {
    /// List candidate test files under `root`, with their current mtimes
    fn discover(&self, root: &Path) -> Result<Vec<DiscoveredFile>>;

    /// Extract the tests defined in one file
    fn parse(&self, path: &Path) -> Result<Vec<TestItem>>;
}

/// Pytest-style Python test source
#[derive(Debug, Clone)]
pub struct PythonTestSource {
    test_files: GlobSet,
    ignored_dirs: GlobSet,
}

impl PythonTestSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            test_files: build_globset(TEST_FILE_PATTERNS)?,
            ignored_dirs: build_globset(IGNORED_DIR_PATTERNS)?,
        })
    }

    /// Does this file name look like a test module?
    pub fn is_test_file(&self, file_name: &str) -> bool {
        self.test_files.is_match(file_name)
    }

    /// Is this directory name skipped during discovery?
    pub fn is_ignored_dir(&self, dir_name: &str) -> bool {
        self.ignored_dirs.is_match(dir_name)
    }
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| FastCollectError::Config {
            message: format!("Invalid glob '{}': {}", pattern, e),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| FastCollectError::Config {
        message: format!("Failed to build glob set: {}", e),
    })
}

impl TestSource for PythonTestSource {
    fn discover(&self, root: &Path) -> Result<Vec<DiscoveredFile>> {
        if !root.is_dir() {
            return Err(FastCollectError::FileNotFound {
                path: root.display().to_string(),
            });
        }

        let ignored = self.ignored_dirs.clone();
        let mut builder = WalkBuilder::new(root);

        // Collect like pytest does: hidden dirs and .gitignore'd files count
        builder.standard_filters(false);
        builder.follow_links(false);
        builder.filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !(is_dir && entry.depth() > 0 && ignored.is_match(entry.file_name()))
        });

        let mut files = Vec::new();
        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if !self.test_files.is_match(entry.file_name()) {
                continue;
            }

            match file_mtime(entry.path()) {
                Ok(mtime) => files.push(DiscoveredFile {
                    path: entry.into_path(),
                    mtime,
                }),
                Err(e) => tracing::debug!("Skipping {}: {}", entry.path().display(), e),
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!("Discovered {} test files under {}", files.len(), root.display());
        Ok(files)
    }

    fn parse(&self, path: &Path) -> Result<Vec<TestItem>> {
        let source = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FastCollectError::FileNotFound {
                path: path.display().to_string(),
            },
            _ => FastCollectError::ParseFailure {
                message: format!("{}: {}", path.display(), e),
            },
        })?;
        extract_tests(&source, &path.to_string_lossy())
    }
}

/// Parse many files in parallel, keeping each file's own outcome
pub fn parse_files(
    source: &dyn TestSource,
    paths: &[PathBuf],
) -> Vec<(PathBuf, Result<Vec<TestItem>>)> {
    paths
        .par_iter()
        .map(|path| (path.clone(), source.parse(path)))
        .collect()
}
