//! Test item schema shared by the parser, the cache, the filter and the wire protocol
//!
//! Items serialize as flat JSON mappings:
//!
//! ```json
//! {"name": "test_login", "type": "Method", "class": "TestAuth",
//!  "markers": ["slow"], "file_path": "/repo/tests/test_auth.py", "line": 12}
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What kind of test object an item describes.
///
/// A method always knows its enclosing class, so the class name lives on the
/// variant rather than as a loose optional field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ItemKind {
    Function,
    Class,
    Method {
        #[serde(rename = "class")]
        class: String,
    },
}

/// A single collected test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestItem {
    /// Test name; empty when upstream metadata omitted it
    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub kind: ItemKind,

    /// Declared markers (`@pytest.mark.<name>`), duplicates tolerated
    #[serde(default)]
    pub markers: Vec<String>,

    #[serde(default)]
    pub file_path: String,

    /// 1-based line of the definition
    #[serde(default)]
    pub line: usize,
}

impl TestItem {
    pub fn function(name: impl Into<String>, file_path: impl Into<String>, line: usize) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Function,
            markers: Vec::new(),
            file_path: file_path.into(),
            line,
        }
    }

    pub fn class(name: impl Into<String>, file_path: impl Into<String>, line: usize) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Class,
            markers: Vec::new(),
            file_path: file_path.into(),
            line,
        }
    }

    pub fn method(
        name: impl Into<String>,
        class: impl Into<String>,
        file_path: impl Into<String>,
        line: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Method {
                class: class.into(),
            },
            markers: Vec::new(),
            file_path: file_path.into(),
            line,
        }
    }

    /// Builder-style marker attachment
    pub fn with_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.markers.extend(markers.into_iter().map(Into::into));
        self
    }

    /// Name of the enclosing class, if any
    pub fn enclosing_class(&self) -> Option<&str> {
        match &self.kind {
            ItemKind::Method { class } => Some(class),
            _ => None,
        }
    }
}

/// Parser output for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Modification time in seconds since the Unix epoch
    pub mtime: f64,
    pub items: Vec<TestItem>,
}

/// A file found during discovery, before parsing
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub mtime: f64,
}

/// Fresh parser report: file path -> metadata
pub type FreshMetadata = BTreeMap<String, FileMetadata>;

/// Collected tests: file path -> items
pub type CollectedData = BTreeMap<String, Vec<TestItem>>;

/// Read a file's modification time as float seconds
pub fn file_mtime(path: &std::path::Path) -> std::io::Result<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(secs)
}
