//! Project root resolution and fingerprinting
//!
//! The daemon socket and the on-disk cache are both addressed by a short
//! fingerprint of the canonical project root, so every invocation against
//! the same tree (spelled relatively or absolutely) lands on the same files.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::{CacheConfig, SOCKET_PATH_HASH_LENGTH};
use crate::fs_utils::get_cache_base_dir;
use crate::{FastCollectError, Result};

/// Resolve a root path, defaulting to the current working directory.
pub fn resolve_root(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(canonical_root(p)),
        None => std::env::current_dir()
            .map(|cwd| canonical_root(&cwd))
            .map_err(|e| FastCollectError::FileNotFound {
                path: format!("current directory: {}", e),
            }),
    }
}

/// Canonicalize a root.
///
/// Existing paths resolve symlinks and `..`; paths that do not exist yet are
/// made absolute against the current directory so hashing stays stable.
pub fn canonical_root(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(canonical) => canonical,
        Err(_) => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// Short hex fingerprint of the canonical root
pub fn root_hash(root: &Path) -> String {
    let canonical = canonical_root(root);
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..SOCKET_PATH_HASH_LENGTH].to_string()
}

/// Cache directory for a root: the configured one, or a per-root dir under the user cache
pub fn cache_dir_for(root: &Path, config: &CacheConfig) -> PathBuf {
    match &config.dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => canonical_root(root).join(dir),
        None => get_cache_base_dir().join(root_hash(root)),
    }
}
