//! Filesystem helpers for the cache file

use std::io;
use std::path::{Path, PathBuf};

/// Write `contents` to `dst` through a sibling temp file and a rename, so a
/// concurrent reader sees either the old record or the new one.
pub fn atomic_write(dst: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = dst.as_os_str().to_owned();
    tmp.push(format!(".tmp.{}", std::process::id()));
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, dst).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

/// Base directory for per-project caches.
///
/// `$XDG_CACHE_HOME/fastcollect` (or the platform cache dir), falling back
/// to the system temp dir when no home directory is known.
pub fn get_cache_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fastcollect")
}
