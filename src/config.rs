//! Tunables for the daemon, the client and the cache
//!
//! Defaults live here; a project may override any of them in a
//! `.fastcollect.toml` file at its root:
//!
//! ```toml
//! [daemon]
//! max_connections = 4
//!
//! [client]
//! max_retries = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FastCollectError, Result};

/// Name of the optional per-project configuration file
pub const CONFIG_FILE_NAME: &str = ".fastcollect.toml";

/// Version tag written into the persisted cache file
pub const CACHE_VERSION: &str = "1.0";

/// Length of the root fingerprint used in socket and cache paths
pub const SOCKET_PATH_HASH_LENGTH: usize = 8;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Load `<root>/.fastcollect.toml` over the defaults.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        toml::from_str(&text).map_err(|e| FastCollectError::Config {
            message: format!("{}: {}", path.display(), e),
        })
    }
}

/// Daemon server settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Largest request body accepted, in bytes (default: 10 MiB)
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Connections handled at once; extra connections wait (default: 10)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Accept wait between housekeeping passes (default: 1s)
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: f64,

    /// Per-request processing limit (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,

    /// Interval between self health checks (default: 60s)
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
            max_connections: default_max_connections(),
            accept_timeout_secs: default_accept_timeout(),
            request_timeout_secs: default_request_timeout(),
            health_check_interval_secs: default_health_interval(),
        }
    }
}

impl DaemonConfig {
    pub fn accept_timeout(&self) -> Duration {
        secs(self.accept_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        secs(self.health_check_interval_secs)
    }
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Default round-trip timeout (default: 5s)
    #[serde(default = "default_request_timeout_client")]
    pub request_timeout_secs: f64,

    /// Extra attempts after a transient failure (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay, doubled on every retry (default: 0.1s)
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base_secs: f64,

    /// Timeout for the lightweight health check (default: 1s)
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_secs: f64,

    /// Retries for the health check (default: 1)
    #[serde(default = "default_health_retries")]
    pub health_check_retries: u32,

    /// Timeout for the stop command (default: 2s)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_client(),
            max_retries: default_max_retries(),
            retry_backoff_base_secs: default_backoff_base(),
            health_check_timeout_secs: default_health_timeout(),
            health_check_retries: default_health_retries(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        secs(self.retry_backoff_base_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        secs(self.health_check_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        secs(self.stop_timeout_secs)
    }
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Explicit cache directory; defaults to the per-project user cache dir
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Allowed mtime drift before an entry counts as stale (default: 0.01s)
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance_secs: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            mtime_tolerance_secs: default_mtime_tolerance(),
        }
    }
}

/// Pauses used while stopping a daemon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopTimings {
    /// Longest wait for the daemon to release its socket after a socket stop
    pub drain_timeout: Duration,
    /// Wait after the graceful signal before rechecking
    pub after_sigterm: Duration,
    /// Wait after the forceful signal
    pub after_sigkill: Duration,
}

impl Default for StopTimings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            after_sigterm: Duration::from_millis(500),
            after_sigkill: Duration::from_millis(200),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

// Default value functions
fn default_max_request_size() -> usize {
    10 * 1024 * 1024
}
fn default_max_connections() -> usize {
    10
}
fn default_accept_timeout() -> f64 {
    1.0
}
fn default_request_timeout() -> f64 {
    30.0
}
fn default_health_interval() -> f64 {
    60.0
}
fn default_request_timeout_client() -> f64 {
    5.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> f64 {
    0.1
}
fn default_health_timeout() -> f64 {
    1.0
}
fn default_health_retries() -> u32 {
    1
}
fn default_stop_timeout() -> f64 {
    2.0
}
fn default_mtime_tolerance() -> f64 {
    0.01
}
