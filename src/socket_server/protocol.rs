//! Socket protocol message types
//!
//! One JSON object per direction, one request per connection. The sender
//! half-closes its write side to mark the end of a message.
//!
//! ```json
//! // Client -> Server
//! {"command": "collect", "root_path": "/repo", "filters": {"keyword": "login"}}
//! {"command": "reload", "file_paths": ["/repo/tests/test_auth.py"]}
//! {"command": "status"}
//!
//! // Server -> Client
//! {"status": "success", "collection_time": 0.012, "items": {...}, ...}
//! {"status": "error", "error": "Unknown command: frobnicate"}
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::filter::FilterSpec;
use crate::schema::CollectedData;

/// Names of the commands a daemon answers
pub const COMMANDS: &[&str] = &["collect", "reload", "status", "health", "stop"];

/// Client-to-server request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Collect tests under a root, optionally filtered
    Collect {
        root_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<FilterSpec>,
    },
    /// Force a re-parse of specific files
    Reload { file_paths: Vec<PathBuf> },
    /// Liveness details
    Status,
    /// Lightweight liveness check
    Health,
    /// Drain and shut down
    Stop,
}

impl Request {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Collect { .. } => "collect",
            Self::Reload { .. } => "reload",
            Self::Status => "status",
            Self::Health => "health",
            Self::Stop => "stop",
        }
    }

    /// Decode a raw request body, producing the error text sent back on failure
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| format!("Invalid JSON: {}", e))?;

        let Some(object) = value.as_object() else {
            return Err("Request must be a JSON object".to_string());
        };
        let command = match object.get("command") {
            None => return Err("Request missing 'command' field".to_string()),
            Some(serde_json::Value::String(command)) => command.clone(),
            Some(_) => return Err("Command must be a string".to_string()),
        };
        if !COMMANDS.contains(&command.as_str()) {
            return Err(format!("Unknown command: {}", command));
        }

        serde_json::from_value(value).map_err(|e| format!("Invalid '{}' request: {}", command, e))
    }
}

/// Value of the `status` field in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Running,
    Healthy,
    Degraded,
    Stopping,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectResponse {
    pub status: ResponseStatus,
    /// Seconds spent servicing the request
    pub collection_time: f64,
    pub items: CollectedData,
    /// Number of files in `items`
    #[serde(default)]
    pub files: usize,
    /// Per-file parser failures
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
    #[serde(default)]
    pub cache_stats: CacheStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub status: ResponseStatus,
    pub modules_reloaded: usize,
    pub reload_time: f64,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ResponseStatus,
    pub pid: u32,
    /// Seconds since the daemon started
    pub uptime: f64,
    /// Files with a cache entry
    pub cached_modules: usize,
    #[serde(default)]
    pub root_path: PathBuf,
    #[serde(default)]
    pub socket_path: PathBuf,
    #[serde(default)]
    pub cache_stats: CacheStats,
    #[serde(default)]
    pub requests_served: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` when every check passed, `degraded` otherwise
    pub status: ResponseStatus,
    pub checks: BTreeMap<String, bool>,
    #[serde(default)]
    pub uptime: f64,
}

impl HealthResponse {
    pub fn from_checks(checks: BTreeMap<String, bool>, uptime: f64) -> Self {
        let status = if checks.values().all(|ok| *ok) {
            ResponseStatus::Healthy
        } else {
            ResponseStatus::Degraded
        };
        Self {
            status,
            checks,
            uptime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: ResponseStatus,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: error.into(),
        }
    }
}
