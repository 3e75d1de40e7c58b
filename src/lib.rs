//! fastcollect: incremental Python test collection with a warm daemon
//!
//! Repeated "which tests exist, and which match this filter" questions are
//! answered from an mtime-validated cache. A per-project daemon keeps that
//! cache hot and serves it over a Unix socket, so short-lived invocations
//! skip rediscovery entirely; without a daemon the same cache is used
//! in-process.
//!
//! # Components
//!
//! - [`filter`]: keyword and marker boolean expressions
//! - [`cache`]: mtime-keyed incremental cache with JSON persistence
//! - [`socket_server`]: the daemon (`collect`, `reload`, `status`, `health`, `stop`)
//! - [`client`]: blocking client with retry and backoff
//! - [`lifecycle`]: socket/PID paths, liveness, stop escalation
//!
//! # Example
//!
//! ```ignore
//! use fastcollect::{CollectionSession, Config, FilterSpec, SessionMode};
//! use std::path::Path;
//!
//! let root = Path::new(".");
//! let filters = FilterSpec::new(Some("login".into()), Some("not slow".into()));
//! let session = CollectionSession::resolve(root, &filters, &Config::load(root)?, SessionMode::Auto)?;
//!
//! for file in session.files_to_visit() {
//!     println!("{}", file);
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod filter;
pub mod fs_utils;
pub mod lifecycle;
pub mod parsing;
pub mod paths;
pub mod schema;
pub mod session;
pub mod socket_server;

// Re-export commonly used types
pub use cache::{CacheStats, CollectionCache, LoadOutcome, MergeOutcome};
pub use cli::Cli;
pub use client::{ClientError, DaemonClient, RetryPolicy, Transport, UnixTransport};
pub use collector::{collect_incremental, reload_files, CollectOutcome};
pub use config::Config;
pub use error::{FastCollectError, Result};
pub use filter::{files_with_matching_tests, filter_collected_data, FilterSpec, TestFilter};
pub use lifecycle::{is_process_running, read_daemon_pid, socket_path, stop_daemon, ProcessHandle};
pub use parsing::{PythonTestSource, TestSource};
pub use schema::{CollectedData, FileMetadata, FreshMetadata, ItemKind, TestItem};
pub use session::{CollectionSession, SessionMode, SessionSource};
