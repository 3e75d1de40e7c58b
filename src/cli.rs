//! CLI argument definitions using clap with subcommand architecture

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Incremental test collection with a warm background cache
#[derive(Parser, Debug)]
#[command(name = "fastcollect")]
#[command(about = "Fast, cached discovery of Python tests")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Collect tests, optionally filtered
    #[command(visible_alias = "c")]
    Collect(CollectArgs),

    /// Manage the background daemon
    Daemon(DaemonArgs),

    /// Force the daemon to re-parse files
    Reload(ReloadArgs),

    /// Manage the on-disk cache
    Cache(CacheArgs),
}

// ============================================
// Collect
// ============================================

#[derive(Args, Debug)]
pub struct CollectArgs {
    /// Project root (default: current directory)
    pub root: Option<PathBuf>,

    /// Keyword expression, e.g. "login and not slow"
    #[arg(short = 'k', long = "keyword")]
    pub keyword: Option<String>,

    /// Marker expression, e.g. "smoke or fast"
    #[arg(short = 'm', long = "marker")]
    pub marker: Option<String>,

    /// Print only the files worth visiting
    #[arg(long)]
    pub files_only: bool,

    /// Collect in-process even if a daemon is running
    #[arg(long, env = "FASTCOLLECT_NO_DAEMON")]
    pub no_daemon: bool,

    /// Emit JSON instead of text
    #[arg(long)]
    pub json: bool,
}

// ============================================
// Daemon
// ============================================

#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub operation: DaemonOperation,
}

#[derive(Subcommand, Debug)]
pub enum DaemonOperation {
    /// Start a background daemon (no-op if one is healthy)
    Start(RootArg),

    /// Run the daemon in the foreground
    Run(RootArg),

    /// Stop the daemon, escalating to signals if needed
    Stop(RootArg),

    /// Show daemon status
    Status(RootArg),

    /// Check daemon health
    Health(RootArg),
}

#[derive(Args, Debug, Clone)]
pub struct RootArg {
    /// Project root (default: current directory)
    pub root: Option<PathBuf>,
}

// ============================================
// Reload
// ============================================

#[derive(Args, Debug)]
pub struct ReloadArgs {
    /// Files to re-parse
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Project root (default: current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,
}

// ============================================
// Cache
// ============================================

#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Cache operation to perform
    #[command(subcommand)]
    pub operation: CacheOperation,
}

#[derive(Subcommand, Debug)]
pub enum CacheOperation {
    /// Delete the cache for a root
    Clear(RootArg),

    /// Show what the cache holds
    Stats(RootArg),
}
