//! fastcollect Daemon Binary
//!
//! Runs the collection daemon for one project root in the foreground.
//!
//! # Usage
//!
//! ```bash
//! fastcollect-daemon --root /path/to/project
//! fastcollect-daemon --root . --socket /tmp/custom.sock
//! ```

use std::path::PathBuf;

use clap::Parser;

use fastcollect::config::Config;
use fastcollect::paths::resolve_root;
use fastcollect::socket_server::{serve, RunOutcome, ServerOptions};

/// fastcollect collection daemon
#[derive(Parser, Debug)]
#[command(name = "fastcollect-daemon")]
#[command(about = "Warm test-collection cache served over a Unix socket")]
struct Args {
    /// Project root to serve
    #[arg(short, long, env = "FASTCOLLECT_ROOT")]
    root: Option<PathBuf>,

    /// Socket path (default: derived from the root)
    #[arg(long, env = "FASTCOLLECT_SOCKET")]
    socket: Option<PathBuf>,

    /// Maximum simultaneous connections
    #[arg(long)]
    max_connections: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fastcollect=info".parse()?)
                .add_directive("fastcollect_daemon=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let root = resolve_root(args.root.as_deref())?;
    let mut config = Config::load(&root)?;
    if let Some(max) = args.max_connections {
        config.daemon.max_connections = max;
    }

    let options = ServerOptions::for_root(&root, args.socket, &config);
    tracing::info!("Starting daemon for {}", options.root.display());

    match serve(options).await? {
        RunOutcome::Stopped => tracing::info!("Daemon exited cleanly"),
        RunOutcome::PeerAlreadyRunning => tracing::info!("Daemon already running, nothing to do"),
    }
    Ok(())
}
