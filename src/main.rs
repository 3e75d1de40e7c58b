//! fastcollect CLI entry point

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fastcollect::cache::{CollectionCache, LoadOutcome};
use fastcollect::cli::{
    CacheOperation, Cli, CollectArgs, Commands, DaemonOperation, ReloadArgs, RootArg,
};
use fastcollect::client::DaemonClient;
use fastcollect::config::{Config, StopTimings};
use fastcollect::lifecycle::{self, StartOutcome};
use fastcollect::paths::{cache_dir_for, canonical_root, resolve_root};
use fastcollect::schema::{ItemKind, TestItem};
use fastcollect::session::{CollectionSession, SessionMode};
use fastcollect::socket_server::{serve, RunOutcome, ServerOptions};
use fastcollect::{FastCollectError, FilterSpec};

/// How long `daemon start` waits for the new daemon to answer
const START_DEADLINE: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli) {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_logging(cli: &Cli) {
    let foreground_daemon = matches!(
        cli.command,
        Commands::Daemon(ref args) if matches!(args.operation, DaemonOperation::Run(_))
    );
    let default = if cli.verbose {
        "fastcollect=debug"
    } else if foreground_daemon {
        "fastcollect=info"
    } else {
        "fastcollect=warn"
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn run(cli: Cli) -> fastcollect::Result<String> {
    match cli.command {
        Commands::Collect(args) => run_collect(&args),
        Commands::Daemon(args) => match args.operation {
            DaemonOperation::Start(root) => run_daemon_start(&root),
            DaemonOperation::Run(root) => run_daemon_foreground(&root),
            DaemonOperation::Stop(root) => run_daemon_stop(&root),
            DaemonOperation::Status(root) => run_daemon_status(&root),
            DaemonOperation::Health(root) => run_daemon_health(&root),
        },
        Commands::Reload(args) => run_reload(&args),
        Commands::Cache(args) => match args.operation {
            CacheOperation::Clear(root) => run_cache_clear(&root),
            CacheOperation::Stats(root) => run_cache_stats(&root),
        },
    }
}

fn load(root: &RootArg) -> fastcollect::Result<(PathBuf, Config)> {
    let root = resolve_root(root.root.as_deref())?;
    let config = Config::load(&root)?;
    Ok((root, config))
}

fn client_for(root: &Path, config: &Config) -> fastcollect::Result<DaemonClient> {
    Ok(DaemonClient::with_config(
        lifecycle::socket_path(root),
        config.client.clone(),
    )?)
}

// ============================================
// collect
// ============================================

fn run_collect(args: &CollectArgs) -> fastcollect::Result<String> {
    let (root, config) = load(&RootArg {
        root: args.root.clone(),
    })?;
    let filters = FilterSpec::new(args.keyword.clone(), args.marker.clone());
    let mode = if args.no_daemon {
        SessionMode::InProcess
    } else {
        SessionMode::Auto
    };

    let session = CollectionSession::resolve(&root, &filters, &config, mode)?;
    for (file, error) in session.errors() {
        tracing::warn!("{}: {}", file, error);
    }
    eprintln!(
        "{} tests in {} files via {:?} ({})",
        session.item_count(),
        session.items().len(),
        session.source(),
        session.cache_stats()
    );

    let mut out = String::new();
    if args.json {
        let json = if args.files_only {
            serde_json::to_string_pretty(&session.files_to_visit())
        } else {
            serde_json::to_string_pretty(session.items())
        }
        .map_err(|e| FastCollectError::Daemon {
            message: format!("JSON serialization failed: {}", e),
        })?;
        let _ = writeln!(out, "{}", json);
    } else if args.files_only {
        for file in session.files_to_visit() {
            let _ = writeln!(out, "{}", relative(&root, &file));
        }
    } else {
        for item in session.all_items() {
            if let Some(id) = node_id(&root, item) {
                let _ = writeln!(out, "{}", id);
            }
        }
    }
    Ok(out)
}

fn relative(root: &Path, file: &str) -> String {
    Path::new(file)
        .strip_prefix(root)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| file.to_string())
}

/// `path::Class::test` style identifier; classes themselves are not listed
fn node_id(root: &Path, item: &TestItem) -> Option<String> {
    let path = relative(root, &item.file_path);
    match &item.kind {
        ItemKind::Function => Some(format!("{}::{}", path, item.name)),
        ItemKind::Method { class } => Some(format!("{}::{}::{}", path, class, item.name)),
        ItemKind::Class => None,
    }
}

// ============================================
// daemon
// ============================================

fn run_daemon_start(root: &RootArg) -> fastcollect::Result<String> {
    let (root, config) = load(root)?;
    let socket = lifecycle::socket_path(&root);
    let exe = std::env::current_exe()?;
    let args: Vec<OsString> = vec!["daemon".into(), "run".into(), root.clone().into_os_string()];

    match lifecycle::start_daemon(&socket, &exe, &args, &config.client, START_DEADLINE)? {
        StartOutcome::AlreadyRunning => Ok(format!("Daemon already running on {}\n", socket.display())),
        StartOutcome::Started { pid } => Ok(format!(
            "Daemon started (pid {}) on {}\n",
            pid,
            socket.display()
        )),
    }
}

fn run_daemon_foreground(root: &RootArg) -> fastcollect::Result<String> {
    let (root, config) = load(root)?;
    let options = ServerOptions::for_root(&root, None, &config);

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(serve(options))? {
        RunOutcome::Stopped => Ok(String::new()),
        RunOutcome::PeerAlreadyRunning => Ok("Daemon already running\n".to_string()),
    }
}

fn run_daemon_stop(root: &RootArg) -> fastcollect::Result<String> {
    let (root, config) = load(root)?;
    let socket = lifecycle::socket_path(&root);

    if lifecycle::stop_daemon_with(&socket, &config.client, &StopTimings::default()) {
        Ok("Daemon stopped\n".to_string())
    } else {
        Ok("No daemon running\n".to_string())
    }
}

fn run_daemon_status(root: &RootArg) -> fastcollect::Result<String> {
    let (root, config) = load(root)?;
    let status = client_for(&root, &config)?.get_status()?;

    let mut out = String::new();
    let _ = writeln!(out, "Status:          {:?}", status.status);
    let _ = writeln!(out, "PID:             {}", status.pid);
    let _ = writeln!(out, "Uptime:          {:.1}s", status.uptime);
    let _ = writeln!(out, "Cached files:    {}", status.cached_modules);
    let _ = writeln!(out, "Requests served: {}", status.requests_served);
    let _ = writeln!(out, "Root:            {}", status.root_path.display());
    let _ = writeln!(out, "Socket:          {}", status.socket_path.display());
    let _ = writeln!(out, "Cache:           {}", status.cache_stats);
    Ok(out)
}

fn run_daemon_health(root: &RootArg) -> fastcollect::Result<String> {
    let (root, config) = load(root)?;
    let health = client_for(&root, &config)?.get_health()?;

    let mut out = format!("{:?}\n", health.status);
    for (check, ok) in &health.checks {
        let _ = writeln!(out, "  {:<20} {}", check, if *ok { "ok" } else { "FAILED" });
    }
    Ok(out)
}

// ============================================
// reload
// ============================================

fn run_reload(args: &ReloadArgs) -> fastcollect::Result<String> {
    let (root, config) = load(&RootArg {
        root: args.root.clone(),
    })?;
    let files: Vec<PathBuf> = args.files.iter().map(|f| canonical_root(f)).collect();
    let response = client_for(&root, &config)?.reload(&files)?;

    let mut out = format!(
        "Reloaded {} files in {:.3}s\n",
        response.modules_reloaded, response.reload_time
    );
    for (file, error) in &response.errors {
        let _ = writeln!(out, "  {}: {}", file, error);
    }
    Ok(out)
}

// ============================================
// cache
// ============================================

fn run_cache_clear(root: &RootArg) -> fastcollect::Result<String> {
    let (root, config) = load(root)?;
    let cache = CollectionCache::new(cache_dir_for(&root, &config.cache));
    cache.clear();
    Ok(format!("Cleared cache at {}\n", cache.cache_dir().display()))
}

fn run_cache_stats(root: &RootArg) -> fastcollect::Result<String> {
    let (root, config) = load(root)?;
    let (cache, outcome) = CollectionCache::open(
        cache_dir_for(&root, &config.cache),
        config.cache.mtime_tolerance_secs,
    );

    let state = match outcome {
        LoadOutcome::Loaded { .. } => "ok".to_string(),
        LoadOutcome::Missing => "no cache file".to_string(),
        LoadOutcome::VersionMismatch { found } => format!("ignored (version {})", found),
        LoadOutcome::Corrupt { reason } => format!("ignored ({})", reason),
    };
    let size = std::fs::metadata(cache.cache_file())
        .map(|m| m.len())
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "Cache file: {}", cache.cache_file().display());
    let _ = writeln!(out, "State:      {}", state);
    let _ = writeln!(out, "Files:      {}", cache.len());
    let _ = writeln!(out, "Tests:      {}", cache.total_items());
    let _ = writeln!(out, "Size:       {} bytes", size);
    if let Some(written) = cache.generated_at() {
        let _ = writeln!(out, "Written:    {}", written);
    }
    Ok(out)
}
