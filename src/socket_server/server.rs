//! Unix socket daemon server
//!
//! Lifecycle: `Starting -> Serving -> Draining -> Stopped`.
//!
//! - **Starting**: bind the socket (taking over a stale one, or bowing out if
//!   a healthy peer already owns it), write the PID file, load the cache.
//! - **Serving**: accept with a bounded wait so housekeeping can run between
//!   connections; each connection carries exactly one request and is served
//!   by its own task, bounded by a semaphore.
//! - **Draining**: entered on `stop` or a termination signal. No new
//!   connections; in-flight ones finish, then the cache is persisted.
//! - **Stopped**: the PID file and then the socket file are unlinked, but
//!   only while the PID file still names this process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};

use crate::cache::{CollectionCache, LoadOutcome};
use crate::client::DaemonClient;
use crate::config::{ClientConfig, Config, DaemonConfig};
use crate::error::Result;
use crate::lifecycle::{
    pid_file_path, read_daemon_pid, save_daemon_pid, socket_path as default_socket_path,
};
use crate::parsing::{PythonTestSource, TestSource};
use crate::paths::{cache_dir_for, canonical_root};

use super::handlers::{error_json, handle_request, DaemonContext};
use super::protocol::Request;

/// Where the daemon is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// How a `run` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Served until stopped
    Stopped,
    /// Another healthy daemon already owns the socket
    PeerAlreadyRunning,
}

/// Everything needed to start a daemon for one root
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub root: PathBuf,
    pub socket_path: PathBuf,
    pub cache_dir: PathBuf,
    pub mtime_tolerance: f64,
    pub daemon: DaemonConfig,
}

impl ServerOptions {
    /// Options for `root` from its configuration; `socket_path` overrides the derived one
    pub fn for_root(root: &Path, socket_path: Option<PathBuf>, config: &Config) -> Self {
        let root = canonical_root(root);
        Self {
            socket_path: socket_path.unwrap_or_else(|| default_socket_path(&root)),
            cache_dir: cache_dir_for(&root, &config.cache),
            mtime_tolerance: config.cache.mtime_tolerance_secs,
            daemon: config.daemon.clone(),
            root,
        }
    }
}

/// Requests a graceful stop from outside the accept loop
#[derive(Clone)]
pub struct ShutdownHandle {
    context: Arc<DaemonContext>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.context.begin_draining();
    }
}

pub struct DaemonServer {
    options: ServerOptions,
    context: Arc<DaemonContext>,
    state_rx: watch::Receiver<ServerState>,
}

impl DaemonServer {
    pub fn new(options: ServerOptions, source: Arc<dyn TestSource>) -> Self {
        let (state_tx, state_rx) = watch::channel(ServerState::Starting);
        let cache =
            CollectionCache::new(options.cache_dir.clone()).with_tolerance(options.mtime_tolerance);

        let context = Arc::new(DaemonContext {
            root: canonical_root(&options.root),
            socket_path: options.socket_path.clone(),
            cache,
            source,
            started: Instant::now(),
            requests_served: AtomicU64::new(0),
            state: state_tx,
        });

        Self {
            options,
            context,
            state_rx,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state_rx.borrow()
    }

    /// Observe state transitions (used by tests and the binary)
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.context.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            context: Arc::clone(&self.context),
        }
    }

    /// Bind, serve until stopped, then drain and clean up.
    pub async fn run(self) -> Result<RunOutcome> {
        let socket_path = self.options.socket_path.clone();

        let Some(listener) = self.bind().await? else {
            tracing::info!(
                "A healthy daemon already serves {}, exiting",
                socket_path.display()
            );
            return Ok(RunOutcome::PeerAlreadyRunning);
        };

        save_daemon_pid(&socket_path, std::process::id())?;
        self.load_cache();

        if self.enter_serving() {
            tracing::info!(
                "Daemon serving {} on {} (pid {})",
                self.context.root.display(),
                socket_path.display(),
                std::process::id()
            );
        } else {
            tracing::info!("Stop requested during startup, not serving");
        }

        let max_connections = self.options.daemon.max_connections.max(1);
        let semaphore = Arc::new(Semaphore::new(max_connections));
        self.accept_loop(&listener, &semaphore).await;

        // Draining: stop accepting, wait for every in-flight connection
        drop(listener);
        let permits = u32::try_from(max_connections).unwrap_or(u32::MAX);
        let _all = semaphore.acquire_many(permits).await;

        if !self.context.cache.persist() {
            tracing::warn!("Cache was not persisted on shutdown");
        }
        release_socket(&socket_path);

        self.set_state(ServerState::Stopped);
        tracing::info!(
            "Daemon stopped after {} requests",
            self.context.requests_served.load(Ordering::Relaxed)
        );
        Ok(RunOutcome::Stopped)
    }

    fn set_state(&self, state: ServerState) {
        self.context.state.send_replace(state);
    }

    /// Starting -> Serving, unless a stop already moved us to Draining
    fn enter_serving(&self) -> bool {
        self.context.state.send_if_modified(|state| {
            if *state == ServerState::Starting {
                *state = ServerState::Serving;
                true
            } else {
                false
            }
        })
    }

    async fn bind(&self) -> Result<Option<UnixListener>> {
        let socket_path = &self.options.socket_path;
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match UnixListener::bind(socket_path) {
            Ok(listener) => Ok(Some(listener)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if peer_is_healthy(socket_path).await {
                    return Ok(None);
                }
                tracing::warn!("Removing stale socket {}", socket_path.display());
                std::fs::remove_file(socket_path)?;
                Ok(Some(UnixListener::bind(socket_path)?))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_cache(&self) {
        match self.context.cache.load() {
            LoadOutcome::Loaded { entries } => {
                tracing::info!("Loaded {} cached files", entries)
            }
            LoadOutcome::Missing => tracing::debug!("No cache file yet"),
            LoadOutcome::VersionMismatch { found } => {
                tracing::warn!("Ignoring cache written by version {}", found)
            }
            LoadOutcome::Corrupt { reason } => {
                tracing::warn!("Ignoring unreadable cache: {}", reason)
            }
        }
    }

    async fn accept_loop(&self, listener: &UnixListener, semaphore: &Arc<Semaphore>) {
        let accept_timeout = self.options.daemon.accept_timeout();
        let health_interval = self.options.daemon.health_check_interval();
        let limits = ConnectionLimits {
            max_request_size: self.options.daemon.max_request_size,
            request_timeout: self.options.daemon.request_timeout(),
        };
        let mut last_health_check = Instant::now();
        let mut state_rx = self.state_rx.clone();

        while *state_rx.borrow_and_update() == ServerState::Serving {
            tokio::select! {
                _ = state_rx.changed() => {}
                accepted = tokio::time::timeout(accept_timeout, listener.accept()) => match accepted {
                    Err(_) => {
                        if last_health_check.elapsed() >= health_interval {
                            log_health(&self.context);
                            last_health_check = Instant::now();
                        }
                    }
                    Ok(Err(e)) => tracing::warn!("Accept failed: {}", e),
                    Ok(Ok((stream, _))) => {
                        let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
                            break;
                        };
                        let context = Arc::clone(&self.context);
                        tokio::spawn(async move {
                            handle_connection(stream, context, limits).await;
                            drop(permit);
                        });
                    }
                }
            }
        }
    }
}

fn log_health(context: &DaemonContext) {
    let checks = context.health_checks();
    if checks.values().all(|ok| *ok) {
        tracing::debug!("Health check passed");
    } else {
        tracing::warn!("Health check degraded: {:?}", checks);
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    max_request_size: usize,
    request_timeout: Duration,
}

/// Serve one request on one connection
async fn handle_connection(stream: UnixStream, context: Arc<DaemonContext>, limits: ConnectionLimits) {
    let (reader, mut writer) = stream.into_split();

    let mut body = Vec::new();
    let limit = u64::try_from(limits.max_request_size)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let read = tokio::time::timeout(
        limits.request_timeout,
        reader.take(limit).read_to_end(&mut body),
    )
    .await;

    let response = match read {
        Err(_) => error_json("Timed out reading request"),
        Ok(Err(e)) => {
            tracing::debug!("Failed to read request: {}", e);
            return;
        }
        Ok(Ok(_)) if body.len() > limits.max_request_size => error_json(format!(
            "Request too large (limit {} bytes)",
            limits.max_request_size
        )),
        Ok(Ok(_)) => match Request::decode(&body) {
            Err(message) => error_json(message),
            Ok(request) => {
                match tokio::time::timeout(limits.request_timeout, handle_request(&context, request))
                    .await
                {
                    Ok(value) => value,
                    Err(_) => error_json(format!(
                        "Request timed out after {:.1}s",
                        limits.request_timeout.as_secs_f64()
                    )),
                }
            }
        },
    };

    context.requests_served.fetch_add(1, Ordering::Relaxed);

    let bytes = match serde_json::to_vec(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            return;
        }
    };
    if let Err(e) = writer.write_all(&bytes).await {
        tracing::debug!("Client went away before the response was sent: {}", e);
        return;
    }
    let _ = writer.shutdown().await;
}

/// Check an existing socket with a short health check
async fn peer_is_healthy(socket_path: &Path) -> bool {
    let socket_path = socket_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let config = ClientConfig {
            max_retries: 0,
            health_check_retries: 0,
            ..ClientConfig::default()
        };
        DaemonClient::with_config(socket_path, config)
            .map(|client| client.get_health().is_ok())
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

/// Unlink the PID file and then the socket, unless another daemon has
/// claimed the path since (its PID is in the file).
fn release_socket(socket_path: &Path) {
    let own = std::process::id();
    match read_daemon_pid(socket_path) {
        Some(pid) if pid != own => {
            tracing::info!(
                "{} was claimed by daemon {}, leaving it in place",
                socket_path.display(),
                pid
            );
        }
        Some(_) => {
            remove_if_present(&pid_file_path(socket_path));
            remove_if_present(socket_path);
        }
        None => tracing::debug!(
            "PID file for {} already removed, leaving the socket to its owner",
            socket_path.display()
        ),
    }
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Run a Python-test daemon in the foreground until stopped or signalled
pub async fn serve(options: ServerOptions) -> Result<RunOutcome> {
    let server = DaemonServer::new(options, Arc::new(PythonTestSource::new()?));
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::info!("Termination signal received, draining");
        shutdown.shutdown();
    });

    server.run().await
}

async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut term) = signal(SignalKind::terminate()) else {
        return std::future::pending().await;
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
