//! Daemon process lifecycle
//!
//! Every project root maps to exactly one socket path (and a PID file next
//! to it), derived from a hash of the canonical root. Stopping escalates:
//! socket `stop` command, then SIGTERM, then SIGKILL, then cleanup of any
//! leftover files.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::client::DaemonClient;
use crate::config::{ClientConfig, StopTimings};
use crate::error::{FastCollectError, Result};
use crate::paths::root_hash;

const SOCKET_PREFIX: &str = "fastcollect-";
const PID_SUFFIX: &str = ".pid";
const LOG_SUFFIX: &str = ".log";
const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Deterministic socket path for a project root
pub fn socket_path(root: &Path) -> PathBuf {
    std::env::temp_dir().join(format!("{}{}.sock", SOCKET_PREFIX, root_hash(root)))
}

fn with_suffix(socket_path: &Path, suffix: &str) -> PathBuf {
    let mut path = socket_path.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// PID file path: the socket path plus `.pid`
pub fn pid_file_path(socket_path: &Path) -> PathBuf {
    with_suffix(socket_path, PID_SUFFIX)
}

/// Log file used when the daemon runs in the background
pub fn log_file_path(socket_path: &Path) -> PathBuf {
    with_suffix(socket_path, LOG_SUFFIX)
}

/// Record `pid` as the daemon owning `socket_path`
pub fn save_daemon_pid(socket_path: &Path, pid: u32) -> io::Result<()> {
    fs::write(pid_file_path(socket_path), pid.to_string())
}

/// Read the recorded PID. Missing, non-numeric, zero or negative content is `None`.
pub fn read_daemon_pid(socket_path: &Path) -> Option<u32> {
    let content = fs::read_to_string(pid_file_path(socket_path)).ok()?;
    match content.trim().parse::<i64>() {
        Ok(pid) if pid > 0 => u32::try_from(pid).ok(),
        _ => None,
    }
}

/// Does a process with this PID exist?
///
/// Sends signal 0, which performs the permission and existence checks
/// without delivering anything.
pub fn is_process_running(pid: i64) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Addressing info for one root's daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub socket_path: PathBuf,
    pub pid_file_path: PathBuf,
    pub pid: Option<u32>,
}

impl ProcessHandle {
    pub fn for_root(root: &Path) -> Self {
        Self::for_socket(socket_path(root))
    }

    pub fn for_socket(socket_path: PathBuf) -> Self {
        Self {
            pid_file_path: pid_file_path(&socket_path),
            pid: read_daemon_pid(&socket_path),
            socket_path,
        }
    }

    /// Recorded PID that is still alive
    pub fn live_pid(&self) -> Option<u32> {
        self.pid.filter(|pid| is_process_running(i64::from(*pid)))
    }
}

/// Escalation steps of [`stop_daemon`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopStage {
    SocketCommand,
    Terminate(u32),
    Kill(u32),
    /// Remove leftovers; `owner` is the PID the files belonged to, if known
    Cleanup { owner: Option<u32> },
}

/// Stop the daemon behind `socket_path` with default timings.
///
/// Returns true when anything was done: a daemon stopped or stale files removed.
pub fn stop_daemon(socket_path: &Path) -> bool {
    stop_daemon_with(socket_path, &ClientConfig::default(), &StopTimings::default())
}

pub fn stop_daemon_with(socket_path: &Path, config: &ClientConfig, timings: &StopTimings) -> bool {
    let mut acted = false;
    let mut stage = StopStage::SocketCommand;

    loop {
        stage = match stage {
            StopStage::SocketCommand => {
                let recorded = read_daemon_pid(socket_path);
                if request_stop(socket_path, config) {
                    tracing::info!("Daemon at {} stopping via socket", socket_path.display());
                    if !wait_for_release(socket_path, recorded, timings.drain_timeout) {
                        tracing::warn!(
                            "Daemon at {} still draining after {:?}",
                            socket_path.display(),
                            timings.drain_timeout
                        );
                    }
                    acted = true;
                    StopStage::Cleanup { owner: recorded }
                } else {
                    match recorded {
                        Some(pid) if is_process_running(i64::from(pid)) => StopStage::Terminate(pid),
                        _ => StopStage::Cleanup { owner: None },
                    }
                }
            }
            StopStage::Terminate(pid) => {
                tracing::info!("Sending SIGTERM to daemon process {}", pid);
                acted |= send_signal(pid, Signal::SIGTERM);
                std::thread::sleep(timings.after_sigterm);
                if is_process_running(i64::from(pid)) {
                    StopStage::Kill(pid)
                } else {
                    StopStage::Cleanup { owner: Some(pid) }
                }
            }
            StopStage::Kill(pid) => {
                tracing::warn!("Daemon process {} ignored SIGTERM, sending SIGKILL", pid);
                acted |= send_signal(pid, Signal::SIGKILL);
                std::thread::sleep(timings.after_sigkill);
                StopStage::Cleanup { owner: Some(pid) }
            }
            StopStage::Cleanup { owner } => return remove_leftovers(socket_path, owner) || acted,
        };
    }
}

/// Remove the socket and PID file. When `owner` is known and the PID file
/// now names a different process, a new daemon owns the path and nothing is
/// touched. Returns true if a file was removed.
fn remove_leftovers(socket_path: &Path, owner: Option<u32>) -> bool {
    if let (Some(owner), Some(current)) = (owner, read_daemon_pid(socket_path)) {
        if current != owner {
            tracing::info!(
                "{} now belongs to daemon {}, leaving it in place",
                socket_path.display(),
                current
            );
            return false;
        }
    }

    let mut removed = false;
    for path in [socket_path.to_path_buf(), pid_file_path(socket_path)] {
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Removed {}", path.display());
                removed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    removed
}

/// Poll until the stopped daemon has unlinked its socket, its process is
/// gone, or `timeout` passes. Returns false on timeout.
fn wait_for_release(socket_path: &Path, pid: Option<u32>, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        let exited = pid.is_some_and(|pid| !is_process_running(i64::from(pid)));
        if !socket_path.exists() || exited {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(RELEASE_POLL_INTERVAL);
    }
}

/// Single `stop` attempt; a refused socket means escalation, not retrying
fn request_stop(socket_path: &Path, config: &ClientConfig) -> bool {
    if !socket_path.exists() {
        return false;
    }
    let config = ClientConfig {
        max_retries: 0,
        ..config.clone()
    };
    match DaemonClient::with_config(socket_path, config).and_then(|client| client.stop()) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Socket stop failed: {}", e);
            false
        }
    }
}

fn send_signal(pid: u32, sig: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Failed to send {:?} to {}: {}", sig, pid, e);
            false
        }
    }
}

/// Launch a detached daemon process, stderr appended to `log_path`.
pub fn spawn_daemon(exe: &Path, args: &[OsString], log_path: &Path) -> Result<u32> {
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .spawn()
        .map_err(|e| FastCollectError::Daemon {
            message: format!("Failed to spawn {}: {}", exe.display(), e),
        })?;

    tracing::debug!("Spawned daemon process {} ({})", child.id(), exe.display());
    Ok(child.id())
}

/// Poll until the daemon answers or `deadline` passes
pub fn wait_until_running(socket_path: &Path, config: &ClientConfig, deadline: Duration) -> bool {
    let quick = ClientConfig {
        max_retries: 0,
        health_check_retries: 0,
        ..config.clone()
    };
    let Ok(client) = DaemonClient::with_config(socket_path, quick) else {
        return false;
    };

    let started = Instant::now();
    let poll = config.retry_backoff_base().max(Duration::from_millis(10));
    while started.elapsed() < deadline {
        if socket_path.exists() && client.is_daemon_running() {
            return true;
        }
        std::thread::sleep(poll);
    }
    false
}

/// Outcome of [`start_daemon`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    Started { pid: u32 },
}

/// Start a daemon for `socket_path` unless a healthy one already answers.
pub fn start_daemon(
    socket_path: &Path,
    exe: &Path,
    args: &[OsString],
    config: &ClientConfig,
    deadline: Duration,
) -> Result<StartOutcome> {
    let client = DaemonClient::with_config(socket_path, config.clone())?;
    if socket_path.exists() && client.is_daemon_running() {
        return Ok(StartOutcome::AlreadyRunning);
    }

    let pid = spawn_daemon(exe, args, &log_file_path(socket_path))?;
    if wait_until_running(socket_path, config, deadline) {
        Ok(StartOutcome::Started { pid })
    } else {
        Err(FastCollectError::Daemon {
            message: format!(
                "Daemon did not come up within {:?}; see {}",
                deadline,
                log_file_path(socket_path).display()
            ),
        })
    }
}
