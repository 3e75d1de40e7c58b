//! In-process daemon fixture
//!
//! Runs a `DaemonServer` on its own tokio runtime thread so blocking client
//! calls can be made directly from the test thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fastcollect::config::{ClientConfig, DaemonConfig};
use fastcollect::schema::{DiscoveredFile, TestItem};
use fastcollect::socket_server::{DaemonServer, RunOutcome, ServerOptions, ShutdownHandle};
use fastcollect::{DaemonClient, PythonTestSource, TestSource};

use super::TestProject;

pub struct RunningDaemon {
    pub socket_path: PathBuf,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<fastcollect::Result<RunOutcome>>>,
}

impl RunningDaemon {
    pub fn start(project: &TestProject) -> Self {
        Self::start_with(project, fast_daemon_config())
    }

    pub fn start_with(project: &TestProject, daemon: DaemonConfig) -> Self {
        Self::start_with_source(project, daemon, Arc::new(PythonTestSource::new().unwrap()))
    }

    pub fn start_with_source(
        project: &TestProject,
        daemon: DaemonConfig,
        source: Arc<dyn TestSource>,
    ) -> Self {
        let options = ServerOptions {
            root: project.path().to_path_buf(),
            socket_path: project.socket_path(),
            cache_dir: project.cache_dir(),
            mtime_tolerance: 0.01,
            daemon,
        };
        let running = Self::spawn_with_source(options, source);
        assert!(running.wait_ready(Duration::from_secs(5)), "daemon did not come up");
        running
    }

    /// Spawn without waiting; the run may end early (e.g. a healthy peer exists)
    pub fn spawn(options: ServerOptions) -> Self {
        Self::spawn_with_source(options, Arc::new(PythonTestSource::new().unwrap()))
    }

    pub fn spawn_with_source(options: ServerOptions, source: Arc<dyn TestSource>) -> Self {
        let socket_path = options.socket_path.clone();
        let server = DaemonServer::new(options, source);
        let shutdown = server.shutdown_handle();

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("Failed to build runtime");
            runtime.block_on(server.run())
        });

        Self {
            socket_path,
            shutdown,
            thread: Some(thread),
        }
    }

    fn wait_ready(&self, deadline: Duration) -> bool {
        let client = self.client_with(ClientConfig {
            max_retries: 0,
            health_check_retries: 0,
            ..ClientConfig::default()
        });
        let started = Instant::now();
        while started.elapsed() < deadline {
            if self.socket_path.exists() && client.is_daemon_running() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    pub fn client(&self) -> DaemonClient {
        self.client_with(fast_client_config())
    }

    pub fn client_with(&self, config: ClientConfig) -> DaemonClient {
        DaemonClient::with_config(&self.socket_path, config).unwrap()
    }

    /// Wait for the server run to finish and return its outcome
    pub fn join(mut self) -> RunOutcome {
        self.thread
            .take()
            .expect("already joined")
            .join()
            .expect("daemon thread panicked")
            .expect("daemon run failed")
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.shutdown();
            let _ = thread.join();
        }
    }
}

pub fn fast_daemon_config() -> DaemonConfig {
    DaemonConfig {
        accept_timeout_secs: 0.05,
        ..DaemonConfig::default()
    }
}

pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        retry_backoff_base_secs: 0.01,
        ..ClientConfig::default()
    }
}

/// Python source whose every parse takes at least `delay`
pub struct SlowSource {
    inner: PythonTestSource,
    delay: Duration,
}

impl SlowSource {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: PythonTestSource::new().unwrap(),
            delay,
        })
    }
}

impl TestSource for SlowSource {
    fn discover(&self, root: &Path) -> fastcollect::Result<Vec<DiscoveredFile>> {
        self.inner.discover(root)
    }

    fn parse(&self, path: &Path) -> fastcollect::Result<Vec<TestItem>> {
        std::thread::sleep(self.delay);
        self.inner.parse(path)
    }
}
