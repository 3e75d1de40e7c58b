//! Blocking client for the collection daemon
//!
//! Every call is one round trip on a fresh connection: connect, write the
//! JSON request, half-close, read to end-of-stream, parse. Connection
//! refusals, missing sockets and read timeouts are retried with exponential
//! backoff; malformed requests are rejected before any I/O and never retried.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ClientConfig;
use crate::filter::FilterSpec;
use crate::socket_server::protocol::{
    CollectResponse, HealthResponse, ReloadResponse, ResponseStatus, StatusResponse, StopResponse,
};

/// Client-side failures
#[derive(Error, Debug)]
pub enum ClientError {
    /// Malformed request; the caller's bug, never retried
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Cannot connect to daemon at {path}: {source}")]
    Connection {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Request to daemon at {path} timed out after {timeout:?}: {source}")]
    Timeout {
        path: String,
        timeout: Duration,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON response from daemon: {0}")]
    InvalidResponse(String),

    /// The daemon answered with `{"status": "error"}`
    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Unexpected client error: {0}")]
    Unexpected(#[source] io::Error),
}

impl ClientError {
    /// Connection-class or timeout-class failure (daemon unreachable)
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_backoff_base(),
        }
    }
}

/// One request/response exchange over some byte stream
pub trait Transport {
    fn round_trip(&self, socket_path: &Path, payload: &[u8], timeout: Duration)
        -> io::Result<Vec<u8>>;
}

/// Unix domain socket transport
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixTransport;

impl Transport for UnixTransport {
    fn round_trip(
        &self,
        socket_path: &Path,
        payload: &[u8],
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        // Zero is rejected by set_read_timeout
        let timeout = timeout.max(Duration::from_millis(1));

        // Dropping the stream closes it on every return path
        let mut stream = UnixStream::connect(socket_path)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        stream.write_all(payload)?;
        stream.shutdown(Shutdown::Write)?;

        let mut response = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    Connection,
    Timeout,
    Other,
}

fn classify(error: &io::Error) -> FailureClass {
    match error.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FailureClass::Connection,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureClass::Timeout,
        _ => FailureClass::Other,
    }
}

/// Check a request's shape and return its command name
pub fn validate_request(request: &Value) -> ClientResult<&str> {
    let object = request
        .as_object()
        .ok_or_else(|| ClientError::Validation("Request must be a JSON object".to_string()))?;
    match object.get("command") {
        None => Err(ClientError::Validation(
            "Request missing 'command' field".to_string(),
        )),
        Some(Value::String(command)) => Ok(command),
        Some(_) => Err(ClientError::Validation(
            "Command must be a string".to_string(),
        )),
    }
}

/// Client for one daemon socket
#[derive(Debug, Clone)]
pub struct DaemonClient<T: Transport = UnixTransport> {
    socket_path: PathBuf,
    config: ClientConfig,
    transport: T,
}

impl DaemonClient<UnixTransport> {
    pub fn new(socket_path: impl Into<PathBuf>) -> ClientResult<Self> {
        Self::with_config(socket_path, ClientConfig::default())
    }

    pub fn with_config(socket_path: impl Into<PathBuf>, config: ClientConfig) -> ClientResult<Self> {
        Self::with_transport(socket_path, config, UnixTransport)
    }
}

impl<T: Transport> DaemonClient<T> {
    pub fn with_transport(
        socket_path: impl Into<PathBuf>,
        config: ClientConfig,
        transport: T,
    ) -> ClientResult<Self> {
        let socket_path = socket_path.into();
        if socket_path.as_os_str().is_empty() {
            return Err(ClientError::Validation(
                "socket_path cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            socket_path,
            config,
            transport,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send one request and return the raw response object.
    ///
    /// `timeout` and `retries` default to the client configuration.
    pub fn send_request(
        &self,
        request: &Value,
        timeout: Option<Duration>,
        retries: Option<u32>,
    ) -> ClientResult<Value> {
        let command = validate_request(request)?;
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        let policy = RetryPolicy {
            max_retries: retries.unwrap_or(self.config.max_retries),
            ..RetryPolicy::from(&self.config)
        };
        let payload =
            serde_json::to_vec(request).map_err(|e| ClientError::Validation(e.to_string()))?;
        let path = self.socket_path.display().to_string();

        let mut attempt = 0;
        loop {
            let error = match self.transport.round_trip(&self.socket_path, &payload, timeout) {
                Ok(bytes) => return parse_response(&bytes, &path),
                Err(e) => e,
            };

            let class = classify(&error);
            if class != FailureClass::Other && attempt < policy.max_retries {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    "'{}' attempt {} failed ({}), retrying in {:?}",
                    command,
                    attempt + 1,
                    error,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
                continue;
            }

            return Err(match class {
                FailureClass::Connection => ClientError::Connection {
                    path,
                    source: error,
                },
                FailureClass::Timeout => ClientError::Timeout {
                    path,
                    timeout,
                    source: error,
                },
                FailureClass::Other => ClientError::Unexpected(error),
            });
        }
    }

    fn call<R: DeserializeOwned>(
        &self,
        request: Value,
        timeout: Option<Duration>,
        retries: Option<u32>,
    ) -> ClientResult<R> {
        let response = self.send_request(&request, timeout, retries)?;
        decode_response(response)
    }

    /// Collect tests under `root_path`, filtered daemon-side
    pub fn collect(&self, root_path: &Path, filters: &FilterSpec) -> ClientResult<CollectResponse> {
        let mut request = json!({"command": "collect", "root_path": root_path.to_string_lossy()});
        if !filters.is_empty() {
            request["filters"] = json!(filters);
        }
        self.call(request, None, None)
    }

    /// Force the daemon to re-parse `file_paths`
    pub fn reload(&self, file_paths: &[PathBuf]) -> ClientResult<ReloadResponse> {
        if file_paths.is_empty() {
            return Err(ClientError::Validation(
                "file_paths cannot be empty".to_string(),
            ));
        }
        let file_paths: Vec<String> = file_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        self.call(
            json!({"command": "reload", "file_paths": file_paths}),
            None,
            None,
        )
    }

    pub fn get_status(&self) -> ClientResult<StatusResponse> {
        self.call(json!({"command": "status"}), None, None)
    }

    /// Quick check with the short health timeout
    pub fn get_health(&self) -> ClientResult<HealthResponse> {
        self.call(
            json!({"command": "health"}),
            Some(self.config.health_check_timeout()),
            Some(self.config.health_check_retries),
        )
    }

    pub fn stop(&self) -> ClientResult<StopResponse> {
        self.call(
            json!({"command": "stop"}),
            Some(self.config.stop_timeout()),
            None,
        )
    }

    /// Health first, status as a fallback. A degraded daemon still counts.
    pub fn is_daemon_running(&self) -> bool {
        match self.get_health() {
            Ok(health) => {
                if health.status == ResponseStatus::Degraded {
                    tracing::debug!("Daemon at {} is degraded: {:?}", self.socket_path.display(), health.checks);
                }
                true
            }
            Err(e) => {
                tracing::debug!("Health check failed ({}), trying status", e);
                self.get_status().is_ok()
            }
        }
    }
}

fn parse_response(bytes: &[u8], path: &str) -> ClientResult<Value> {
    if bytes.is_empty() {
        return Err(ClientError::Connection {
            path: path.to_string(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "Empty response from daemon"),
        });
    }
    serde_json::from_slice(bytes).map_err(|e| ClientError::InvalidResponse(e.to_string()))
}

fn decode_response<R: DeserializeOwned>(response: Value) -> ClientResult<R> {
    if response.get("status").and_then(Value::as_str) == Some("error") {
        let message = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(ClientError::Daemon(message));
    }
    serde_json::from_value(response).map_err(|e| ClientError::InvalidResponse(e.to_string()))
}
