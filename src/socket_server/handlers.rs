//! Command handlers
//!
//! Every handler returns a JSON value; failures become
//! `{"status": "error", "error": ...}` so a bad request never takes the
//! daemon down. Parsing work runs on the blocking pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::cache::CollectionCache;
use crate::collector::{collect_incremental, reload_files};
use crate::filter::{filter_collected_data, FilterSpec, TestFilter};
use crate::parsing::TestSource;
use crate::paths::canonical_root;

use super::protocol::{
    CollectResponse, ErrorResponse, HealthResponse, ReloadResponse, Request, ResponseStatus,
    StatusResponse, StopResponse,
};
use super::server::ServerState;

/// State shared by every connection of one daemon
pub struct DaemonContext {
    pub root: PathBuf,
    pub socket_path: PathBuf,
    pub cache: CollectionCache,
    pub source: Arc<dyn TestSource>,
    pub started: Instant,
    pub requests_served: AtomicU64,
    pub state: watch::Sender<ServerState>,
}

impl DaemonContext {
    pub fn uptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Ask the accept loop to stop taking connections
    pub fn begin_draining(&self) {
        self.state.send_if_modified(|state| {
            if *state == ServerState::Serving || *state == ServerState::Starting {
                *state = ServerState::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Named liveness checks; all true means healthy
    pub fn health_checks(&self) -> BTreeMap<String, bool> {
        let mut checks = BTreeMap::new();
        checks.insert("socket".to_string(), self.socket_path.exists());
        checks.insert(
            "cache_dir_writable".to_string(),
            dir_is_writable(self.cache.cache_dir()),
        );
        checks.insert("root_exists".to_string(), self.root.is_dir());
        checks
    }
}

fn dir_is_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(format!(".write-check.{}", std::process::id()));
    let ok = std::fs::write(&marker, b"").is_ok();
    let _ = std::fs::remove_file(&marker);
    ok
}

/// Dispatch one decoded request
pub async fn handle_request(ctx: &Arc<DaemonContext>, request: Request) -> Value {
    tracing::debug!("Handling '{}' request", request.command());

    let result = match request {
        Request::Status => Ok(to_json(&status(ctx))),
        Request::Health => Ok(to_json(&health(ctx))),
        Request::Stop => Ok(to_json(&stop(ctx))),
        Request::Collect { root_path, filters } => collect(ctx, root_path, filters)
            .await
            .map(|r| to_json(&r)),
        Request::Reload { file_paths } => reload(ctx, file_paths).await.map(|r| to_json(&r)),
    };

    match result {
        Ok(value) => value,
        Err(message) => {
            tracing::warn!("Request failed: {}", message);
            error_json(message)
        }
    }
}

/// Serialize an error response
pub fn error_json(message: impl Into<String>) -> Value {
    to_json(&ErrorResponse::new(message))
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        serde_json::json!({"status": "error", "error": format!("Failed to encode response: {}", e)})
    })
}

fn status(ctx: &DaemonContext) -> StatusResponse {
    StatusResponse {
        status: ResponseStatus::Running,
        pid: std::process::id(),
        uptime: ctx.uptime(),
        cached_modules: ctx.cache.len(),
        root_path: ctx.root.clone(),
        socket_path: ctx.socket_path.clone(),
        cache_stats: ctx.cache.stats(),
        requests_served: ctx.requests_served.load(Ordering::Relaxed),
    }
}

fn health(ctx: &DaemonContext) -> HealthResponse {
    HealthResponse::from_checks(ctx.health_checks(), ctx.uptime())
}

fn stop(ctx: &DaemonContext) -> StopResponse {
    tracing::info!("Stop requested");
    ctx.begin_draining();
    StopResponse {
        status: ResponseStatus::Stopping,
    }
}

async fn collect(
    ctx: &Arc<DaemonContext>,
    root_path: PathBuf,
    filters: Option<FilterSpec>,
) -> Result<CollectResponse, String> {
    let started = Instant::now();

    let requested = canonical_root(&root_path);
    if requested != ctx.root {
        return Err(format!(
            "Daemon serves {}, not {}",
            ctx.root.display(),
            requested.display()
        ));
    }

    let filter = TestFilter::from_spec(&filters.unwrap_or_default()).map_err(|e| e.to_string())?;

    let worker = Arc::clone(ctx);
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = collect_incremental(worker.source.as_ref(), &worker.cache, &worker.root)?;
        if outcome.changed {
            worker.cache.persist();
        }
        Ok::<_, crate::error::FastCollectError>(outcome)
    })
    .await
    .map_err(|e| format!("Collection task failed: {}", e))?
    .map_err(|e| e.to_string())?;

    let items = if filter.is_empty() {
        outcome.items
    } else {
        filter_collected_data(&outcome.items, &filter)
    };

    tracing::info!(
        "Collected {} files ({}) in {:.3}s",
        items.len(),
        outcome.stats,
        started.elapsed().as_secs_f64()
    );

    Ok(CollectResponse {
        status: ResponseStatus::Success,
        collection_time: started.elapsed().as_secs_f64(),
        files: items.len(),
        items,
        errors: outcome.errors,
        cache_stats: outcome.stats,
    })
}

async fn reload(ctx: &Arc<DaemonContext>, file_paths: Vec<PathBuf>) -> Result<ReloadResponse, String> {
    if file_paths.is_empty() {
        return Err("file_paths cannot be empty".to_string());
    }
    let started = Instant::now();

    let worker = Arc::clone(ctx);
    let outcome = tokio::task::spawn_blocking(move || {
        let absolute: Vec<PathBuf> = file_paths
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { worker.root.join(p) })
            .collect();
        let outcome = reload_files(worker.source.as_ref(), &worker.cache, &absolute);
        worker.cache.persist();
        outcome
    })
    .await
    .map_err(|e| format!("Reload task failed: {}", e))?;

    tracing::info!("Reloaded {} files", outcome.reloaded);

    Ok(ReloadResponse {
        status: ResponseStatus::Success,
        modules_reloaded: outcome.reloaded,
        reload_time: started.elapsed().as_secs_f64(),
        errors: outcome.errors,
    })
}
