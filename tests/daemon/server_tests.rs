//! Request handling, concurrency and shutdown of an in-process daemon

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use fastcollect::cache::{CollectionCache, LoadOutcome};
use fastcollect::config::DaemonConfig;
use fastcollect::lifecycle::{pid_file_path, read_daemon_pid};
use fastcollect::socket_server::{ResponseStatus, RunOutcome, ServerOptions};
use fastcollect::{ClientError, FilterSpec};

use crate::common::daemon::{fast_daemon_config, SlowSource};
use crate::common::{RunningDaemon, TestProject};

/// Send raw bytes and read the raw JSON reply
fn raw_request(socket: &PathBuf, payload: &[u8]) -> Value {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(payload).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    serde_json::from_slice(&reply).unwrap()
}

// ============================================================================
// collect
// ============================================================================

#[test]
fn test_collect_end_to_end() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);
    let client = daemon.client();

    let response = client.collect(project.path(), &FilterSpec::default()).unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.files, 2);
    assert!(response.errors.is_empty());
    assert_eq!(response.cache_stats.files_parsed, 2);

    let auth = &response.items[&project.key("tests/test_auth.py")];
    let names: Vec<&str> = auth.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["TestLogin", "test_login_ok", "test_login_lockout", "test_logout"]
    );
    assert!(!response.items.contains_key(&project.key("tests/helpers.py")));
}

#[test]
fn test_second_collect_served_from_cache() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);
    let client = daemon.client();

    client.collect(project.path(), &FilterSpec::default()).unwrap();
    let again = client.collect(project.path(), &FilterSpec::default()).unwrap();

    assert_eq!(again.cache_stats.files_from_cache, 2);
    assert_eq!(again.cache_stats.files_parsed, 0);
    assert_eq!(again.files, 2);
}

#[test]
fn test_collect_picks_up_modified_file() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);
    let client = daemon.client();
    client.collect(project.path(), &FilterSpec::default()).unwrap();

    project.modify_file(
        "tests/test_math.py",
        "def test_add():\n    pass\n\ndef test_sub():\n    pass\n\ndef test_mul():\n    pass\n",
    );
    let response = client.collect(project.path(), &FilterSpec::default()).unwrap();

    assert_eq!(response.cache_stats.files_parsed, 1);
    assert_eq!(response.cache_stats.files_from_cache, 1);
    assert_eq!(response.items[&project.key("tests/test_math.py")].len(), 3);
}

#[test]
fn test_collect_with_filters() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);
    let client = daemon.client();

    let slow = client
        .collect(project.path(), &FilterSpec::new(None, Some("slow".to_string())))
        .unwrap();
    assert_eq!(slow.files, 1);
    let auth = &slow.items[&project.key("tests/test_auth.py")];
    assert_eq!(auth.len(), 1);
    assert_eq!(auth[0].name, "test_login_lockout");

    let keyword = client
        .collect(
            project.path(),
            &FilterSpec::new(Some("login and not lockout".to_string()), None),
        )
        .unwrap();
    let names: Vec<&str> = keyword
        .items
        .values()
        .flatten()
        .map(|i| i.name.as_str())
        .collect();
    assert!(names.contains(&"test_login_ok"));
    assert!(!names.contains(&"test_login_lockout"));
    assert!(!names.contains(&"test_add"));

    // Module-level pytestmark applies to every test in the file
    let unit = client
        .collect(project.path(), &FilterSpec::new(None, Some("unit".to_string())))
        .unwrap();
    assert_eq!(unit.files, 1);
    assert_eq!(unit.items[&project.key("tests/test_math.py")].len(), 2);
}

#[test]
fn test_collect_invalid_filter_is_daemon_error() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);

    let err = daemon
        .client()
        .collect(project.path(), &FilterSpec::new(Some("(login".to_string()), None))
        .unwrap_err();
    assert!(matches!(err, ClientError::Daemon(_)), "got {:?}", err);
}

#[test]
fn test_collect_other_root_is_rejected() {
    let project = TestProject::with_sample_suite();
    let other = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);

    let err = daemon
        .client()
        .collect(other.path(), &FilterSpec::default())
        .unwrap_err();
    match err {
        ClientError::Daemon(message) => assert!(message.contains("Daemon serves")),
        other => panic!("expected daemon error, got {:?}", other),
    }
}

#[test]
fn test_collect_reports_parse_errors() {
    let project = TestProject::with_sample_suite();
    project.add_file("tests/test_extra.py", "def test_ok():\n    pass\n");
    std::fs::write(project.file("tests/test_binary.py"), [0xff, 0xfe, 0x00, 0x81]).unwrap();
    let daemon = RunningDaemon::start(&project);

    let response = daemon
        .client()
        .collect(project.path(), &FilterSpec::default())
        .unwrap();
    assert!(response.errors.contains_key(&project.key("tests/test_binary.py")));
    assert!(!response.items.contains_key(&project.key("tests/test_binary.py")));
    assert!(response.items.contains_key(&project.key("tests/test_extra.py")));
}

// ============================================================================
// status / health / malformed requests
// ============================================================================

#[test]
fn test_status_reports_daemon_state() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);
    let client = daemon.client();
    client.collect(project.path(), &FilterSpec::default()).unwrap();

    let status = client.get_status().unwrap();
    assert_eq!(status.status, ResponseStatus::Running);
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.cached_modules, 2);
    assert_eq!(status.root_path, project.path());
    assert_eq!(status.socket_path, project.socket_path());
    assert!(status.requests_served >= 1);
    assert!(status.uptime >= 0.0);
}

#[test]
fn test_health_is_healthy() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);

    let health = daemon.client().get_health().unwrap();
    assert_eq!(health.status, ResponseStatus::Healthy);
    assert!(health.checks.values().all(|ok| *ok));
    assert!(health.checks.contains_key("socket"));
}

#[test]
fn test_invalid_requests_get_error_responses() {
    let project = TestProject::new();
    let daemon = RunningDaemon::start(&project);

    let reply = raw_request(&daemon.socket_path, b"not json");
    assert_eq!(reply["status"], "error");
    assert!(reply["error"].as_str().unwrap().starts_with("Invalid JSON"));

    let reply = raw_request(&daemon.socket_path, br#"{"command": "dance"}"#);
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error"], "Unknown command: dance");

    let reply = raw_request(&daemon.socket_path, br#"{"root_path": "/"}"#);
    assert_eq!(reply["error"], "Request missing 'command' field");

    // The daemon is still serving afterwards
    assert!(daemon.client().get_status().is_ok());
}

#[test]
fn test_oversize_request_is_rejected() {
    let project = TestProject::new();
    let daemon = RunningDaemon::start_with(
        &project,
        DaemonConfig {
            max_request_size: 64,
            ..fast_daemon_config()
        },
    );

    let payload = format!(r#"{{"command": "status", "padding": "{}"}}"#, "x".repeat(256));
    let reply = raw_request(&daemon.socket_path, payload.as_bytes());
    assert_eq!(reply["status"], "error");
    assert!(reply["error"].as_str().unwrap().contains("Request too large"));
}

// ============================================================================
// reload
// ============================================================================

#[test]
fn test_reload_reparses_files() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);
    let client = daemon.client();
    client.collect(project.path(), &FilterSpec::default()).unwrap();

    let response = client
        .reload(&[
            project.file("tests/test_auth.py"),
            PathBuf::from("tests/test_math.py"),
        ])
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.modules_reloaded, 2);
    assert!(response.errors.is_empty());
}

#[test]
fn test_reload_missing_file_reports_error() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);

    let response = daemon
        .client()
        .reload(&[project.file("tests/test_gone.py")])
        .unwrap();
    assert_eq!(response.modules_reloaded, 0);
    assert!(response.errors.contains_key(&project.key("tests/test_gone.py")));
}

#[test]
fn test_reload_empty_list_is_rejected_by_daemon() {
    let project = TestProject::new();
    let daemon = RunningDaemon::start(&project);

    let reply = raw_request(&daemon.socket_path, br#"{"command": "reload", "file_paths": []}"#);
    assert_eq!(reply["status"], "error");
}

// ============================================================================
// stop / lifecycle of the server loop
// ============================================================================

#[test]
fn test_stop_drains_and_cleans_up() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start(&project);
    let socket = daemon.socket_path.clone();
    let client = daemon.client();

    client.collect(project.path(), &FilterSpec::default()).unwrap();
    assert_eq!(read_daemon_pid(&socket), Some(std::process::id()));

    let stop = client.stop().unwrap();
    assert_eq!(stop.status, ResponseStatus::Stopping);
    assert_eq!(daemon.join(), RunOutcome::Stopped);

    assert!(!socket.exists());
    assert!(!pid_file_path(&socket).exists());

    let (cache, outcome) = CollectionCache::open(project.cache_dir(), 0.01);
    assert!(matches!(outcome, LoadOutcome::Loaded { entries: 2 }));
    assert_eq!(cache.total_items(), 6);
}

#[test]
fn test_stop_waits_for_in_flight_collect() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start_with_source(
        &project,
        fast_daemon_config(),
        SlowSource::new(Duration::from_millis(500)),
    );

    let client = daemon.client();
    let root = project.path().to_path_buf();
    let in_flight = std::thread::spawn(move || client.collect(&root, &FilterSpec::default()));

    // Let the collect reach the parser before stopping
    std::thread::sleep(Duration::from_millis(200));
    let stop = daemon.client().stop().unwrap();
    assert_eq!(stop.status, ResponseStatus::Stopping);

    let response = in_flight.join().unwrap().unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.files, 2);
    assert_eq!(daemon.join(), RunOutcome::Stopped);

    let (cache, outcome) = CollectionCache::open(project.cache_dir(), 0.01);
    assert!(matches!(outcome, LoadOutcome::Loaded { entries: 2 }));
    assert_eq!(cache.total_items(), 6);
}

#[test]
fn test_slow_request_times_out_and_daemon_keeps_serving() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start_with_source(
        &project,
        DaemonConfig {
            request_timeout_secs: 0.2,
            ..fast_daemon_config()
        },
        SlowSource::new(Duration::from_secs(1)),
    );

    let payload = serde_json::json!({
        "command": "collect",
        "root_path": project.path().to_string_lossy(),
    })
    .to_string();
    let reply = raw_request(&daemon.socket_path, payload.as_bytes());
    assert_eq!(reply["status"], "error");
    let message = reply["error"].as_str().unwrap();
    assert!(message.starts_with("Request timed out after"), "got {}", message);

    let status = daemon.client().get_status().unwrap();
    assert_eq!(status.status, ResponseStatus::Running);
    assert!(daemon.client().get_health().is_ok());
}

#[test]
fn test_client_after_stop_is_unreachable() {
    let project = TestProject::new();
    let daemon = RunningDaemon::start(&project);
    let client = daemon.client();
    client.stop().unwrap();
    daemon.join();

    let err = client.get_status().unwrap_err();
    assert!(err.is_unreachable(), "got {:?}", err);
    assert!(!client.is_daemon_running());
}

#[test]
fn test_concurrent_requests_with_bounded_connections() {
    let project = TestProject::with_sample_suite();
    let daemon = RunningDaemon::start_with(
        &project,
        DaemonConfig {
            max_connections: 2,
            ..fast_daemon_config()
        },
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = daemon.client();
            std::thread::spawn(move || client.get_status().map(|s| s.status))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), ResponseStatus::Running);
    }
    assert!(daemon.client().get_status().unwrap().requests_served >= 8);
}

#[test]
fn test_second_daemon_defers_to_healthy_peer() {
    let project = TestProject::new();
    let first = RunningDaemon::start(&project);

    let options = ServerOptions {
        root: project.path().to_path_buf(),
        socket_path: project.socket_path(),
        cache_dir: project.cache_dir(),
        mtime_tolerance: 0.01,
        daemon: fast_daemon_config(),
    };
    let second = RunningDaemon::spawn(options);
    assert_eq!(second.join(), RunOutcome::PeerAlreadyRunning);

    // The first daemon keeps its socket
    assert!(first.client().get_health().is_ok());
}

#[test]
fn test_stale_socket_is_taken_over() {
    let project = TestProject::with_sample_suite();
    {
        // Bound but never accepted on: a dead daemon's leftover
        let _stale = std::os::unix::net::UnixListener::bind(project.socket_path()).unwrap();
    }
    assert!(project.socket_path().exists());

    let daemon = RunningDaemon::start(&project);
    let response = daemon
        .client()
        .collect(project.path(), &FilterSpec::default())
        .unwrap();
    assert_eq!(response.files, 2);
}

#[test]
fn test_cache_survives_restart() {
    let project = TestProject::with_sample_suite();

    let first = RunningDaemon::start(&project);
    first
        .client()
        .collect(project.path(), &FilterSpec::default())
        .unwrap();
    first.client().stop().unwrap();
    first.join();

    let second = RunningDaemon::start(&project);
    assert_eq!(second.client().get_status().unwrap().cached_modules, 2);
    let response = second
        .client()
        .collect(project.path(), &FilterSpec::default())
        .unwrap();
    assert_eq!(response.cache_stats.files_from_cache, 2);
    assert_eq!(response.cache_stats.files_parsed, 0);
}
