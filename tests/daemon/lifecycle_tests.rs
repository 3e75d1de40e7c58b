//! Process lifecycle against the real daemon binary

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use fastcollect::config::{ClientConfig, StopTimings};
use fastcollect::lifecycle::{
    log_file_path, pid_file_path, read_daemon_pid, spawn_daemon, start_daemon, stop_daemon_with,
    wait_until_running, StartOutcome,
};
use fastcollect::{DaemonClient, FilterSpec};

use crate::common::daemon::fast_client_config;
use crate::common::TestProject;

const DEADLINE: Duration = Duration::from_secs(10);

fn daemon_exe() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_fastcollect-daemon"))
}

fn daemon_args(project: &TestProject) -> Vec<OsString> {
    vec![
        "--root".into(),
        project.path().as_os_str().to_owned(),
        "--socket".into(),
        project.socket_path().into_os_string(),
    ]
}

fn quick_timings() -> StopTimings {
    StopTimings {
        drain_timeout: Duration::from_secs(5),
        after_sigterm: Duration::from_millis(500),
        after_sigkill: Duration::from_millis(100),
    }
}

#[test]
fn test_spawned_daemon_serves_and_stops() {
    let project = TestProject::with_sample_suite();
    let socket = project.socket_path();
    let config = fast_client_config();

    let pid = spawn_daemon(daemon_exe(), &daemon_args(&project), &log_file_path(&socket)).unwrap();
    assert!(wait_until_running(&socket, &config, DEADLINE), "daemon did not come up");
    assert_eq!(read_daemon_pid(&socket), Some(pid));

    let client = DaemonClient::with_config(&socket, config.clone()).unwrap();
    let response = client.collect(project.path(), &FilterSpec::default()).unwrap();
    assert_eq!(response.files, 2);
    assert_eq!(client.get_status().unwrap().pid, pid);

    assert!(stop_daemon_with(&socket, &config, &quick_timings()));
    assert!(!socket.exists());
    assert!(!pid_file_path(&socket).exists());
}

#[test]
fn test_start_daemon_is_idempotent() {
    let project = TestProject::new();
    let socket = project.socket_path();
    let config = fast_client_config();
    let args = daemon_args(&project);

    let first = start_daemon(&socket, daemon_exe(), &args, &config, DEADLINE).unwrap();
    let StartOutcome::Started { pid } = first else {
        panic!("expected a fresh daemon, got {:?}", first);
    };
    assert_eq!(read_daemon_pid(&socket), Some(pid));

    let second = start_daemon(&socket, daemon_exe(), &args, &config, DEADLINE).unwrap();
    assert_eq!(second, StartOutcome::AlreadyRunning);

    assert!(stop_daemon_with(&socket, &config, &quick_timings()));
}

#[test]
fn test_stop_escalates_to_signal_without_socket() {
    let project = TestProject::new();
    let socket = project.socket_path();
    let config = fast_client_config();

    let pid = spawn_daemon(daemon_exe(), &daemon_args(&project), &log_file_path(&socket)).unwrap();
    assert!(wait_until_running(&socket, &config, DEADLINE));

    // With the socket gone only the PID file can reach the daemon
    std::fs::remove_file(&socket).unwrap();
    assert_eq!(read_daemon_pid(&socket), Some(pid));

    assert!(stop_daemon_with(&socket, &config, &quick_timings()));
    assert!(!pid_file_path(&socket).exists());
}

#[test]
fn test_stop_without_daemon_is_noop() {
    let project = TestProject::new();
    let config = ClientConfig {
        max_retries: 0,
        ..fast_client_config()
    };
    assert!(!stop_daemon_with(&project.socket_path(), &config, &quick_timings()));
}

#[test]
fn test_stop_cleans_stale_pid_file() {
    let project = TestProject::new();
    let socket = project.socket_path();
    // PID far above any real pid_max
    std::fs::write(pid_file_path(&socket), "2147483000").unwrap();

    assert!(stop_daemon_with(&socket, &fast_client_config(), &quick_timings()));
    assert!(!pid_file_path(&socket).exists());
}
