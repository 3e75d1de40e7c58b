//! `fastcollect` binary end to end

use serde_json::Value;

use crate::common::TestProject;

#[test]
fn test_collect_prints_node_ids() {
    let project = TestProject::with_sample_suite();
    let stdout = project.run_cli_success(&["collect", "--no-daemon"]);
    let lines: Vec<&str> = stdout.lines().collect();

    assert_eq!(
        lines,
        vec![
            "tests/test_auth.py::TestLogin::test_login_ok",
            "tests/test_auth.py::TestLogin::test_login_lockout",
            "tests/test_auth.py::test_logout",
            "tests/test_math.py::test_add",
            "tests/test_math.py::test_double",
        ]
    );
}

#[test]
fn test_collect_files_only_with_marker() {
    let project = TestProject::with_sample_suite();
    let stdout = project.run_cli_success(&["collect", "--no-daemon", "-m", "slow", "--files-only"]);
    assert_eq!(stdout.trim(), "tests/test_auth.py");
}

#[test]
fn test_collect_keyword_filter() {
    let project = TestProject::with_sample_suite();
    let stdout = project.run_cli_success(&["collect", "--no-daemon", "-k", "add or double"]);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec!["tests/test_math.py::test_add", "tests/test_math.py::test_double"]
    );
}

#[test]
fn test_collect_json_output() {
    let project = TestProject::with_sample_suite();
    let stdout = project.run_cli_success(&["collect", "--no-daemon", "--json"]);
    let json: Value = serde_json::from_str(&stdout).unwrap();

    let math = json[project.key("tests/test_math.py").as_str()].as_array().unwrap();
    assert_eq!(math.len(), 2);
    assert_eq!(math[0]["name"], "test_add");
    assert_eq!(math[0]["type"], "Function");
    assert_eq!(math[0]["markers"][0], "unit");
}

#[test]
fn test_collect_populates_cache() {
    let project = TestProject::with_sample_suite();
    project.run_cli_success(&["collect", "--no-daemon"]);
    assert!(project.cache_dir().join("cache.json").exists());

    let stderr = String::from_utf8_lossy(&project.run_cli(&["collect", "--no-daemon"]).stderr).to_string();
    assert!(stderr.contains("2 files from cache, 0 parsed"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_keyword_exits_with_filter_code() {
    let project = TestProject::with_sample_suite();
    let (code, stderr) = project.run_cli_failure(&["collect", "--no-daemon", "-k", "login and"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("Error"));
}

#[test]
fn test_daemon_status_without_daemon() {
    let project = TestProject::new();
    let (code, _) = project.run_cli_failure(&["daemon", "status"]);
    assert_eq!(code, Some(4));
}

#[test]
fn test_daemon_stop_without_daemon() {
    let project = TestProject::new();
    let stdout = project.run_cli_success(&["daemon", "stop"]);
    assert_eq!(stdout.trim(), "No daemon running");
}

#[test]
fn test_cache_stats_and_clear() {
    let project = TestProject::with_sample_suite();
    project.run_cli_success(&["collect", "--no-daemon"]);

    let stats = project.run_cli_success(&["cache", "stats"]);
    assert!(stats.contains("State:      ok"), "stats: {}", stats);
    assert!(stats.contains("Files:      2"));
    assert!(stats.contains("Tests:      6"));

    project.run_cli_success(&["cache", "clear"]);
    assert!(!project.cache_dir().join("cache.json").exists());

    let stats = project.run_cli_success(&["cache", "stats"]);
    assert!(stats.contains("no cache file"));
    assert!(stats.contains("Files:      0"));
}

#[test]
fn test_malformed_config_is_rejected() {
    let project = TestProject::with_sample_suite();
    project.add_file(".fastcollect.toml", "[cache\n");
    let (code, stderr) = project.run_cli_failure(&["collect", "--no-daemon"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains(".fastcollect.toml"));
}

#[test]
fn test_daemon_start_collect_stop() {
    let project = TestProject::with_sample_suite();

    let started = project.run_cli_success(&["daemon", "start"]);
    assert!(started.contains("Daemon started"), "stdout: {}", started);

    let again = project.run_cli_success(&["daemon", "start"]);
    assert!(again.contains("already running"));

    let status = project.run_cli_success(&["daemon", "status"]);
    assert!(status.contains("Running"));

    let output = project.run_cli(&["collect"]);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("via Daemon"), "stderr: {}", stderr);
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 5);

    let reload = project.run_cli_success(&["reload", "tests/test_math.py"]);
    assert!(reload.contains("Reloaded 1 files"));

    let stopped = project.run_cli_success(&["daemon", "stop"]);
    assert_eq!(stopped.trim(), "Daemon stopped");
}
