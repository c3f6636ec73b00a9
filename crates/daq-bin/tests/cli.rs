//! Integration tests for the daq-logger command line
//!
//! These tests drive the built binary as a user would:
//! - Help and template generation
//! - A bounded session followed by a status query
//! - Stopping a continuous session through its PID file
//!
//! Run with: cargo test -p daq-bin --test cli

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn logger() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_daq-logger"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, mode: &str, limit: u64) -> PathBuf {
    let path = dir.join("logger.toml");
    let text = format!(
        r#"
[session]
mode = "{mode}"
sample_rate = 10
update_rate = 10
sample_limit = {limit}
channels = ["V1", "I1H", "I1L"]
file_format = "binary"
file_name = "{dir}/run.dlog"

[segments]
status_path = "{dir}/status"
web_path = "{dir}/web"
pid_file = "{dir}/logger.pid"

[logging]
level = "warn"
"#,
        dir = dir.display()
    );
    std::fs::write(&path, text).unwrap();
    path
}

fn run(config: &Path, args: &[&str]) -> Output {
    logger()
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("Failed to execute daq-logger")
}

// =============================================================================
// CLI Tests
// =============================================================================

#[test]
fn test_help_lists_commands() {
    let output = logger().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["run", "status", "stop", "new-config"] {
        assert!(stdout.contains(command), "help should mention {command}");
    }
}

#[test]
fn test_new_config_template() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("template.toml");

    let output = logger().arg("new-config").arg(&path).output().unwrap();
    assert!(output.status.success());
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("[session]"));
    assert!(text.contains("sample_rate"));

    // refuses to overwrite without --force
    let output = logger().arg("new-config").arg(&path).output().unwrap();
    assert!(!output.status.success());
    let output = logger()
        .arg("new-config")
        .arg(&path)
        .arg("--force")
        .output()
        .unwrap();
    assert!(output.status.success());
}

#[test]
fn test_status_without_session() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "limit", 10);

    let output = run(&config, &["status"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "not sampling");
}

#[test]
fn test_status_without_config_file() {
    let dir = TempDir::new().unwrap();

    let output = logger()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("status")
        .env("DAQ_LOGGER_SEGMENTS__STATUS_PATH", dir.path().join("status"))
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "status failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "not sampling");
}

// =============================================================================
// Session Tests
// =============================================================================

#[test]
fn test_limit_run_then_status() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "limit", 20);

    let output = run(&config, &["run", "--fast"]);
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sample limit reached"));
    assert!(stdout.contains("stored 20 samples in 20 buffers"));
    assert!(dir.path().join("run.dlog").exists());
    assert!(!dir.path().join("logger.pid").exists());

    let output = run(&config, &["status"]);
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "not sampling");

    let output = run(&config, &["status", "--json"]);
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["samples_taken"], 20);
    assert_eq!(report["sampling"], false);
    assert_eq!(report["sample_rate"], 10);
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "limit", 0);

    let output = run(&config, &["run", "--fast"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("sample_limit"));
    assert!(!dir.path().join("status").exists());
}

#[test]
fn test_stop_continuous_session() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "continuous", 0);
    let pid_path = dir.path().join("logger.pid");

    let mut child = logger()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !pid_path.exists() {
        assert!(Instant::now() < deadline, "session never wrote its PID file");
        thread::sleep(Duration::from_millis(20));
    }
    // let a few buffers through
    thread::sleep(Duration::from_millis(500));

    let output = run(&config, &["stop", "--wait", "10"]);
    assert!(
        output.status.success(),
        "stop failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Session stopped"));
    assert!(!pid_path.exists());
}

#[test]
fn test_stop_without_session() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "continuous", 0);

    let output = run(&config, &["stop"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No session PID file"));
}
