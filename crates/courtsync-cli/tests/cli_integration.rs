//! End-to-end tests for the `courtsync` binary
//!
//! Each test runs the compiled binary against a throwaway data directory
//! and asserts on its exit status and output, so argument parsing, local
//! storage, and command dispatch are exercised together.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("courtsync").expect("Failed to find courtsync binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Extract the device ID from `info` output (format: "  ID: <ulid>")
fn extract_device_id(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(id) = line.strip_prefix("  ID: ") {
            return Some(id.trim().to_string());
        }
    }
    None
}

// ============================================================================
// Info Command Tests
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Device:"))
        .stdout(predicate::str::contains("ID: "))
        .stdout(predicate::str::contains("Persisted: (none)"))
        .stdout(predicate::str::contains("Trusted peers: 0"));
}

#[test]
fn test_device_id_stable_across_invocations() {
    let data_dir = TempDir::new().unwrap();

    let first = cli_cmd(&data_dir).arg("info").assert().success();
    let first_out = String::from_utf8_lossy(&first.get_output().stdout).to_string();
    let first_id = extract_device_id(&first_out).expect("no device id in output");

    let second = cli_cmd(&data_dir).arg("info").assert().success();
    let second_out = String::from_utf8_lossy(&second.get_output().stdout).to_string();
    let second_id = extract_device_id(&second_out).expect("no device id in output");

    assert_eq!(first_id, second_id);
}

// ============================================================================
// Role Command Tests
// ============================================================================

#[test]
fn test_role_show_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["role", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted role"));
}

#[test]
fn test_role_clear() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["role", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Role cleared"));

    cli_cmd(&data_dir)
        .args(["role", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted role"));
}

// ============================================================================
// Peers Command Tests
// ============================================================================

#[test]
fn test_peers_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No trusted peers"));
}

#[test]
fn test_peers_trust_and_list() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "trust", "peer-abc", "--role", "recorder"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Trusted peer-abc as recorder"));

    cli_cmd(&data_dir)
        .args(["peers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Trusted peers (1):"))
        .stdout(predicate::str::contains("peer-abc (recorder)"))
        .stdout(predicate::str::contains("never connected"));
}

#[test]
fn test_peers_remove() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "trust", "peer-abc"])
        .assert()
        .success();
    cli_cmd(&data_dir)
        .args(["peers", "remove", "peer-abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed peer-abc"));

    cli_cmd(&data_dir)
        .args(["peers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No trusted peers"));
}

#[test]
fn test_peers_trust_rejects_bad_role() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "trust", "peer-abc", "--role", "referee"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid role"));
}

// ============================================================================
// Demo Command Tests
// ============================================================================

#[test]
fn test_demo_runs_full_lifecycle() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("demo")
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("Devices paired"))
        .stdout(predicate::str::contains("both devices in progress"))
        .stdout(predicate::str::contains("Game ended"));
}
