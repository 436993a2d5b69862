//! CLI Integration Tests
//!
//! These tests verify the CLI commands work end-to-end against the core
//! library.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("courier").expect("Failed to find courier binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Extract the fingerprint from CLI output ("  Fingerprint: <hex>")
fn extract_fingerprint(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("  Fingerprint: "))
        .map(|fp| fp.trim().to_string())
}

// ============================================================================
// Identity Command Tests
// ============================================================================

#[test]
fn test_identity_new_then_show() {
    let data_dir = TempDir::new().unwrap();

    let output = cli_cmd(&data_dir)
        .args(["identity", "new"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let created = extract_fingerprint(&String::from_utf8_lossy(&output.stdout))
        .expect("fingerprint in output");
    assert_eq!(created.len(), 64);
    assert!(data_dir.path().join("identity.key").exists());

    cli_cmd(&data_dir)
        .args(["identity", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains(created));
}

#[test]
fn test_identity_new_refuses_overwrite() {
    let data_dir = TempDir::new().unwrap();
    let key = data_dir.path().join("alice.key");

    cli_cmd(&data_dir)
        .args(["identity", "new", "--out"])
        .arg(&key)
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["identity", "new", "--out"])
        .arg(&key)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    cli_cmd(&data_dir)
        .args(["identity", "new", "--force", "--out"])
        .arg(&key)
        .assert()
        .success();
}

#[test]
fn test_identity_show_rejects_garbage() {
    let data_dir = TempDir::new().unwrap();
    let key = data_dir.path().join("bad.key");
    std::fs::write(&key, b"not a key").unwrap();

    cli_cmd(&data_dir)
        .args(["identity", "show"])
        .arg(&key)
        .assert()
        .failure();
}

// ============================================================================
// Config Command Tests
// ============================================================================

#[test]
fn test_config_defaults() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"listen_port\": 4001"))
        .stdout(predicate::str::contains("\"presence_freshness_secs\": 600"))
        .stdout(predicate::str::contains("stun.l.google.com"));
}

#[test]
fn test_config_file_overrides() {
    let data_dir = TempDir::new().unwrap();
    let file = data_dir.path().join("transport.json");
    std::fs::write(&file, r#"{ "listen_port": 0, "enable_offline_queue": false }"#).unwrap();

    cli_cmd(&data_dir)
        .arg("config")
        .arg("--file")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"listen_port\": 0"))
        .stdout(predicate::str::contains("\"enable_offline_queue\": false"));
}

#[test]
fn test_config_file_malformed() {
    let data_dir = TempDir::new().unwrap();
    let file = data_dir.path().join("transport.json");
    std::fs::write(&file, "{ listen_port").unwrap();

    cli_cmd(&data_dir)
        .arg("config")
        .arg("--file")
        .arg(&file)
        .assert()
        .failure();
}

// ============================================================================
// Demo Command Tests
// ============================================================================

#[test]
fn test_demo_delivers_on_both_tiers() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("demo")
        .assert()
        .success()
        .stdout(predicate::str::contains("queued offline as seq 1"))
        .stdout(predicate::str::contains("collected 1 message(s)"))
        .stdout(predicate::str::contains("delivered directly over TCP"))
        .stdout(predicate::str::contains("hello directly"));
}
