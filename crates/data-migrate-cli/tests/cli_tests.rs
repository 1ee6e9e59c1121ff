//! CLI integration tests for data-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for various error conditions. Only file sources are
//! used so no database is needed.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};

/// Get a command for the data-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("data-migrate").unwrap()
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// Config with one file source rooted at `dir`.
fn file_source_config(dir: &Path) -> NamedTempFile {
    write_config(&format!(
        "data_sources:\n  - id: erp\n    kind: file\n    path: {}\n",
        dir.display()
    ))
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("pause"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_global_flags_in_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("data-migrate"));
}

#[test]
fn test_run_requires_request_path() {
    cmd()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<REQUEST>"));
}

#[test]
fn test_status_rejects_malformed_id() {
    cmd()
        .args(["status", "not-a-uuid"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid value"));
}

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_missing_config_file() {
    cmd()
        .args(["--config", "/nonexistent/config.yaml", "health-check"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_config() {
    let config = write_config("data_sources: [unclosed");
    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("health-check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("YAML error"));
}

#[test]
fn test_config_without_data_sources() {
    let config = write_config("data_sources: []\n");
    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("health-check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("data_sources"));
}

#[test]
fn test_unknown_log_format() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(dir.path());
    cmd()
        .arg("--config")
        .arg(config.path())
        .args(["--log-format", "xml", "health-check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown log format"));
}

// =============================================================================
// Health Check Tests
// =============================================================================

#[test]
fn test_health_check_file_source() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(dir.path());
    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("health-check")
        .assert()
        .success()
        .stdout(predicate::str::contains("erp (file): OK"))
        .stdout(predicate::str::contains("HEALTHY"));
}

#[test]
fn test_health_check_json_output() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(dir.path());
    let output = cmd()
        .arg("--config")
        .arg(config.path())
        .args(["--output-json", "health-check"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["healthy"], true);
    assert_eq!(report["sources"][0]["data_source"], "erp");
    assert_eq!(report["sources"][0]["kind"], "file");
}

#[test]
fn test_health_check_missing_directory() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(&dir.path().join("missing"));
    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("health-check")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("erp (file): FAILED"))
        .stdout(predicate::str::contains("UNHEALTHY"));
}

// =============================================================================
// Migration Command Tests
// =============================================================================

#[test]
fn test_status_unknown_migration() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(dir.path());
    cmd()
        .arg("--config")
        .arg(config.path())
        .args(["status", "00000000-0000-4000-8000-000000000000"])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_pause_unknown_migration() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(dir.path());
    cmd()
        .arg("--config")
        .arg(config.path())
        .args(["pause", "00000000-0000-4000-8000-000000000000"])
        .assert()
        .code(5);
}

#[test]
fn test_run_missing_request_file() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(dir.path());
    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("run")
        .arg(dir.path().join("absent.yaml"))
        .assert()
        .code(7);
}

#[test]
fn test_run_rejects_unknown_target() {
    let dir = TempDir::new().unwrap();
    let config = file_source_config(dir.path());
    let request = dir.path().join("request.yaml");
    std::fs::write(
        &request,
        "name: customers\n\
         source_system: erp\n\
         target_system: nowhere\n\
         entities:\n  - name: customers\n    key_columns: [id]\n",
    )
    .unwrap();

    cmd()
        .arg("--config")
        .arg(config.path())
        .arg("run")
        .arg(&request)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown data source 'nowhere'"));
}
