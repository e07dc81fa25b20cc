//! CLI integration tests using assert_cmd.
//!
//! These tests invoke the actual `trm` binary and verify its output.

use assert_cmd::Command;
use predicates::prelude::*;

#[allow(deprecated)]
fn trm_cmd() -> Command {
    Command::cargo_bin("trm").expect("binary should exist")
}

#[test]
fn test_version_flag() {
    trm_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_help_flag() {
    trm_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transfer Restart Manager"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("add"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("pause"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("approve"))
        .stdout(predicate::str::contains("restart-failed"))
        .stdout(predicate::str::contains("cleanup-interrupted"))
        .stdout(predicate::str::contains("logs"))
        .stdout(predicate::str::contains("progress"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("stop"));
}

#[test]
fn test_add_help_shows_options() {
    trm_cmd()
        .args(["add", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--name"))
        .stdout(predicate::str::contains("--source"))
        .stdout(predicate::str::contains("--dest"))
        .stdout(predicate::str::contains("--tool"))
        .stdout(predicate::str::contains("--operation"))
        .stdout(predicate::str::contains("--exclude"))
        .stdout(predicate::str::contains("--max-retries"))
        .stdout(predicate::str::contains("--preview"));
}

#[test]
fn test_add_requires_source_and_destination() {
    trm_cmd()
        .args(["add", "--name", "photos"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--source"));
}

#[test]
fn test_add_rejects_unknown_tool() {
    trm_cmd()
        .args(["add", "-n", "x", "-s", "/a", "-d", "/b", "--tool", "scp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_start_help() {
    trm_cmd()
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--foreground"))
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--data-dir"));
}

#[test]
fn test_logs_help() {
    trm_cmd()
        .args(["logs", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--tail"));
}

#[test]
fn test_list_against_missing_daemon() {
    // Port 1 never serves the API.
    trm_cmd()
        .args(["--port", "1", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not connect"));
}

#[test]
fn test_no_subcommand_shows_help() {
    trm_cmd()
        .assert()
        .success()
        .stdout(predicate::str::contains("Transfer Restart Manager"));
}
