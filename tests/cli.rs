//! Argument validation of the two binaries.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn server_requires_all_four_arguments() {
    Command::cargo_bin("pipekv-server")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn server_rejects_zero_threads() {
    Command::cargo_bin("pipekv-server")
        .unwrap()
        .args(["/tmp", "0", "1", "srv-test-zero-threads"])
        .assert()
        .failure();
}

#[test]
fn server_rejects_zero_backups() {
    Command::cargo_bin("pipekv-server")
        .unwrap()
        .args(["/tmp", "1", "0", "srv-test-zero-backups"])
        .assert()
        .failure();
}

#[test]
fn client_requires_id_and_server_pipe() {
    Command::cargo_bin("pipekv-client")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}
