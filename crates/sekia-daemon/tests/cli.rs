// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for the `sekiad` binary's CLI surface.

use assert_cmd::Command;
use predicates::str::contains;

fn sekiad() -> Command {
    Command::cargo_bin("sekiad").expect("binary `sekiad` should be built")
}

#[test]
fn help_flag_prints_usage() {
    sekiad()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Sekia workflow daemon"))
        .stdout(contains("--config"));
}

#[test]
fn version_flag_prints_version() {
    sekiad()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_config_file_is_reported_and_exits_nonzero() {
    sekiad()
        .args(["--config", "/nonexistent/sekia.toml"])
        .assert()
        .failure();
}
