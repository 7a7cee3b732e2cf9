//! CLI-level integration tests. Exercise the binary as a subprocess rather
//! than calling into the library, since `run`/`list`/`validate`'s job is
//! wiring config loading, planning, and dispatch together correctly, not
//! any one piece of logic in isolation.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

const MINIMAL_CONFIG: &str = r#"
[runner]
workers = 2

[projects.default]
test_dir = "tests"
"#;

fn flotilla() -> Command {
    Command::cargo_bin("flotilla").unwrap()
}

#[test]
fn validate_accepts_a_well_formed_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("flotilla.toml");
    fs::write(&config_path, MINIMAL_CONFIG).unwrap();

    flotilla()
        .arg("--config")
        .arg(&config_path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration is valid"))
        .stdout(predicate::str::contains("project 'default'"));
}

#[test]
fn validate_rejects_malformed_toml() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("flotilla.toml");
    fs::write(&config_path, "not valid toml [[[").unwrap();

    flotilla()
        .arg("--config")
        .arg(&config_path)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn validate_without_config_flag_fails_outside_a_project_directory() {
    let dir = tempfile::tempdir().unwrap();

    flotilla()
        .current_dir(&dir)
        .arg("validate")
        .assert()
        .failure();
}

#[test]
fn list_against_an_empty_registry_reports_zero_tests() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("flotilla.toml");
    fs::write(&config_path, MINIMAL_CONFIG).unwrap();

    flotilla()
        .arg("--config")
        .arg(&config_path)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 tests in 0 buckets"));
}

#[test]
fn run_against_an_empty_registry_exits_clean() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("flotilla.toml");
    fs::write(&config_path, MINIMAL_CONFIG).unwrap();

    flotilla()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .assert()
        .success();
}

#[test]
fn shard_flag_rejects_a_malformed_value() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("flotilla.toml");
    fs::write(&config_path, MINIMAL_CONFIG).unwrap();

    flotilla()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .arg("--shard")
        .arg("not-a-shard")
        .assert()
        .failure();
}

#[test]
fn help_lists_the_run_list_and_validate_subcommands() {
    flotilla()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("validate"));
}
