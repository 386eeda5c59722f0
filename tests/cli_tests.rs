//! Binary-level tests for the `evolver` CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn evolver(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("evolver");
    cmd.current_dir(dir.path())
        .env_remove("EVOLVER_CONFIG")
        .env_remove("EVOLVER_RPC_URL")
        .env_remove("EVOLVER_RELAY_URL")
        .env_remove("EVOLVER_GENESIS_ASSET")
        .env_remove("EVOLVER_STORE_PATH")
        .env_remove("EVOLVER_PORT")
        .env_remove("EVOLVER_ADMIN_TOKEN");
    cmd
}

#[test]
fn help_lists_commands() {
    let dir = TempDir::new().unwrap();
    evolver(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("recover"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn config_init_writes_defaults_once() {
    let dir = TempDir::new().unwrap();
    evolver(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created evolver.toml"));

    let written = fs::read_to_string(dir.path().join("evolver.toml")).unwrap();
    assert!(written.contains("graduation_threshold"));

    evolver(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    evolver(&dir).args(["config", "init", "--force"]).assert().success();
}

#[test]
fn config_show_applies_environment() {
    let dir = TempDir::new().unwrap();
    evolver(&dir)
        .args(["config", "show"])
        .env("EVOLVER_GENESIS_ASSET", "MintFromEnv")
        .env("EVOLVER_PORT", "9099")
        .assert()
        .success()
        .stdout(predicate::str::contains("MintFromEnv"))
        .stdout(predicate::str::contains("9099"));
}

#[test]
fn config_validate_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    evolver(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn config_validate_reports_problems() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("evolver.toml"),
        "[monitoring]\ngraduation_threshold = 1.5\n\n[distribution]\nbatch_size = 0\n",
    )
    .unwrap();
    evolver(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("graduation_threshold"))
        .stdout(predicate::str::contains("batch_size"));
}

#[test]
fn custom_config_path_is_honoured() {
    let dir = TempDir::new().unwrap();
    evolver(&dir)
        .args(["--config", "conf/custom.toml", "config", "init"])
        .assert()
        .success();
    assert!(dir.path().join("conf/custom.toml").exists());
}

#[test]
fn status_without_store_explains_itself() {
    let dir = TempDir::new().unwrap();
    evolver(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No state store"));
}

#[test]
fn recover_without_store_fails() {
    let dir = TempDir::new().unwrap();
    evolver(&dir).arg("recover").assert().failure();
}
