use std::{fs, path::Path};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let config_path = dir.join("forkq.yaml");
    let store_dir = dir.join("store");
    fs::write(
        &config_path,
        format!("store: {}\n{body}", store_dir.display()),
    )
    .expect("failed to write config");
    config_path
}

fn forkq(config_path: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("forkq"));
    cmd.env_remove("RUST_LOG")
        .arg("--config")
        .arg(config_path);
    cmd
}

#[test]
fn enqueued_jobs_are_listed() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(temp.path(), "");

    forkq(&config_path)
        .args(["enqueue", "--queue", "mailers", "echo", "hello"])
        .assert()
        .success()
        .stdout("1\n");
    forkq(&config_path)
        .args(["enqueue", "--priority", "-5", "true"])
        .assert()
        .success()
        .stdout("2\n");

    forkq(&config_path)
        .arg("jobs")
        .assert()
        .success()
        .stdout(predicate::str::contains("mailers"))
        .stdout(predicate::str::contains("echo hello"))
        .stdout(predicate::str::contains("-5"));

    forkq(&config_path)
        .args(["jobs", "--state", "finished"])
        .assert()
        .success()
        .stdout("No jobs.\n");
}

#[test]
fn delayed_job_shows_as_scheduled_in_json_status() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(temp.path(), "");

    forkq(&config_path)
        .args(["enqueue", "--in", "1h", "sleep", "1"])
        .assert()
        .success();

    let output = forkq(&config_path)
        .args(["status", "--json"])
        .output()
        .expect("failed to run status");
    assert!(output.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status output is JSON");
    assert_eq!(report["jobs"]["scheduled"], 1);
    assert_eq!(report["jobs"]["ready"], 0);
    assert_eq!(report["processes"].as_array().map(Vec::len), Some(0));
}

#[test]
fn status_table_without_processes() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(temp.path(), "");

    forkq(&config_path)
        .args(["status", "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No registered processes."))
        .stdout(predicate::str::contains(
            "Jobs: 0 scheduled, 0 ready, 0 claimed, 0 finished, 0 failed",
        ));
}

#[test]
fn missing_env_var_in_config_fails() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(
        temp.path(),
        "hooks:\n  worker:\n    on_start: \"echo ${FORKQ_CLI_TEST_UNSET_VARIABLE}\"\n",
    );

    forkq(&config_path)
        .env_remove("FORKQ_CLI_TEST_UNSET_VARIABLE")
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Missing environment variable: FORKQ_CLI_TEST_UNSET_VARIABLE",
        ));
}

#[test]
fn invalid_delay_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(temp.path(), "");

    forkq(&config_path)
        .args(["enqueue", "--in", "soon", "true"])
        .assert()
        .failure();
}

#[test]
fn stop_without_running_supervisor_succeeds() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(temp.path(), "");

    forkq(&config_path)
        .arg("stop")
        .assert()
        .success()
        .stderr(predicate::str::contains("No running forkq supervisor found"));
}

#[test]
fn default_store_lives_under_home_without_config() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path().join("home");
    let workdir = temp.path().join("work");
    fs::create_dir_all(&home).expect("failed to create home dir");
    fs::create_dir_all(&workdir).expect("failed to create work dir");

    Command::new(assert_cmd::cargo::cargo_bin!("forkq"))
        .env_remove("RUST_LOG")
        .env("HOME", &home)
        .current_dir(&workdir)
        .args(["enqueue", "true"])
        .assert()
        .success()
        .stdout("1\n");

    assert!(home.join(".local/share/forkq/store.json").exists());
}
